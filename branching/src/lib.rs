//! Ephemeral Neon Postgres branches for test suites.
//!
//! Each test session gets its own copy-on-write branch of a Neon project, created before the
//! tests run and deleted afterwards. Parallel test workers agree on a single creator through the
//! filesystem, see [`coordination`], and [`session::NeonSession`] ties everything together.

mod macros;

pub mod branch;
pub mod coordination;
pub mod endpoint;
pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod naming;
pub mod provider;
pub mod retry;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use branch::Branch;
pub use config::shared::{NeonConfig, SharingPolicy};
pub use session::{NeonSession, SessionOptions};
