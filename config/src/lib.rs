//! Configuration for Neon test branch provisioning.
//!
//! Settings are resolved from CLI overrides, environment variables, an optional ini file and
//! built-in defaults, in that order of precedence. See [`load_neon_config`].

mod cli;
mod load;
pub mod shared;

pub use cli::*;
pub use load::*;
pub use shared::{NeonConfig, SharingPolicy, ValidationError};
