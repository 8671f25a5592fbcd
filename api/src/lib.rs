//! Raw surface of the Neon management API used to provision test branches.
//!
//! [`NeonApi`] is the seam the rest of the workspace programs against, [`HttpNeonClient`] is
//! its reqwest implementation. Retries are not performed here, callers decide how to handle
//! [`ApiError::is_rate_limited`] errors.

mod client;
mod error;
pub mod models;

pub use client::*;
pub use error::*;
