//! Postgres helpers used on top of provisioned test branches.
//!
//! Database access is optional and gated behind the `sqlx` feature. Without it the helpers in
//! [`driver`] return [`driver::DriverError::MissingDriver`], while the schema fingerprint model
//! stays available so fingerprints can be cached and compared by any driver.

pub mod driver;
pub mod schema;

pub use schema::SchemaFingerprint;
