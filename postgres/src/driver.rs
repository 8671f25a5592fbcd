use thiserror::Error;

/// Feature enabling the driver helpers.
pub const DRIVER_FEATURE: &str = "sqlx";

#[derive(Debug, Error)]
pub enum DriverError {
    /// The crate was built without a database driver.
    #[error(
        "no database driver is available, enable it with `postgres = {{ features = [\"sqlx\"] }}` \
         or pass `Branch::connection_string` to a driver of your choice"
    )]
    MissingDriver,

    #[cfg(feature = "sqlx")]
    #[error("An error occurred while talking to the database: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(feature = "sqlx")]
pub use with_sqlx::*;

#[cfg(not(feature = "sqlx"))]
pub use without_driver::*;

#[cfg(feature = "sqlx")]
mod with_sqlx {
    use sqlx::postgres::{PgPool, PgPoolOptions};
    use sqlx::{Postgres, Transaction};
    use tracing::debug;

    use super::DriverError;

    /// A single-connection pool to a test branch.
    pub type Connection = PgPool;

    /// Opens a connection to the database at `url`.
    pub async fn connect(url: &str) -> Result<Connection, DriverError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect(url)
            .await?;

        Ok(pool)
    }

    /// A transaction that is never committed.
    ///
    /// All changes are rolled back and the connection closed by [`TestTransaction::rollback`],
    /// or rolled back when the value is dropped.
    pub struct TestTransaction {
        pool: PgPool,
        transaction: Transaction<'static, Postgres>,
    }

    impl TestTransaction {
        /// Returns the transaction to run queries on.
        pub fn transaction(&mut self) -> &mut Transaction<'static, Postgres> {
            &mut self.transaction
        }

        /// Rolls back every change and closes the connection.
        pub async fn rollback(self) -> Result<(), DriverError> {
            self.transaction.rollback().await?;
            self.pool.close().await;

            debug!("test transaction rolled back");

            Ok(())
        }
    }

    /// Connects to `url` and opens a transaction that is rolled back after use.
    pub async fn begin_test_transaction(url: &str) -> Result<TestTransaction, DriverError> {
        let pool = connect(url).await?;
        let transaction = pool.begin().await?;

        Ok(TestTransaction { pool, transaction })
    }
}

#[cfg(not(feature = "sqlx"))]
mod without_driver {
    use super::DriverError;

    /// Connection type of the enabled driver, uninhabited without one.
    #[derive(Debug)]
    pub enum Connection {}

    /// Transaction type of the enabled driver, uninhabited without one.
    #[derive(Debug)]
    pub enum TestTransaction {}

    pub async fn connect(_url: &str) -> Result<Connection, DriverError> {
        Err(DriverError::MissingDriver)
    }

    pub async fn begin_test_transaction(_url: &str) -> Result<TestTransaction, DriverError> {
        Err(DriverError::MissingDriver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_driver_message_names_the_feature() {
        let message = DriverError::MissingDriver.to_string();

        assert!(message.contains(r#"postgres = { features = ["sqlx"] }"#));
        assert!(message.contains("Branch::connection_string"));
    }

    #[cfg(not(feature = "sqlx"))]
    #[tokio::test]
    async fn test_helpers_fail_without_driver() {
        assert!(matches!(
            connect("postgresql://localhost/db").await,
            Err(DriverError::MissingDriver)
        ));
        assert!(matches!(
            begin_test_transaction("postgresql://localhost/db").await,
            Err(DriverError::MissingDriver)
        ));
    }
}
