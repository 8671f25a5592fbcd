use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Catalog query listing every user column, ordered so that equal schemas yield equal rows.
pub const SCHEMA_FINGERPRINT_QUERY: &str = r#"
    select
        table_schema::text as table_schema,
        table_name::text as table_name,
        column_name::text as column_name,
        data_type::text as data_type,
        (is_nullable = 'YES') as is_nullable,
        column_default::text as column_default,
        ordinal_position::int4 as ordinal_position
    from information_schema.columns
    where table_schema not in ('pg_catalog', 'information_schema')
        and table_schema not like 'pg_toast%'
        and table_schema not like 'pg_temp%'
    order by table_schema, table_name, ordinal_position
"#;

/// One column as seen in `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ColumnFingerprint {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub column_default: Option<String>,
    pub ordinal_position: i32,
}

impl ColumnFingerprint {
    /// Returns the schema-qualified table name.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.table_schema, self.table_name)
    }
}

/// Structure of a database's user tables, used to detect whether migrations changed anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFingerprint {
    columns: Vec<ColumnFingerprint>,
}

impl SchemaFingerprint {
    /// Creates a fingerprint, sorting the columns so that row order does not matter.
    pub fn new(mut columns: Vec<ColumnFingerprint>) -> Self {
        columns.sort_by(|a, b| {
            (&a.table_schema, &a.table_name, a.ordinal_position).cmp(&(
                &b.table_schema,
                &b.table_name,
                b.ordinal_position,
            ))
        });

        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnFingerprint] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the qualified names of tables that differ between `self` and `other`.
    ///
    /// Tables present on only one side are included.
    pub fn changed_tables(&self, other: &SchemaFingerprint) -> BTreeSet<String> {
        let tables: BTreeSet<String> = self
            .columns
            .iter()
            .chain(other.columns.iter())
            .map(ColumnFingerprint::qualified_table)
            .collect();

        tables
            .into_iter()
            .filter(|table| self.table_columns(table) != other.table_columns(table))
            .collect()
    }

    fn table_columns(&self, table: &str) -> Vec<&ColumnFingerprint> {
        self.columns
            .iter()
            .filter(|column| column.qualified_table() == table)
            .collect()
    }
}

/// Captures the schema fingerprint of the database behind `executor`.
#[cfg(feature = "sqlx")]
pub async fn fetch_schema_fingerprint<'e, E>(executor: E) -> Result<SchemaFingerprint, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let columns = sqlx::query_as::<_, ColumnFingerprint>(SCHEMA_FINGERPRINT_QUERY)
        .fetch_all(executor)
        .await?;

    Ok(SchemaFingerprint::new(columns))
}

/// Connects to `url` and captures its schema fingerprint.
#[cfg(feature = "sqlx")]
pub async fn schema_fingerprint(
    url: &str,
) -> Result<SchemaFingerprint, crate::driver::DriverError> {
    let pool = crate::driver::connect(url).await?;
    let fingerprint = fetch_schema_fingerprint(&pool).await;
    pool.close().await;

    Ok(fingerprint?)
}

/// Connects to `url` and captures its schema fingerprint.
#[cfg(not(feature = "sqlx"))]
pub async fn schema_fingerprint(
    _url: &str,
) -> Result<SchemaFingerprint, crate::driver::DriverError> {
    Err(crate::driver::DriverError::MissingDriver)
}
