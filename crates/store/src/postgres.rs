//! PostgreSQL domain store.
//!
//! Implements [`SchemaProvider`] and [`QueryExecutor`] with `sqlx`:
//! - reachability via `SELECT 1`
//! - a text description of every ordinary table of the configured schema,
//!   built from `pg_class`, `pg_description` and `information_schema.columns`
//! - static reference tables read whole
//! - arbitrary read queries, each row returned as a JSON object
//!
//! The pool connects lazily, so an unreachable server surfaces through
//! [`test_connection`](SchemaProvider::test_connection) rather than at startup.

use std::time::Duration;

use askdb_config::DatabaseConfig;
use askdb_core::{QueryExecutor, Row, RowSet, SchemaProvider, StaticTables, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row as _;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, error, info, warn};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const NO_DESCRIPTION: &str = "No description";

const SCHEMA_QUERY: &str = r#"
    SELECT
        c.relname::text AS table_name,
        COALESCE(tbl_desc.description, '') AS table_description,
        cols.column_name::text AS column_name,
        cols.data_type::text AS data_type,
        COALESCE(col_desc.description, '') AS column_description
    FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_description tbl_desc
            ON tbl_desc.objoid = c.oid AND tbl_desc.objsubid = 0
        JOIN information_schema.columns cols
            ON cols.table_name = c.relname
            AND cols.table_schema = n.nspname
        LEFT JOIN pg_description col_desc
            ON col_desc.objoid = c.oid AND col_desc.objsubid = cols.ordinal_position
    WHERE c.relkind = 'r'
        AND n.nspname = $1
    ORDER BY c.relname, cols.ordinal_position
"#;

/// One catalogue row of [`SCHEMA_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub table: String,
    pub table_description: String,
    pub column: String,
    pub data_type: String,
    pub column_description: String,
}

pub struct PostgresStore {
    pool: PgPool,
    schema: String,
    static_tables: Vec<String>,
}

/// Connection options set field by field, so credentials need no escaping.
pub fn connect_options(config: &DatabaseConfig) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.name);
    match &config.password {
        Some(password) => options.password(password),
        None => options,
    }
}

impl PostgresStore {
    /// Build a lazily connecting store from configuration.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(connect_options(config));

        info!(host = %config.host, port = config.port, schema = %config.schema, "PostgreSQL pool configured");
        Self::from_pool(pool, &config.schema, config.static_tables.clone())
    }

    /// Create from an existing connection pool.
    pub fn from_pool(pool: PgPool, schema: &str, static_tables: Vec<String>) -> Result<Self, StoreError> {
        validate_identifier(schema)?;
        for table in &static_tables {
            validate_identifier(table)?;
        }
        Ok(Self {
            pool,
            schema: schema.to_string(),
            static_tables,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        info!("Closing PostgreSQL pool");
        self.pool.close().await;
    }

    async fn fetch_rows(&self, query: &str) -> Result<RowSet, StoreError> {
        let wrapped = wrap_as_json_rows(query);
        let records = sqlx::query(&wrapped)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let value: Value = record
                .try_get(0)
                .map_err(|e| StoreError::QueryFailed(format!("decode row: {e}")))?;
            match value {
                Value::Object(map) => rows.push(map),
                other => {
                    let mut map = Row::new();
                    map.insert("value".into(), other);
                    rows.push(map);
                }
            }
        }
        Ok(RowSet::new(rows))
    }
}

#[async_trait]
impl SchemaProvider for PostgresStore {
    async fn test_connection(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                debug!("Database connection OK");
                true
            }
            Err(e) => {
                error!(error = %e, "Database connection failed");
                false
            }
        }
    }

    async fn schema_description(&self) -> Result<Option<String>, StoreError> {
        let records = sqlx::query(SCHEMA_QUERY)
            .bind(&self.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        let columns = records
            .iter()
            .map(|r| {
                Ok(ColumnInfo {
                    table: r.try_get("table_name")?,
                    table_description: r.try_get("table_description")?,
                    column: r.try_get("column_name")?,
                    data_type: r.try_get("data_type")?,
                    column_description: r.try_get("column_description")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| StoreError::Schema(format!("decode catalogue row: {e}")))?;

        info!(schema = %self.schema, columns = columns.len(), "Schema description loaded");
        Ok(format_schema(&columns))
    }

    async fn static_tables(&self) -> StaticTables {
        let mut tables = StaticTables::new();
        for table in &self.static_tables {
            let query = format!("SELECT * FROM \"{}\".\"{}\"", self.schema, table);
            match self.fetch_rows(&query).await {
                Ok(rows) => {
                    debug!(table = %table, rows = rows.len(), "Static table loaded");
                    tables.push(table.clone(), rows);
                }
                Err(e) => warn!(table = %table, error = %e, "Skipping static table"),
            }
        }
        tables
    }
}

#[async_trait]
impl QueryExecutor for PostgresStore {
    async fn execute(&self, query: &str) -> Result<RowSet, StoreError> {
        info!(query, "Executing query");
        let rows = self.fetch_rows(query).await.inspect_err(|e| {
            warn!(query, error = %e, "Query failed");
        })?;
        debug!(rows = rows.len(), "Query executed");
        Ok(rows)
    }
}

/// Accept plain SQL identifiers only: a letter or underscore, then
/// letters, digits or underscores.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Trim whitespace and trailing semicolons.
pub fn strip_terminator(query: &str) -> &str {
    query.trim().trim_end_matches(';').trim_end()
}

/// Wrap a query so every row comes back as one JSON object.
pub fn wrap_as_json_rows(query: &str) -> String {
    format!(
        "SELECT row_to_json(askdb_q) FROM ({}\n) AS askdb_q",
        strip_terminator(query)
    )
}

/// Render catalogue rows, already ordered by table, as the schema text.
/// No rows yields `None`.
pub fn format_schema(columns: &[ColumnInfo]) -> Option<String> {
    if columns.is_empty() {
        return None;
    }

    let describe = |s: &str| {
        if s.trim().is_empty() {
            NO_DESCRIPTION.to_string()
        } else {
            s.to_string()
        }
    };

    let mut out = Vec::new();
    let mut current: Option<&str> = None;
    for col in columns {
        if current != Some(col.table.as_str()) {
            if current.is_some() {
                out.push(String::new());
            }
            out.push(format!("Table: {}", col.table));
            out.push(format!("Description: {}", describe(&col.table_description)));
            out.push("Columns:".to_string());
            current = Some(col.table.as_str());
        }
        out.push(format!(
            " - {} ({}): {}",
            col.column,
            col.data_type,
            describe(&col.column_description)
        ));
    }
    out.push(String::new());
    Some(out.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(table: &str, column: &str, data_type: &str, desc: &str) -> ColumnInfo {
        ColumnInfo {
            table: table.into(),
            table_description: if table == "machines" { "Vending machines".into() } else { String::new() },
            column: column.into(),
            data_type: data_type.into(),
            column_description: desc.into(),
        }
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("weekly_collection").is_ok());
        assert!(validate_identifier("_t1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("roles; DROP TABLE x").is_err());
        assert!(validate_identifier("a\"b").is_err());
    }

    #[test]
    fn connect_options_take_raw_credentials() {
        let config = DatabaseConfig {
            host: "db.internal".into(),
            port: 5433,
            name: "vending/eu".into(),
            user: "bot@ops".into(),
            password: Some("p@ss word:/?".into()),
            ..DatabaseConfig::default()
        };
        let options = connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "bot@ops");
        assert_eq!(options.get_database(), Some("vending/eu"));
    }

    #[test]
    fn terminators_are_stripped() {
        assert_eq!(strip_terminator("SELECT 1;"), "SELECT 1");
        assert_eq!(strip_terminator("  SELECT 1 ;; \n"), "SELECT 1");
        assert_eq!(strip_terminator("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn queries_are_wrapped_for_json_rows() {
        let wrapped = wrap_as_json_rows("SELECT id FROM sales.machines;");
        assert_eq!(
            wrapped,
            "SELECT row_to_json(askdb_q) FROM (SELECT id FROM sales.machines\n) AS askdb_q"
        );
    }

    #[test]
    fn trailing_comment_does_not_swallow_wrapper() {
        let wrapped = wrap_as_json_rows("SELECT 1 -- note");
        assert!(wrapped.contains("-- note\n) AS askdb_q"));
    }

    #[test]
    fn schema_is_grouped_by_table() {
        let columns = vec![
            col("machines", "id", "integer", "Primary key"),
            col("machines", "city", "text", ""),
            col("roles", "name", "character varying", "Role name"),
        ];
        let text = format_schema(&columns).unwrap();
        let expected = "Table: machines\n\
            Description: Vending machines\n\
            Columns:\n \
            - id (integer): Primary key\n \
            - city (text): No description\n\
            \n\
            Table: roles\n\
            Description: No description\n\
            Columns:\n \
            - name (character varying): Role name\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn empty_schema_is_none() {
        assert!(format_schema(&[]).is_none());
    }

    #[tokio::test]
    async fn bad_static_table_name_rejected_at_construction() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://bot@localhost:5432/askdb")
            .unwrap();
        assert!(PostgresStore::from_pool(pool.clone(), "sales", vec!["roles".into()]).is_ok());
        assert!(matches!(
            PostgresStore::from_pool(pool, "sales", vec!["roles;--".into()]),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }
}
