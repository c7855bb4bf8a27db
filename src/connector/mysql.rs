//! MySQL connector (MySQL, MariaDB).
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use sqlx::mysql::{
    MySql, MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode,
};
use sqlx::{Column, Decode, Executor, Row, Statement, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, warn};

use super::postgres::{assemble_schema, ColumnRow, ForeignKeyRow, SslMode};
use super::profile::ConnectionProfile;
use super::value::{CellValue, RowSet};
use super::{with_deadline, Connector, ConnectorSettings, ExecutionLimits};
use crate::backend::Backend;
use crate::error::{ConnectorError, FailureKind};
use crate::schema::{RelationKind, SchemaDescriptor};

/// Connection settings resolved from a profile.
#[derive(Debug, Clone)]
struct MySqlConnectionConfig {
    host: String,
    port: u16,
    username: String,
    password: String,
    ssl_mode: SslMode,
    accept_invalid_certs: bool,
    ca_cert_path: Option<String>,
    /// Database to introspect; MySQL calls it a schema.
    schema: String,
}

impl MySqlConnectionConfig {
    fn from_profile(profile: &ConnectionProfile) -> Result<Self, ConnectorError> {
        let (host, port) = profile.host_port();
        let password = profile
            .credentials
            .resolve_secret()?
            .map(|s| s.expose().to_string())
            .unwrap_or_default();
        let ssl_mode = match profile.option("sslmode") {
            Some(raw) => raw.parse().map_err(ConnectorError::connection)?,
            None => SslMode::default(),
        };
        let schema = profile.option("schema").unwrap_or(&profile.database).to_string();
        if schema.is_empty() {
            return Err(ConnectorError::connection(
                "MySQL profiles need a database or a schema option",
            ));
        }
        Ok(Self {
            host,
            port,
            username: profile
                .credentials
                .username
                .clone()
                .unwrap_or_else(|| "root".to_string()),
            password,
            ssl_mode,
            accept_invalid_certs: profile.option_parsed("accept_invalid_certs", false)?,
            ca_cert_path: profile.option("ca_cert_path").map(str::to_string),
            schema,
        })
    }

    /// `Required` encrypts without checking the certificate, so it also
    /// covers `accept_invalid_certs`.
    fn driver_ssl_mode(&self) -> MySqlSslMode {
        match self.ssl_mode {
            SslMode::Disable => MySqlSslMode::Disabled,
            SslMode::Prefer => MySqlSslMode::Preferred,
            SslMode::Require => MySqlSslMode::Required,
            _ if self.accept_invalid_certs => MySqlSslMode::Required,
            SslMode::VerifyCa => MySqlSslMode::VerifyCa,
            SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.schema)
            .ssl_mode(self.driver_ssl_mode());
        if let Some(ca) = &self.ca_cert_path {
            options = options.ssl_ca(ca);
        }
        options
    }

    fn display_string(&self) -> String {
        format!("{}@{}:{}/{}", self.username, self.host, self.port, self.schema)
    }
}

/// Map a MySQL server error number to a failure kind.
pub fn categorize_mysql_error(number: u16) -> FailureKind {
    match number {
        // table, column, command and routine access denied
        1142 | 1143 | 1227 | 1370 => FailureKind::Permission,
        // too many connections, database access denied, bad credentials,
        // unknown database, shutdown, lock wait timeout, execution time exceeded
        1040 | 1044 | 1045 | 1049 | 1053 | 1205 | 3024 => FailureKind::Connection,
        // client-side connection errors
        2000..=2999 => FailureKind::Connection,
        _ => FailureKind::Syntax,
    }
}

fn classify_mysql_error(err: sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Database(db_err) => match db_err.try_downcast_ref::<MySqlDatabaseError>() {
            Some(mysql) => ConnectorError {
                kind: categorize_mysql_error(mysql.number()),
                message: format!("{} (error {})", mysql.message(), mysql.number()),
            },
            None => ConnectorError::connection(db_err.message().to_string()),
        },
        sqlx::Error::PoolTimedOut => ConnectorError::connection("timed out waiting for a connection"),
        sqlx::Error::ColumnDecode { index, source } => ConnectorError {
            kind: FailureKind::Syntax,
            message: format!("failed to decode column {index}: {source}"),
        },
        other => ConnectorError::connection(other.to_string()),
    }
}

pub struct MySqlConnector {
    config: MySqlConnectionConfig,
    pool: MySqlPool,
    /// Bound on catalog introspection.
    timeout: Duration,
}

impl MySqlConnector {
    /// Builds the pool without opening a connection; `connect` does that.
    pub fn new(profile: &ConnectionProfile, settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let config = MySqlConnectionConfig::from_profile(profile)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(u32::try_from(settings.pool_size.max(1)).unwrap_or(u32::MAX))
            .acquire_timeout(settings.timeout)
            .connect_lazy_with(config.connect_options());
        Ok(Self {
            config,
            pool,
            timeout: settings.timeout,
        })
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn backend(&self) -> Backend {
        Backend::MySql
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify_mysql_error)?;
        debug!(target = %self.config.display_string(), "connected");
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        let work = async {
            let schema = self.config.schema.as_str();
            let fetch = |sql: &'static str| async move {
                sqlx::query(sql)
                    .bind(schema)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(classify_mysql_error)
            };

            let relations = fetch(RELATIONS_SQL)
                .await?
                .iter()
                .map(|row| Ok((text(row, "name")?, relation_kind(&text(row, "table_type")?))))
                .collect::<Result<Vec<_>, ConnectorError>>()?;
            let columns = fetch(COLUMNS_SQL)
                .await?
                .iter()
                .map(|row| {
                    Ok(ColumnRow {
                        table: text(row, "table_name")?,
                        name: text(row, "name")?,
                        data_type: text(row, "data_type")?,
                        nullable: text(row, "is_nullable")? == "YES",
                    })
                })
                .collect::<Result<Vec<_>, ConnectorError>>()?;
            let keys = fetch(PRIMARY_KEYS_SQL)
                .await?
                .iter()
                .map(|row| Ok((text(row, "table_name")?, text(row, "column_name")?)))
                .collect::<Result<Vec<_>, ConnectorError>>()?;
            let foreign_keys = fetch(FOREIGN_KEYS_SQL)
                .await?
                .iter()
                .map(|row| {
                    Ok(ForeignKeyRow {
                        constraint: text(row, "constraint_name")?,
                        table: text(row, "table_name")?,
                        column: text(row, "column_name")?,
                        target_table: text(row, "target_table")?,
                        target_column: text(row, "target_column")?,
                    })
                })
                .collect::<Result<Vec<_>, ConnectorError>>()?;

            Ok::<_, ConnectorError>(assemble_schema(Backend::MySql, relations, columns, keys, foreign_keys))
        };
        with_deadline(self.timeout, "schema introspection", work).await
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<RowSet, ConnectorError> {
        let fetch = limits.fetch_limit();
        let work = async {
            let mut conn = self.pool.acquire().await.map_err(classify_mysql_error)?;
            let stmt = (&mut *conn).prepare(query).await.map_err(classify_mysql_error)?;
            let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
            let mut set = RowSet::new(columns);
            let mut stream = stmt.query().fetch(&mut *conn);
            while set.rows.len() < fetch {
                match stream.try_next().await.map_err(classify_mysql_error)? {
                    Some(row) => set.rows.push(row_values(&row)),
                    None => break,
                }
            }
            Ok::<_, ConnectorError>(set)
        };
        with_deadline(limits.timeout, "query", work).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

const RELATIONS_SQL: &str = r#"
    SELECT
        CAST(table_name AS CHAR) AS name,
        CAST(table_type AS CHAR) AS table_type
    FROM information_schema.tables
    WHERE table_schema = ?
    ORDER BY table_name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        CAST(table_name AS CHAR) AS table_name,
        CAST(column_name AS CHAR) AS name,
        CAST(column_type AS CHAR) AS data_type,
        CAST(is_nullable AS CHAR) AS is_nullable
    FROM information_schema.columns
    WHERE table_schema = ?
    ORDER BY table_name, ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT
        CAST(table_name AS CHAR) AS table_name,
        CAST(column_name AS CHAR) AS column_name
    FROM information_schema.key_column_usage
    WHERE table_schema = ?
      AND constraint_name = 'PRIMARY'
    ORDER BY table_name, ordinal_position
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        CAST(constraint_name AS CHAR) AS constraint_name,
        CAST(table_name AS CHAR) AS table_name,
        CAST(column_name AS CHAR) AS column_name,
        CAST(referenced_table_name AS CHAR) AS target_table,
        CAST(referenced_column_name AS CHAR) AS target_column
    FROM information_schema.key_column_usage
    WHERE table_schema = ?
      AND referenced_table_name IS NOT NULL
    ORDER BY constraint_name, ordinal_position
"#;

fn text(row: &MySqlRow, column: &str) -> Result<String, ConnectorError> {
    row.try_get::<String, _>(column).map_err(classify_mysql_error)
}

fn relation_kind(table_type: &str) -> RelationKind {
    match table_type {
        "VIEW" | "SYSTEM VIEW" => RelationKind::View,
        _ => RelationKind::Table,
    }
}

/// How a column of a given MySQL type is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoding {
    Bool,
    Signed,
    Unsigned,
    Float,
    Double,
    Text,
    Bytes,
    Date,
    Time,
    DateTime,
    Timestamp,
    Json,
}

fn decoding_for(type_name: &str) -> Option<Decoding> {
    let decoding = match type_name {
        "BOOLEAN" => Decoding::Bool,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => Decoding::Signed,
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED" | "BIGINT UNSIGNED" => {
            Decoding::Unsigned
        }
        "FLOAT" => Decoding::Float,
        "DOUBLE" => Decoding::Double,
        // DECIMAL travels as its exact decimal text.
        "DECIMAL" | "CHAR" | "VARCHAR" | "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            Decoding::Text
        }
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" | "GEOMETRY" => {
            Decoding::Bytes
        }
        "DATE" => Decoding::Date,
        "TIME" => Decoding::Time,
        "DATETIME" => Decoding::DateTime,
        "TIMESTAMP" => Decoding::Timestamp,
        "JSON" => Decoding::Json,
        _ => return None,
    };
    Some(decoding)
}

fn row_values(row: &MySqlRow) -> Vec<CellValue> {
    (0..row.columns().len()).map(|idx| extract_value(row, idx)).collect()
}

/// Decode without the driver's type compatibility check; `decoding_for`
/// already matched the wire type.
fn typed<'r, T, F>(row: &'r MySqlRow, idx: usize, wrap: F) -> CellValue
where
    T: Decode<'r, MySql>,
    F: FnOnce(T) -> CellValue,
{
    match row.try_get_unchecked::<Option<T>, _>(idx) {
        Ok(Some(v)) => wrap(v),
        Ok(None) => CellValue::Null,
        Err(e) => {
            warn!(column = idx, error = %e, "failed to decode column");
            CellValue::Unknown(e.to_string())
        }
    }
}

fn extract_value(row: &MySqlRow, idx: usize) -> CellValue {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return CellValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(e) => return CellValue::Unknown(e.to_string()),
    };
    match decoding_for(&type_name) {
        Some(Decoding::Bool) => typed(row, idx, CellValue::Bool),
        Some(Decoding::Signed) => typed(row, idx, CellValue::Int64),
        Some(Decoding::Unsigned) => typed(row, idx, |v: u64| match i64::try_from(v) {
            Ok(v) => CellValue::Int64(v),
            Err(_) => CellValue::Text(v.to_string()),
        }),
        Some(Decoding::Float) => typed(row, idx, CellValue::Float32),
        Some(Decoding::Double) => typed(row, idx, CellValue::Float64),
        Some(Decoding::Text) => typed(row, idx, CellValue::Text),
        Some(Decoding::Bytes) => typed(row, idx, CellValue::Bytes),
        Some(Decoding::Date) => typed::<NaiveDate, _>(row, idx, CellValue::Date),
        Some(Decoding::Time) => typed::<NaiveTime, _>(row, idx, CellValue::Time),
        Some(Decoding::DateTime) => typed::<NaiveDateTime, _>(row, idx, CellValue::DateTime),
        Some(Decoding::Timestamp) => typed::<DateTime<Utc>, _>(row, idx, CellValue::TimestampTz),
        Some(Decoding::Json) => typed(row, idx, CellValue::Json),
        None => match row.try_get_unchecked::<Option<String>, _>(idx) {
            Ok(Some(text)) => CellValue::Text(text),
            Ok(None) => CellValue::Null,
            Err(_) => CellValue::Unknown(type_name),
        },
    }
}
