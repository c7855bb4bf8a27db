//! PostgreSQL wire-protocol connector (PostgreSQL, CockroachDB, Redshift).
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use futures::TryStreamExt;
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{NoTls, Row as PgRow};
use tracing::{debug, warn};

use super::profile::ConnectionProfile;
use super::value::{CellValue, RowSet};
use super::{with_deadline, Connector, ConnectorSettings, ExecutionLimits};
use crate::backend::Backend;
use crate::error::{ConnectorError, FailureKind};
use crate::schema::{Field, Relation, RelationKind, Relationship, SchemaDescriptor};

/// SSL/TLS connection modes.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            other => Err(format!("unknown sslmode: {other}")),
        }
    }
}

/// Connection settings resolved from a profile.
#[derive(Debug, Clone)]
struct PgConnectionConfig {
    host: String,
    port: u16,
    database: String,
    username: String,
    password: String,
    ssl_mode: SslMode,
    /// Skip certificate verification. Ignored for verify-ca/verify-full.
    accept_invalid_certs: bool,
    /// PEM file with extra root certificates.
    ca_cert_path: Option<String>,
    /// Namespace to introspect.
    schema: String,
}

impl PgConnectionConfig {
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
        Ok(Self {
            host,
            port,
            database: if profile.database.is_empty() {
                "postgres".to_string()
            } else {
                profile.database.clone()
            },
            username: profile
                .credentials
                .username
                .clone()
                .unwrap_or_else(|| "postgres".to_string()),
            password,
            ssl_mode,
            accept_invalid_certs: profile.option_parsed("accept_invalid_certs", false)?,
            ca_cert_path: profile.option("ca_cert_path").map(str::to_string),
            schema: profile.option("schema").unwrap_or("public").to_string(),
        })
    }

    /// libpq key=value form. verify-* modes are enforced by the TLS
    /// connector, so the driver only sees `require`.
    fn connection_string(&self, connect_timeout_secs: u64) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => "require",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode,
            connect_timeout_secs.max(1)
        )
    }

    fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Build a TLS connector with appropriate certificate configuration.
fn build_tls_connector(config: &PgConnectionConfig) -> Result<MakeTlsConnector, ConnectorError> {
    let strict_verify = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if config.ssl_mode == SslMode::VerifyCa {
            builder.danger_accept_invalid_hostnames(true);
        }
        if let Some(ca_path) = &config.ca_cert_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                ConnectorError::connection(format!("failed to read CA certificate file {ca_path}: {e}"))
            })?;
            let cert = native_tls::Certificate::from_pem(&pem)
                .map_err(|e| ConnectorError::connection(format!("invalid CA certificate: {e}")))?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| ConnectorError::connection(format!("failed to build TLS connector: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Map a SQLSTATE code to a failure kind.
pub fn categorize_sqlstate(code: &str) -> FailureKind {
    if code == "42501" {
        return FailureKind::Permission;
    }
    match code.get(..2) {
        // connection exception, invalid authorization, invalid catalog name,
        // insufficient resources, operator intervention, system error, internal error
        Some("08" | "28" | "3D" | "53" | "57" | "58" | "XX") => FailureKind::Connection,
        _ => FailureKind::Syntax,
    }
}

fn classify_pg_error(err: &tokio_postgres::Error) -> ConnectorError {
    if let Some(db_err) = err.as_db_error() {
        let kind = categorize_sqlstate(db_err.code().code());
        ConnectorError {
            kind,
            message: format!("{} (SQLSTATE {})", db_err.message(), db_err.code().code()),
        }
    } else {
        let detail = err
            .source()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string());
        ConnectorError::connection(detail)
    }
}

fn classify_pool_error(err: PoolError) -> ConnectorError {
    match err {
        PoolError::Backend(e) => classify_pg_error(&e),
        PoolError::Timeout(_) => ConnectorError::connection("timed out waiting for a connection"),
        other => ConnectorError::connection(other.to_string()),
    }
}

pub struct PostgresConnector {
    backend: Backend,
    config: PgConnectionConfig,
    pool: Pool,
    /// Bound on catalog introspection.
    timeout: Duration,
}

impl PostgresConnector {
    pub fn new(profile: &ConnectionProfile, settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        let config = PgConnectionConfig::from_profile(profile)?;
        let pg_config: tokio_postgres::Config = config
            .connection_string(settings.timeout.as_secs())
            .parse()
            .map_err(|e: tokio_postgres::Error| ConnectorError::connection(e.to_string()))?;
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match config.ssl_mode {
            SslMode::Disable => Manager::from_config(pg_config, NoTls, manager_config),
            _ => Manager::from_config(pg_config, build_tls_connector(&config)?, manager_config),
        };
        let pool = Pool::builder(manager)
            .max_size(settings.pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(settings.timeout))
            .create_timeout(Some(settings.timeout))
            .build()
            .map_err(|e| ConnectorError::connection(format!("failed to build pool: {e}")))?;

        Ok(Self {
            backend: profile.backend,
            config,
            pool,
            timeout: settings.timeout,
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, ConnectorError> {
        self.pool.get().await.map_err(classify_pool_error)
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await.map_err(|e| classify_pg_error(&e))?;
        debug!(target = %self.config.display_string(), "connected");
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        let work = async {
            let client = self.client().await?;
            let schema = self.config.schema.as_str();
            let map_err = |e: tokio_postgres::Error| classify_pg_error(&e);

            let relations: Vec<(String, RelationKind)> = client
                .query(RELATIONS_SQL, &[&schema])
                .await
                .map_err(map_err)?
                .iter()
                .map(|row| (row.get::<_, String>("name"), relation_kind(row.get("table_type"))))
                .collect();
            let columns: Vec<ColumnRow> = client
                .query(COLUMNS_SQL, &[&schema])
                .await
                .map_err(map_err)?
                .iter()
                .map(|row| ColumnRow {
                    table: row.get("table_name"),
                    name: row.get("name"),
                    data_type: row.get("data_type"),
                    nullable: row.get("is_nullable"),
                })
                .collect();
            let keys: Vec<(String, String)> = client
                .query(PRIMARY_KEYS_SQL, &[&schema])
                .await
                .map_err(map_err)?
                .iter()
                .map(|row| (row.get("table_name"), row.get("column_name")))
                .collect();
            let foreign_keys: Vec<ForeignKeyRow> = client
                .query(FOREIGN_KEYS_SQL, &[&schema])
                .await
                .map_err(map_err)?
                .iter()
                .map(|row| ForeignKeyRow {
                    constraint: row.get("constraint_name"),
                    table: row.get("table_name"),
                    column: row.get("column_name"),
                    target_table: row.get("target_table"),
                    target_column: row.get("target_column"),
                })
                .collect();

            Ok::<_, ConnectorError>(assemble_schema(self.backend, relations, columns, keys, foreign_keys))
        };
        with_deadline(self.timeout, "schema introspection", work).await
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<RowSet, ConnectorError> {
        let fetch = limits.fetch_limit();
        let work = async {
            let client = self.client().await?;
            let stmt = client.prepare(query).await.map_err(|e| classify_pg_error(&e))?;
            let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
            let mut set = RowSet::new(columns);
            let stream = client
                .query_raw(&stmt, std::iter::empty::<String>())
                .await
                .map_err(|e| classify_pg_error(&e))?;
            futures::pin_mut!(stream);
            while set.rows.len() < fetch {
                match stream.try_next().await.map_err(|e| classify_pg_error(&e))? {
                    Some(row) => set.rows.push(row_values(&row)),
                    None => break,
                }
            }
            Ok::<_, ConnectorError>(set)
        };
        with_deadline(limits.timeout, "query", work).await
    }

    async fn close(&self) {
        self.pool.close();
    }
}

const RELATIONS_SQL: &str = r#"
    SELECT
        c.relname::text AS name,
        CASE c.relkind
            WHEN 'v' THEN 'view'
            WHEN 'm' THEN 'materialized_view'
            WHEN 'f' THEN 'foreign_table'
            ELSE 'table'
        END AS table_type
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
    ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        c.table_name::text AS table_name,
        c.column_name::text AS name,
        c.data_type::text AS data_type,
        c.is_nullable = 'YES' AS is_nullable
    FROM information_schema.columns c
    WHERE c.table_schema = $1
    ORDER BY c.table_name, c.ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT
        kcu.table_name::text AS table_name,
        kcu.column_name::text AS column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
        AND tc.table_name = kcu.table_name
    WHERE tc.constraint_type = 'PRIMARY KEY'
      AND tc.table_schema = $1
    ORDER BY kcu.table_name, kcu.ordinal_position
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        tc.constraint_name::text AS constraint_name,
        kcu.table_name::text AS table_name,
        kcu.column_name::text AS column_name,
        ccu.table_name::text AS target_table,
        ccu.column_name::text AS target_column
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
        ON ccu.constraint_name = tc.constraint_name
        AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY'
      AND tc.table_schema = $1
    ORDER BY tc.constraint_name, kcu.ordinal_position
"#;

fn relation_kind(table_type: &str) -> RelationKind {
    match table_type {
        "view" => RelationKind::View,
        "materialized_view" => RelationKind::MaterializedView,
        "foreign_table" => RelationKind::ForeignTable,
        _ => RelationKind::Table,
    }
}

pub(super) struct ColumnRow {
    pub(super) table: String,
    pub(super) name: String,
    pub(super) data_type: String,
    pub(super) nullable: bool,
}

pub(super) struct ForeignKeyRow {
    pub(super) constraint: String,
    pub(super) table: String,
    pub(super) column: String,
    pub(super) target_table: String,
    pub(super) target_column: String,
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

pub(super) fn assemble_schema(
    backend: Backend,
    relations: Vec<(String, RelationKind)>,
    columns: Vec<ColumnRow>,
    keys: Vec<(String, String)>,
    foreign_keys: Vec<ForeignKeyRow>,
) -> SchemaDescriptor {
    let mut by_name: BTreeMap<String, Relation> = relations
        .into_iter()
        .map(|(name, kind)| (name.clone(), Relation::new(name, kind)))
        .collect();

    for col in columns {
        if let Some(rel) = by_name.get_mut(&col.table) {
            let mut field = Field::new(col.name, col.data_type);
            field.nullable = col.nullable;
            rel.fields.push(field);
        }
    }
    for (table, column) in keys {
        if let Some(rel) = by_name.get_mut(&table) {
            push_unique(&mut rel.keys, column);
        }
    }

    let mut edges: BTreeMap<(String, String), Relationship> = BTreeMap::new();
    for fk in foreign_keys {
        let edge = edges
            .entry((fk.table.clone(), fk.constraint.clone()))
            .or_insert_with(|| Relationship {
                fields: Vec::new(),
                target: fk.target_table.clone(),
                target_fields: Vec::new(),
                label: Some(fk.constraint.clone()),
            });
        push_unique(&mut edge.fields, fk.column);
        push_unique(&mut edge.target_fields, fk.target_column);
    }
    for ((table, _), edge) in edges {
        if let Some(rel) = by_name.get_mut(&table) {
            rel.relationships.push(edge);
        }
    }

    SchemaDescriptor::new(backend, by_name.into_values().collect())
}

/// Accepts any column type and hands back the raw binary value.
struct RawValue(Option<Vec<u8>>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawValue(Some(raw.to_vec())))
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawValue(None))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn row_values(row: &PgRow) -> Vec<CellValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| extract_value(row, i, col.type_()))
        .collect()
}

fn typed<'a, T, F>(row: &'a PgRow, idx: usize, wrap: F) -> CellValue
where
    T: FromSql<'a>,
    F: FnOnce(T) -> CellValue,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => wrap(v),
        Ok(None) => CellValue::Null,
        Err(e) => {
            warn!(column = idx, error = %e, "failed to decode column");
            CellValue::Unknown(e.to_string())
        }
    }
}

fn extract_value(row: &PgRow, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => typed(row, idx, CellValue::Bool),
        Type::INT2 => typed(row, idx, CellValue::Int16),
        Type::INT4 => typed(row, idx, CellValue::Int32),
        Type::INT8 => typed(row, idx, CellValue::Int64),
        Type::OID => typed(row, idx, |v: u32| CellValue::Int64(v as i64)),
        Type::FLOAT4 => typed(row, idx, CellValue::Float32),
        Type::FLOAT8 => typed(row, idx, CellValue::Float64),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR | Type::UNKNOWN => {
            typed(row, idx, CellValue::Text)
        }
        Type::BYTEA => typed(row, idx, CellValue::Bytes),
        Type::DATE => typed(row, idx, CellValue::Date),
        Type::TIME => typed(row, idx, CellValue::Time),
        Type::TIMESTAMP => typed(row, idx, CellValue::DateTime),
        Type::TIMESTAMPTZ => typed(row, idx, CellValue::TimestampTz),
        Type::JSON | Type::JSONB => typed(row, idx, CellValue::Json),
        Type::BOOL_ARRAY => array(row, idx, CellValue::Bool),
        Type::INT2_ARRAY => array(row, idx, CellValue::Int16),
        Type::INT4_ARRAY => array(row, idx, CellValue::Int32),
        Type::INT8_ARRAY => array(row, idx, CellValue::Int64),
        Type::FLOAT8_ARRAY => array(row, idx, CellValue::Float64),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array(row, idx, CellValue::Text),
        _ => raw_value(row, idx, pg_type),
    }
}

fn array<'a, T, F>(row: &'a PgRow, idx: usize, wrap: F) -> CellValue
where
    T: FromSql<'a>,
    F: Fn(T) -> CellValue,
{
    typed(row, idx, |items: Vec<Option<T>>| {
        CellValue::Array(
            items
                .into_iter()
                .map(|item| item.map(&wrap).unwrap_or(CellValue::Null))
                .collect(),
        )
    })
}

/// Fallback for types without a native mapping: numerics are decoded exactly,
/// text-like payloads (enums, citext, ...) come through as text.
fn raw_value(row: &PgRow, idx: usize, pg_type: &Type) -> CellValue {
    let raw = match row.try_get::<_, RawValue>(idx) {
        Ok(RawValue(Some(raw))) => raw,
        Ok(RawValue(None)) => return CellValue::Null,
        Err(_) => return CellValue::Unknown(pg_type.name().to_string()),
    };
    if *pg_type == Type::NUMERIC {
        return decode_numeric(&raw)
            .map(CellValue::Text)
            .unwrap_or_else(|| CellValue::Unknown(pg_type.name().to_string()));
    }
    match String::from_utf8(raw) {
        Ok(text) => CellValue::Text(text),
        Err(_) => CellValue::Unknown(pg_type.name().to_string()),
    }
}

/// Decode the binary NUMERIC format (base-10000 digit groups) into its exact
/// decimal text.
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*raw.get(i)?, *raw.get(i + 1)?]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i32;
    let sign = word(4)?;
    let dscale = word(6)? as usize;
    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }
    let digits: Vec<u16> = (0..ndigits)
        .map(|i| word(8 + i * 2))
        .collect::<Option<_>>()?;
    let digit = |g: i32| -> u16 {
        if g < 0 {
            0
        } else {
            digits.get(g as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == 0x4000 && digits.iter().any(|d| *d != 0) {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for g in 0..=weight {
            if g == 0 {
                out.push_str(&digit(g).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(g)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut g = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(g)));
            g += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}
