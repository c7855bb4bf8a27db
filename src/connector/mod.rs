//! Polymorphic backend access.
//!
//! A [`Connector`] wraps one backend endpoint. The [`ConnectorRegistry`]
//! maps the closed [`Backend`] set onto concrete connectors and keeps one
//! pooled connector per profile address.
mod document;
mod graph;
mod graphql;
mod http;
mod mysql;
mod postgres;
mod profile;
mod value;

pub use document::DocumentConnector;
pub use graph::GraphConnector;
pub use graphql::GraphQlConnector;
pub use http::{classify_status, HttpEndpoint};
pub use mysql::{categorize_mysql_error, MySqlConnector};
pub use postgres::{categorize_sqlstate, PostgresConnector, SslMode};
pub use profile::{ConnectionProfile, Credentials, Secret};
pub use value::{CellValue, Row, RowSet};

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::ConnectorError;
use crate::schema::{CacheKey, SchemaDescriptor};

pub const DEFAULT_MAX_ROWS: usize = 1000;
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Bounds applied to a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    pub timeout: Duration,
}

impl ExecutionLimits {
    /// Rows a connector should fetch: one past the cap so truncation is visible.
    pub fn fetch_limit(&self) -> usize {
        self.max_rows.saturating_add(1)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

/// Run `work` under `timeout`; running out of time is a connection failure.
pub(crate) async fn with_deadline<T>(
    timeout: Duration,
    what: &str,
    work: impl Future<Output = Result<T, ConnectorError>>,
) -> Result<T, ConnectorError> {
    tokio::time::timeout(timeout, work)
        .await
        .map_err(|_| ConnectorError::connection(format!("{what} timed out after {}s", timeout.as_secs())))?
}

/// Pool and network settings shared by every connector the registry builds.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorSettings {
    pub pool_size: usize,
    pub timeout: Duration,
    /// Largest HTTP response body a connector will buffer.
    pub max_response_bytes: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn backend(&self) -> Backend;

    /// Establish (or verify) connectivity.
    async fn connect(&self) -> Result<(), ConnectorError>;

    /// Enumerate collections, their typed fields, and key or relationship edges.
    async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError>;

    /// Run one query, returning at most `limits.fetch_limit()` rows.
    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<RowSet, ConnectorError>;

    async fn close(&self);
}

/// Produces a connector for a resolved profile.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connector(&self, profile: &ConnectionProfile) -> Result<Arc<dyn Connector>, ConnectorError>;

    /// Close every connector handed out so far.
    async fn close_all(&self) {}
}

/// Default factory: one connector per (backend, host identity, database),
/// created on first use and kept for the life of the registry.
pub struct ConnectorRegistry {
    settings: ConnectorSettings,
    connectors: DashMap<CacheKey, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self {
            settings,
            connectors: DashMap::new(),
        }
    }

    fn build(&self, profile: &ConnectionProfile) -> Result<Arc<dyn Connector>, ConnectorError> {
        let connector: Arc<dyn Connector> = match profile.backend {
            Backend::Postgres | Backend::CockroachDb | Backend::Redshift => {
                Arc::new(PostgresConnector::new(profile, &self.settings)?)
            }
            Backend::MySql => Arc::new(MySqlConnector::new(profile, &self.settings)?),
            Backend::CouchDb => Arc::new(DocumentConnector::new(profile, &self.settings)?),
            Backend::Neo4j => Arc::new(GraphConnector::new(profile, &self.settings)?),
            Backend::GraphQl => Arc::new(GraphQlConnector::new(profile, &self.settings)?),
        };
        Ok(connector)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new(ConnectorSettings::default())
    }
}

#[async_trait]
impl ConnectorFactory for ConnectorRegistry {
    async fn connector(&self, profile: &ConnectionProfile) -> Result<Arc<dyn Connector>, ConnectorError> {
        let key = profile.cache_key();
        if let Some(existing) = self.connectors.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let candidate = self.build(profile)?;
        let winner = Arc::clone(
            self.connectors
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(&candidate))
                .value(),
        );
        if !Arc::ptr_eq(&winner, &candidate) {
            debug!(cache_key = %key, "reusing connector created concurrently");
            return Ok(winner);
        }

        if let Err(e) = winner.connect().await {
            self.connectors.remove(&key);
            return Err(e);
        }
        info!(backend = %profile.backend, cache_key = %key, "connector ready");
        Ok(winner)
    }

    async fn close_all(&self) {
        let connectors: Vec<Arc<dyn Connector>> =
            self.connectors.iter().map(|e| Arc::clone(e.value())).collect();
        self.connectors.clear();
        for connector in connectors {
            connector.close().await;
        }
    }
}
