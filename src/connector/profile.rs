use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::backend::Backend;
use crate::error::ConnectorError;
use crate::schema::CacheKey;

/// A resolved credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// Where to find credentials, not the credentials themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable holding the password or token.
    #[serde(default)]
    pub secret_env: Option<String>,
    /// Secret handed over directly by the host; takes precedence over `secret_env`.
    #[serde(skip)]
    pub secret: Option<Secret>,
}

impl Credentials {
    pub fn resolve_secret(&self) -> Result<Option<Secret>, ConnectorError> {
        if let Some(secret) = &self.secret {
            return Ok(Some(secret.clone()));
        }
        match &self.secret_env {
            Some(var) => std::env::var(var).map(|v| Some(Secret(v))).map_err(|_| {
                ConnectorError::connection(format!("credential variable {var} is not set"))
            }),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub backend: Backend,
    /// Host, `host:port`, or a URL for HTTP backends.
    pub address: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Vendor options (`sslmode`, `schema`, `sample_size`, `header.<Name>`, ...).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionProfile {
    pub fn new(
        name: impl Into<String>,
        backend: Backend,
        address: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            address: address.into(),
            database: database.into(),
            credentials: Credentials::default(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    /// Parse an option, falling back to `default` when absent.
    pub fn option_parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConnectorError> {
        match self.option(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConnectorError::connection(format!("invalid value for option {key}"))),
            None => Ok(default),
        }
    }

    /// Normalized `host:port[/path]`: scheme and userinfo stripped, lowercase,
    /// default port filled in.
    pub fn host_identity(&self) -> String {
        let (scheme, rest) = split_scheme(self.address.trim());
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let mut identity = authority.to_ascii_lowercase();
        if !has_port(&identity) {
            identity.push_str(&format!(":{}", self.default_port(scheme)));
        }
        identity.push_str(path);
        identity
    }

    /// Host and port for wire-protocol backends.
    pub fn host_port(&self) -> (String, u16) {
        let (scheme, rest) = split_scheme(self.address.trim());
        let authority = rest.split('/').next().unwrap_or(rest);
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let default_port = self.default_port(scheme);
        if has_port(authority) {
            if let Some((host, port)) = authority.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    return (host.trim_matches(|c| c == '[' || c == ']').to_string(), port);
                }
            }
        }
        (
            authority.trim_matches(|c| c == '[' || c == ']').to_string(),
            default_port,
        )
    }

    /// Base URL for HTTP backends; a bare host gets `http://`, or `https://`
    /// when the backend's default port is 443.
    pub fn base_url(&self) -> String {
        let address = self.address.trim().trim_end_matches('/');
        if address.contains("://") {
            address.to_string()
        } else if self.backend.descriptor().default_port == 443 {
            format!("https://{address}")
        } else {
            format!("http://{address}")
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.backend, self.host_identity(), self.database.clone())
    }

    fn default_port(&self, scheme: Option<&str>) -> u16 {
        match scheme {
            Some("https") => 443,
            Some("http") => 80,
            _ => self.backend.descriptor().default_port,
        }
    }
}

fn split_scheme(address: &str) -> (Option<&str>, &str) {
    match address.find("://") {
        Some(idx) => (Some(&address[..idx]), &address[idx + 3..]),
        None => (None, address),
    }
}

fn has_port(authority: &str) -> bool {
    if authority.starts_with('[') {
        authority.contains("]:")
    } else {
        authority.contains(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_identity_fills_default_port() {
        let profile = ConnectionProfile::new("local", Backend::Postgres, "LocalHost", "shop");
        assert_eq!(profile.host_identity(), "localhost:5432");
        let profile = ConnectionProfile::new("crdb", Backend::CockroachDb, "db1", "shop");
        assert_eq!(profile.host_identity(), "db1:26257");
    }

    #[test]
    fn test_host_identity_strips_scheme_and_userinfo() {
        let profile = ConnectionProfile::new(
            "couch",
            Backend::CouchDb,
            "http://admin@Couch.Example.com:5984/",
            "",
        );
        assert_eq!(profile.host_identity(), "couch.example.com:5984");
    }

    #[test]
    fn test_host_identity_keeps_path_and_scheme_port() {
        let profile = ConnectionProfile::new(
            "api",
            Backend::GraphQl,
            "https://api.example.com/graphql",
            "",
        );
        assert_eq!(profile.host_identity(), "api.example.com:443/graphql");
    }

    #[test]
    fn test_same_address_spelled_differently_shares_cache_key() {
        let a = ConnectionProfile::new("a", Backend::Postgres, "DB.internal", "shop");
        let b = ConnectionProfile::new("b", Backend::Postgres, "db.internal:5432", "shop");
        assert_eq!(a.cache_key(), b.cache_key());
        let c = ConnectionProfile::new("c", Backend::Postgres, "db.internal:5432", "hr");
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_host_port() {
        let profile = ConnectionProfile::new("p", Backend::Redshift, "warehouse:5440", "dw");
        assert_eq!(profile.host_port(), ("warehouse".to_string(), 5440));
        let profile = ConnectionProfile::new("p", Backend::Redshift, "warehouse", "dw");
        assert_eq!(profile.host_port(), ("warehouse".to_string(), 5439));
        let profile = ConnectionProfile::new("p", Backend::Postgres, "[::1]:6543", "dw");
        assert_eq!(profile.host_port(), ("::1".to_string(), 6543));
    }

    #[test]
    fn test_base_url() {
        let profile = ConnectionProfile::new("n", Backend::Neo4j, "localhost:7474", "neo4j");
        assert_eq!(profile.base_url(), "http://localhost:7474");
        let profile = ConnectionProfile::new("g", Backend::GraphQl, "api.example.com/graphql", "");
        assert_eq!(profile.base_url(), "https://api.example.com/graphql");
    }

    #[test]
    fn test_secret_not_in_debug_or_json() {
        let mut profile = ConnectionProfile::new("p", Backend::Postgres, "localhost", "shop");
        profile.credentials.secret = Some(Secret::new("hunter2"));
        assert!(!format!("{:?}", profile).contains("hunter2"));
        assert!(!serde_json::to_string(&profile).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_missing_secret_env_is_connection_error() {
        let creds = Credentials {
            username: Some("app".into()),
            secret_env: Some("NLQUERY_TEST_SECRET_THAT_IS_NOT_SET".into()),
            secret: None,
        };
        let err = creds.resolve_secret().unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Connection);
    }

    #[test]
    fn test_option_parsed() {
        let profile = ConnectionProfile::new("c", Backend::CouchDb, "localhost", "")
            .with_option("sample_size", "25");
        assert_eq!(profile.option_parsed("sample_size", 100usize).unwrap(), 25);
        assert_eq!(profile.option_parsed("missing", 7usize).unwrap(), 7);
        let bad = profile.with_option("sample_size", "lots");
        assert!(bad.option_parsed("sample_size", 100usize).is_err());
    }

    #[test]
    fn test_profile_from_toml() {
        let profile: ConnectionProfile = toml::from_str(
            r#"
            name = "shop"
            backend = "postgres"
            address = "localhost"
            database = "shop"

            [credentials]
            username = "app"
            secret_env = "SHOP_PASSWORD"

            [options]
            sslmode = "disable"
            "#,
        )
        .unwrap();
        assert_eq!(profile.backend, Backend::Postgres);
        assert_eq!(profile.option("sslmode"), Some("disable"));
        assert_eq!(profile.credentials.username.as_deref(), Some("app"));
    }
}
