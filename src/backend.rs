//! Static registry of supported backends.
//!
//! Every backend belongs to exactly one dialect family, and the set of
//! vendors is closed: adding one means adding a variant here, a descriptor
//! entry, and a connector arm in `connector::ConnectorRegistry`.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class of query language a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectFamily {
    Relational,
    Document,
    Graph,
    ApiQuery,
}

impl DialectFamily {
    pub fn label(&self) -> &'static str {
        match self {
            DialectFamily::Relational => "relational",
            DialectFamily::Document => "document",
            DialectFamily::Graph => "graph",
            DialectFamily::ApiQuery => "api_query",
        }
    }
}

impl fmt::Display for DialectFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for DialectFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "sql" => Ok(DialectFamily::Relational),
            "document" | "nosql" => Ok(DialectFamily::Document),
            "graph" | "cypher" => Ok(DialectFamily::Graph),
            "api" | "api_query" | "api-query" | "graphql" => Ok(DialectFamily::ApiQuery),
            other => Err(format!("unknown dialect family: {other}")),
        }
    }
}

/// A concrete vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    CockroachDb,
    Redshift,
    MySql,
    CouchDb,
    Neo4j,
    GraphQl,
}

/// How a backend expects credentials to be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthShape {
    /// Username and password inside the wire protocol handshake.
    UserPassword,
    /// HTTP basic auth.
    BasicAuth,
    /// `Authorization: Bearer <token>`.
    BearerToken,
}

/// Identifier quoting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStyle {
    DoubleQuote,
    Backtick,
    None,
}

impl QuoteStyle {
    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_identifier(&self, ident: &str) -> String {
        match self {
            QuoteStyle::DoubleQuote => format!("\"{}\"", ident.replace('"', "\"\"")),
            QuoteStyle::Backtick => format!("`{}`", ident.replace('`', "``")),
            QuoteStyle::None => ident.to_string(),
        }
    }

    /// Whether `ident` must be quoted to be read back unchanged. Unquoted
    /// identifiers fold to lower case under double-quote rules.
    pub fn needs_quoting(&self, ident: &str) -> bool {
        let plain = |c: char| match self {
            QuoteStyle::DoubleQuote => c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_',
            QuoteStyle::Backtick => c.is_ascii_alphanumeric() || c == '_',
            QuoteStyle::None => true,
        };
        match self {
            QuoteStyle::None => false,
            _ => ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) || !ident.chars().all(plain),
        }
    }
}

/// Static per-vendor facts.
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub backend: Backend,
    pub id: &'static str,
    pub display_name: &'static str,
    pub family: DialectFamily,
    pub query_language: &'static str,
    pub default_port: u16,
    pub auth: AuthShape,
    pub quoting: QuoteStyle,
}

const DESCRIPTORS: &[BackendDescriptor] = &[
    BackendDescriptor {
        backend: Backend::Postgres,
        id: "postgres",
        display_name: "PostgreSQL",
        family: DialectFamily::Relational,
        query_language: "PostgreSQL SQL",
        default_port: 5432,
        auth: AuthShape::UserPassword,
        quoting: QuoteStyle::DoubleQuote,
    },
    BackendDescriptor {
        backend: Backend::CockroachDb,
        id: "cockroachdb",
        display_name: "CockroachDB",
        family: DialectFamily::Relational,
        query_language: "CockroachDB SQL (PostgreSQL-compatible)",
        default_port: 26257,
        auth: AuthShape::UserPassword,
        quoting: QuoteStyle::DoubleQuote,
    },
    BackendDescriptor {
        backend: Backend::Redshift,
        id: "redshift",
        display_name: "Amazon Redshift",
        family: DialectFamily::Relational,
        query_language: "Redshift SQL (PostgreSQL 8.0 based)",
        default_port: 5439,
        auth: AuthShape::UserPassword,
        quoting: QuoteStyle::DoubleQuote,
    },
    BackendDescriptor {
        backend: Backend::MySql,
        id: "mysql",
        display_name: "MySQL",
        family: DialectFamily::Relational,
        query_language: "MySQL SQL",
        default_port: 3306,
        auth: AuthShape::UserPassword,
        quoting: QuoteStyle::Backtick,
    },
    BackendDescriptor {
        backend: Backend::CouchDb,
        id: "couchdb",
        display_name: "Apache CouchDB",
        family: DialectFamily::Document,
        query_language: "CouchDB Mango JSON query",
        default_port: 5984,
        auth: AuthShape::BasicAuth,
        quoting: QuoteStyle::None,
    },
    BackendDescriptor {
        backend: Backend::Neo4j,
        id: "neo4j",
        display_name: "Neo4j",
        family: DialectFamily::Graph,
        query_language: "Cypher",
        default_port: 7474,
        auth: AuthShape::BasicAuth,
        quoting: QuoteStyle::Backtick,
    },
    BackendDescriptor {
        backend: Backend::GraphQl,
        id: "graphql",
        display_name: "GraphQL API",
        family: DialectFamily::ApiQuery,
        query_language: "GraphQL",
        default_port: 443,
        auth: AuthShape::BearerToken,
        quoting: QuoteStyle::None,
    },
];

impl Backend {
    pub const ALL: [Backend; 7] = [
        Backend::Postgres,
        Backend::CockroachDb,
        Backend::Redshift,
        Backend::MySql,
        Backend::CouchDb,
        Backend::Neo4j,
        Backend::GraphQl,
    ];

    pub fn descriptor(&self) -> &'static BackendDescriptor {
        // DESCRIPTORS holds one entry per variant, in declaration order.
        &DESCRIPTORS[*self as usize]
    }

    pub fn id(&self) -> &'static str {
        self.descriptor().id
    }

    pub fn family(&self) -> DialectFamily {
        self.descriptor().family
    }

    /// Identifier as it must be written in this backend's queries.
    pub fn render_identifier(&self, ident: &str) -> String {
        let quoting = self.descriptor().quoting;
        if quoting.needs_quoting(ident) {
            quoting.quote_identifier(ident)
        } else {
            ident.to_string()
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Backend::Postgres),
            "cockroachdb" | "cockroach" | "crdb" => Ok(Backend::CockroachDb),
            "redshift" => Ok(Backend::Redshift),
            "mysql" | "mariadb" => Ok(Backend::MySql),
            "couchdb" | "couch" => Ok(Backend::CouchDb),
            "neo4j" => Ok(Backend::Neo4j),
            "graphql" | "gql" => Ok(Backend::GraphQl),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// All descriptors, in a stable order.
pub fn descriptors() -> &'static [BackendDescriptor] {
    DESCRIPTORS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_table_matches_variants() {
        for backend in Backend::ALL {
            assert_eq!(backend.descriptor().backend, backend);
        }
        assert_eq!(descriptors().len(), Backend::ALL.len());
    }

    #[test]
    fn test_families() {
        assert_eq!(Backend::Postgres.family(), DialectFamily::Relational);
        assert_eq!(Backend::Redshift.family(), DialectFamily::Relational);
        assert_eq!(Backend::MySql.family(), DialectFamily::Relational);
        assert_eq!(Backend::CouchDb.family(), DialectFamily::Document);
        assert_eq!(Backend::Neo4j.family(), DialectFamily::Graph);
        assert_eq!(Backend::GraphQl.family(), DialectFamily::ApiQuery);
    }

    #[test]
    fn test_parse_backend_aliases() {
        assert_eq!("PostgreSQL".parse::<Backend>().unwrap(), Backend::Postgres);
        assert_eq!("pg".parse::<Backend>().unwrap(), Backend::Postgres);
        assert_eq!("crdb".parse::<Backend>().unwrap(), Backend::CockroachDb);
        assert_eq!("MariaDB".parse::<Backend>().unwrap(), Backend::MySql);
        assert_eq!(" gql ".parse::<Backend>().unwrap(), Backend::GraphQl);
        assert!("oracle".parse::<Backend>().is_err());
    }

    #[test]
    fn test_parse_family_aliases() {
        assert_eq!(
            "sql".parse::<DialectFamily>().unwrap(),
            DialectFamily::Relational
        );
        assert_eq!(
            "api-query".parse::<DialectFamily>().unwrap(),
            DialectFamily::ApiQuery
        );
        assert!("columnar".parse::<DialectFamily>().is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(QuoteStyle::DoubleQuote.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(QuoteStyle::Backtick.quote_identifier("my label"), "`my label`");
    }

    #[test]
    fn test_render_identifier_quotes_only_when_needed() {
        assert_eq!(Backend::Postgres.render_identifier("order_items"), "order_items");
        assert_eq!(Backend::Postgres.render_identifier("OrderItems"), "\"OrderItems\"");
        assert_eq!(Backend::Redshift.render_identifier("unit price"), "\"unit price\"");
        assert_eq!(Backend::MySql.render_identifier("OrderItems"), "OrderItems");
        assert_eq!(Backend::MySql.render_identifier("order-items"), "`order-items`");
        assert_eq!(Backend::Neo4j.render_identifier("Person"), "Person");
        assert_eq!(Backend::Neo4j.render_identifier("Film Crew"), "`Film Crew`");
        assert_eq!(Backend::GraphQl.render_identifier("Order Items"), "Order Items");
    }

    #[test]
    fn test_serde_ids_match_descriptor_ids() {
        for backend in Backend::ALL {
            let json = serde_json::to_string(&backend).unwrap();
            assert_eq!(json, format!("\"{}\"", backend.id()));
        }
    }
}
