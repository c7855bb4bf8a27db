use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::backend::Backend;

/// What kind of named collection a relation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Table,
    View,
    MaterializedView,
    ForeignTable,
    Collection,
    NodeLabel,
    RelationshipType,
    ObjectType,
}

impl RelationKind {
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::Table => "TABLE",
            RelationKind::View => "VIEW",
            RelationKind::MaterializedView => "MVIEW",
            RelationKind::ForeignTable => "FOREIGN",
            RelationKind::Collection => "COLLECTION",
            RelationKind::NodeLabel => "NODE",
            RelationKind::RelationshipType => "EDGE",
            RelationKind::ObjectType => "TYPE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// An edge from one relation to another (foreign key, graph edge, nested type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Fields on this relation (empty when the backend has no key columns).
    #[serde(default)]
    pub fields: Vec<String>,
    pub target: String,
    #[serde(default)]
    pub target_fields: Vec<String>,
    /// Edge label, e.g. a graph relationship type or a GraphQL field name.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Relation {
    pub fn new(name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            keys: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One coherent snapshot of a backend's structure. Replaced wholesale on
/// refresh, never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub backend: Backend,
    pub relations: Vec<Relation>,
    pub introspected_at: DateTime<Utc>,
}

impl SchemaDescriptor {
    /// Build a descriptor, ordering relations by name.
    pub fn new(backend: Backend, mut relations: Vec<Relation>) -> Self {
        relations.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            backend,
            relations,
            introspected_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn collection_count(&self) -> usize {
        self.relations.len()
    }
}

/// Composite address of one cached schema: (dialect, host identity, database).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub backend: Backend,
    pub host: String,
    pub database: String,
}

impl CacheKey {
    pub fn new(backend: Backend, host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            backend,
            host: host.into(),
            database: database.into(),
        }
    }

    /// File name stem used by the persistent store: the backend id and a
    /// SHA-256 digest of the key's components.
    pub fn file_stem(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [self.backend.id(), self.host.as_str(), self.database.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{}-{:x}", self.backend.id(), hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.backend.id(), self.host, self.database)
    }
}
