//! CouchDB connector: databases are collections, queries are Mango `_find`
//! requests.
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::http::HttpEndpoint;
use super::profile::ConnectionProfile;
use super::value::RowSet;
use super::{Connector, ConnectorSettings, ExecutionLimits};
use crate::backend::Backend;
use crate::error::ConnectorError;
use crate::schema::{Field, Relation, RelationKind, SchemaDescriptor};

const DEFAULT_SAMPLE_SIZE: usize = 100;

/// The JSON candidate a document-family model response must contain.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MangoQuery {
    #[serde(default)]
    pub collection: Option<String>,
    pub selector: Value,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub sort: Option<Value>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub skip: Option<usize>,
}

impl MangoQuery {
    pub fn parse(text: &str) -> Result<Self, ConnectorError> {
        let query: MangoQuery = serde_json::from_str(text)
            .map_err(|e| ConnectorError::syntax(format!("invalid Mango query: {e}")))?;
        if !query.selector.is_object() {
            return Err(ConnectorError::syntax("selector must be a JSON object"));
        }
        Ok(query)
    }

    /// `_find` request body with the limit clamped to `fetch`.
    fn find_body(&self, fetch: usize) -> Value {
        let mut body = Map::new();
        body.insert("selector".into(), self.selector.clone());
        if let Some(fields) = &self.fields {
            body.insert("fields".into(), json!(fields));
        }
        if let Some(sort) = &self.sort {
            body.insert("sort".into(), sort.clone());
        }
        let limit = self.limit.map_or(fetch, |l| l.min(fetch));
        body.insert("limit".into(), json!(limit));
        if let Some(skip) = self.skip {
            body.insert("skip".into(), json!(skip));
        }
        Value::Object(body)
    }
}

pub struct DocumentConnector {
    endpoint: HttpEndpoint,
    database: Option<String>,
    sample_size: usize,
}

impl DocumentConnector {
    pub fn new(profile: &ConnectionProfile, settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        Ok(Self {
            endpoint: HttpEndpoint::from_profile(profile, settings)?,
            database: Some(profile.database.clone()).filter(|d| !d.is_empty()),
            sample_size: profile.option_parsed("sample_size", DEFAULT_SAMPLE_SIZE)?,
        })
    }

    async fn collections(&self) -> Result<Vec<String>, ConnectorError> {
        if let Some(db) = &self.database {
            return Ok(vec![db.clone()]);
        }
        let listing = self.endpoint.get_json(&["_all_dbs"]).await?;
        Ok(listing
            .as_array()
            .map(|dbs| {
                dbs.iter()
                    .filter_map(Value::as_str)
                    .filter(|name| !name.starts_with('_'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe(&self, collection: &str) -> Result<Relation, ConnectorError> {
        let sample = self
            .endpoint
            .post_json(
                &[collection, "_find"],
                &json!({ "selector": {}, "limit": self.sample_size }),
            )
            .await?;
        let docs = sample
            .get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let indexes = self.endpoint.get_json(&[collection, "_index"]).await?;

        Ok(Relation::new(collection, RelationKind::Collection)
            .with_fields(infer_fields(&docs))
            .with_keys(index_keys(&indexes)))
    }
}

#[async_trait]
impl Connector for DocumentConnector {
    fn backend(&self) -> Backend {
        Backend::CouchDb
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        // Connections are opened lazily by the HTTP pool.
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        let mut relations = Vec::new();
        for collection in self.collections().await? {
            relations.push(self.describe(&collection).await?);
        }
        Ok(SchemaDescriptor::new(Backend::CouchDb, relations))
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<RowSet, ConnectorError> {
        let mango = MangoQuery::parse(query)?;
        let collection = mango
            .collection
            .clone()
            .or_else(|| self.database.clone())
            .ok_or_else(|| ConnectorError::syntax("query does not name a collection"))?;
        let body = mango.find_body(limits.fetch_limit());
        debug!(collection = %collection, "running _find");

        let request = self
            .endpoint
            .request(reqwest::Method::POST, self.endpoint.url(&[collection.as_str(), "_find"])?)
            .timeout(limits.timeout)
            .json(&body);
        let response = self.endpoint.send_json(request).await?;
        let docs = response
            .get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows_from_docs(docs, mango.fields.as_deref(), limits.fetch_limit()))
    }

    async fn close(&self) {}
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Infer fields from sampled documents. A field missing from some documents,
/// or null in any, is nullable; conflicting types are reported as `mixed`.
fn infer_fields(docs: &[Value]) -> Vec<Field> {
    let mut seen: BTreeMap<String, (Option<&'static str>, usize, bool)> = BTreeMap::new();
    let objects: Vec<&Map<String, Value>> = docs.iter().filter_map(Value::as_object).collect();
    for obj in &objects {
        for (name, value) in obj.iter() {
            if name.starts_with('_') && name != "_id" {
                continue;
            }
            let entry = seen.entry(name.clone()).or_insert((None, 0, false));
            entry.1 += 1;
            if value.is_null() {
                entry.2 = true;
                continue;
            }
            let ty = json_type(value);
            entry.0 = match entry.0 {
                None => Some(ty),
                Some(prev) if prev == ty => Some(prev),
                Some(_) => Some("mixed"),
            };
        }
    }
    seen.into_iter()
        .map(|(name, (ty, count, saw_null))| {
            let mut field = Field::new(name, ty.unwrap_or("null"));
            field.nullable = saw_null || count < objects.len();
            field
        })
        .collect()
}

/// Field names covered by the collection's indexes, in index order.
fn index_keys(indexes: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    let defs = indexes
        .get("indexes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for index in defs {
        let fields = index
            .pointer("/def/fields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for field in fields {
            if let Some(name) = field.as_object().and_then(|o| o.keys().next()) {
                if !keys.contains(name) {
                    keys.push(name.clone());
                }
            }
        }
    }
    keys
}

fn rows_from_docs(docs: Vec<Value>, fields: Option<&[String]>, fetch: usize) -> RowSet {
    let objects: Vec<Map<String, Value>> = docs
        .into_iter()
        .take(fetch)
        .filter_map(|doc| match doc {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();
    let mut set = RowSet::from_objects(objects);
    if let Some(fields) = fields {
        // Requested projection order wins over first-seen order.
        let order: Vec<usize> = fields
            .iter()
            .filter_map(|f| set.columns.iter().position(|c| c == f))
            .collect();
        if order.len() == set.columns.len() {
            set.columns = order.iter().map(|&i| set.columns[i].clone()).collect();
            for row in &mut set.rows {
                *row = order.iter().map(|&i| row[i].clone()).collect();
            }
        }
    }
    set
}
