//! Neo4j connector over the HTTP transaction endpoint.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::http::HttpEndpoint;
use super::profile::ConnectionProfile;
use super::value::{CellValue, RowSet};
use super::{Connector, ConnectorSettings, ExecutionLimits};
use crate::backend::{Backend, DialectFamily};
use crate::error::ConnectorError;
use crate::schema::{Field, Relation, RelationKind, Relationship, SchemaDescriptor};
use crate::synth::mask_literals;

const DEFAULT_DATABASE: &str = "neo4j";
const DEFAULT_EDGE_SAMPLE: usize = 10_000;

const NODE_PROPERTIES: &str = "CALL db.schema.nodeTypeProperties() \
     YIELD nodeLabels, propertyName, propertyTypes, mandatory \
     RETURN nodeLabels, propertyName, propertyTypes, mandatory";
const REL_PROPERTIES: &str = "CALL db.schema.relTypeProperties() \
     YIELD relType, propertyName, propertyTypes, mandatory \
     RETURN relType, propertyName, propertyTypes, mandatory";
const EDGE_SAMPLE: &str = "MATCH (a)-[r]->(b) WITH a, r, b LIMIT $sample \
     RETURN DISTINCT labels(a) AS source, type(r) AS rel, labels(b) AS target";

static TRAILING_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\s*$").unwrap());
static UNION_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUNION\b").unwrap());
static RETURN_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bRETURN\b").unwrap());
static YIELD_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bYIELD\b").unwrap());
static PROCEDURE_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^CALL\s+[A-Za-z_]").unwrap());

/// One statement's result from the transaction endpoint.
#[derive(Debug, Default, PartialEq)]
struct StatementResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

pub struct GraphConnector {
    endpoint: HttpEndpoint,
    database: String,
    edge_sample: usize,
}

impl GraphConnector {
    pub fn new(profile: &ConnectionProfile, settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        Ok(Self {
            endpoint: HttpEndpoint::from_profile(profile, settings)?,
            database: if profile.database.is_empty() {
                DEFAULT_DATABASE.to_string()
            } else {
                profile.database.clone()
            },
            edge_sample: profile.option_parsed("edge_sample", DEFAULT_EDGE_SAMPLE)?,
        })
    }

    async fn commit(
        &self,
        statements: Value,
        timeout: Option<std::time::Duration>,
    ) -> Result<Vec<StatementResult>, ConnectorError> {
        let url = self.endpoint.url(&["db", self.database.as_str(), "tx", "commit"])?;
        let mut request = self
            .endpoint
            .request(reqwest::Method::POST, url)
            .json(&json!({ "statements": statements }));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        parse_tx_response(&self.endpoint.send_json(request).await?)
    }
}

#[async_trait]
impl Connector for GraphConnector {
    fn backend(&self) -> Backend {
        Backend::Neo4j
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        // Connections are opened lazily by the HTTP pool.
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        let statements = json!([
            { "statement": NODE_PROPERTIES },
            { "statement": REL_PROPERTIES },
            { "statement": EDGE_SAMPLE, "parameters": { "sample": self.edge_sample } },
        ]);
        let mut results = self.commit(statements, None).await?.into_iter();
        let nodes = results.next().unwrap_or_default();
        let rels = results.next().unwrap_or_default();
        let edges = results.next().unwrap_or_default();
        Ok(SchemaDescriptor::new(
            Backend::Neo4j,
            assemble_graph_schema(&nodes, &rels, &edges),
        ))
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<RowSet, ConnectorError> {
        let fetch = limits.fetch_limit();
        let statement = cap_rows(query, fetch);
        debug!(statement = %statement, "running cypher");
        let result = self
            .commit(json!([{ "statement": statement }]), Some(limits.timeout))
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut set = RowSet::new(result.columns);
        set.rows = result
            .rows
            .into_iter()
            .take(fetch)
            .map(|row| row.into_iter().map(CellValue::from_json).collect())
            .collect();
        Ok(set)
    }

    async fn close(&self) {}
}

/// Ensure the statement returns at most `fetch` rows. Trailing comments are
/// dropped first. A UNION is wrapped in a subquery so the cap covers every
/// branch. Otherwise a trailing `LIMIT n` is tightened or one is appended.
/// A standalone procedure call without YIELD cannot take a LIMIT; its rows
/// are capped after they arrive.
fn cap_rows(query: &str, fetch: usize) -> String {
    let chars: Vec<char> = query.chars().collect();
    let masked: Vec<char> = mask_literals(query, DialectFamily::Graph).chars().collect();
    let end = masked.iter().rposition(|c| !c.is_whitespace()).map_or(0, |i| i + 1);
    let start = masked.iter().position(|c| !c.is_whitespace()).unwrap_or(end);
    let query: String = chars[start..end].iter().collect();
    let code: String = masked[start..end].iter().collect();

    if UNION_WORD.is_match(&code) {
        return format!("CALL {{\n{query}\n}}\nRETURN * LIMIT {fetch}");
    }
    if PROCEDURE_CALL.is_match(&code) && !RETURN_WORD.is_match(&code) {
        if !YIELD_WORD.is_match(&code) {
            return query;
        }
        return format!("{query} RETURN * LIMIT {fetch}");
    }
    if let Some(caps) = TRAILING_LIMIT.captures(&query) {
        let within = caps[1].parse::<usize>().map(|n| n <= fetch).unwrap_or(false);
        if within {
            return query;
        }
        let start = caps.get(0).map_or(query.len(), |m| m.start());
        return format!("{}LIMIT {fetch}", &query[..start]);
    }
    format!("{query} LIMIT {fetch}")
}

/// Map a Neo4j status code to a failure kind.
fn classify_neo4j_error(code: &str, message: &str) -> ConnectorError {
    let text = format!("{code}: {message}");
    if code.contains("Security.Forbidden") {
        ConnectorError::permission(text)
    } else if code.contains("Security.") || code.contains("DatabaseNotFound") {
        ConnectorError::connection(text)
    } else if code.starts_with("Neo.ClientError") {
        ConnectorError::syntax(text)
    } else {
        ConnectorError::connection(text)
    }
}

fn parse_tx_response(body: &Value) -> Result<Vec<StatementResult>, ConnectorError> {
    if let Some(err) = body
        .get("errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
    {
        let code = err.get("code").and_then(Value::as_str).unwrap_or("");
        let message = err.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(classify_neo4j_error(code, message));
    }

    let results = body
        .get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .map(|result| StatementResult {
                    columns: result
                        .get("columns")
                        .and_then(Value::as_array)
                        .map(|cols| {
                            cols.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    rows: result
                        .get("data")
                        .and_then(Value::as_array)
                        .map(|data| {
                            data.iter()
                                .filter_map(|d| d.get("row").and_then(Value::as_array).cloned())
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(results)
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Strip the leading colon and backticks `relTypeProperties` puts around a type.
fn rel_type_name(raw: &str) -> String {
    raw.trim_start_matches(':').trim_matches('`').to_string()
}

fn property_field(row: &[Value]) -> Option<Field> {
    let name = row.get(1)?.as_str()?;
    let types = strings(row.get(2));
    let mandatory = row.get(3).and_then(Value::as_bool).unwrap_or(false);
    let mut field = Field::new(name, if types.is_empty() { "Any".to_string() } else { types.join("|") });
    field.nullable = !mandatory;
    Some(field)
}

fn assemble_graph_schema(
    nodes: &StatementResult,
    rels: &StatementResult,
    edges: &StatementResult,
) -> Vec<Relation> {
    let mut relations: BTreeMap<String, Relation> = BTreeMap::new();

    for row in &nodes.rows {
        for label in strings(row.first()) {
            let rel = relations
                .entry(label.clone())
                .or_insert_with(|| Relation::new(label, RelationKind::NodeLabel));
            if let Some(field) = property_field(row) {
                if rel.field(&field.name).is_none() {
                    rel.fields.push(field);
                }
            }
        }
    }

    for row in &rels.rows {
        let Some(raw) = row.first().and_then(Value::as_str) else {
            continue;
        };
        let name = rel_type_name(raw);
        let rel = relations
            .entry(name.clone())
            .or_insert_with(|| Relation::new(name, RelationKind::RelationshipType));
        if let Some(field) = property_field(row) {
            if rel.field(&field.name).is_none() {
                rel.fields.push(field);
            }
        }
    }

    for row in &edges.rows {
        let Some(rel_type) = row.get(1).and_then(Value::as_str) else {
            continue;
        };
        let targets = strings(row.get(2));
        for source in strings(row.first()) {
            let Some(relation) = relations.get_mut(&source) else {
                continue;
            };
            for target in &targets {
                let edge = Relationship {
                    fields: Vec::new(),
                    target: target.clone(),
                    target_fields: Vec::new(),
                    label: Some(rel_type.to_string()),
                };
                if !relation.relationships.contains(&edge) {
                    relation.relationships.push(edge);
                }
            }
        }
    }

    relations.into_values().collect()
}
