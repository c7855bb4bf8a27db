//! Generic GraphQL-over-HTTP connector.
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::http::HttpEndpoint;
use super::profile::ConnectionProfile;
use super::value::RowSet;
use super::{Connector, ConnectorSettings, ExecutionLimits};
use crate::backend::Backend;
use crate::error::ConnectorError;
use crate::schema::{Field, Relation, RelationKind, Relationship, SchemaDescriptor};

const INTROSPECTION_QUERY: &str = r#"
query IntrospectionQuery {
  __schema {
    queryType { name }
    mutationType { name }
    subscriptionType { name }
    types {
      kind
      name
      fields(includeDeprecated: false) {
        name
        type { ...TypeRef }
      }
    }
  }
}
fragment TypeRef on __Type {
  kind
  name
  ofType { kind name ofType { kind name ofType { kind name ofType { kind name } } } }
}
"#;

pub struct GraphQlConnector {
    endpoint: HttpEndpoint,
}

impl GraphQlConnector {
    pub fn new(profile: &ConnectionProfile, settings: &ConnectorSettings) -> Result<Self, ConnectorError> {
        Ok(Self {
            endpoint: HttpEndpoint::from_profile(profile, settings)?,
        })
    }

    async fn post(&self, query: &str, timeout: Option<std::time::Duration>) -> Result<Value, ConnectorError> {
        let mut request = self
            .endpoint
            .request(reqwest::Method::POST, self.endpoint.base().clone())
            .json(&json!({ "query": query }));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        response_data(self.endpoint.send_json(request).await?)
    }
}

#[async_trait]
impl Connector for GraphQlConnector {
    fn backend(&self) -> Backend {
        Backend::GraphQl
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        // Connections are opened lazily by the HTTP pool.
        Ok(())
    }

    async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
        let data = self.post(INTROSPECTION_QUERY, None).await?;
        let schema = data
            .get("__schema")
            .ok_or_else(|| ConnectorError::syntax("endpoint does not support introspection"))?;
        Ok(SchemaDescriptor::new(Backend::GraphQl, assemble_graphql_schema(schema)))
    }

    async fn execute(&self, query: &str, limits: &ExecutionLimits) -> Result<RowSet, ConnectorError> {
        let data = self.post(query, Some(limits.timeout)).await?;
        Ok(flatten_data(&data, limits.fetch_limit()))
    }

    async fn close(&self) {}
}

/// Extract `data`, turning a response that carries only `errors` into a
/// classified failure. Partial data with field errors is kept.
fn response_data(mut body: Value) -> Result<Value, ConnectorError> {
    let errors = body
        .get("errors")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let data = body.get_mut("data").map(Value::take).unwrap_or(Value::Null);

    if let Some(first) = errors.first() {
        let code = first
            .pointer("/extensions/code")
            .and_then(Value::as_str)
            .unwrap_or("");
        let message = first
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        match code {
            "FORBIDDEN" => return Err(ConnectorError::permission(message)),
            "UNAUTHENTICATED" => return Err(ConnectorError::connection(message)),
            _ if data.is_null() => return Err(ConnectorError::syntax(message)),
            _ => debug!(errors = errors.len(), "GraphQL response carried partial errors"),
        }
    }
    Ok(data)
}

/// Render a type reference in SDL notation, e.g. `[Order!]!`.
fn render_type(ty: &Value) -> String {
    match ty.get("kind").and_then(Value::as_str) {
        Some("NON_NULL") => format!("{}!", render_type(ty.get("ofType").unwrap_or(&Value::Null))),
        Some("LIST") => format!("[{}]", render_type(ty.get("ofType").unwrap_or(&Value::Null))),
        _ => ty
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
    }
}

fn named_type(ty: &Value) -> Option<&str> {
    match ty.get("name").and_then(Value::as_str) {
        Some(name) => Some(name),
        None => named_type(ty.get("ofType")?),
    }
}

fn assemble_graphql_schema(schema: &Value) -> Vec<Relation> {
    let root_name = |key: &str| {
        schema
            .pointer(&format!("/{key}/name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let skipped: BTreeSet<String> = [root_name("mutationType"), root_name("subscriptionType")]
        .into_iter()
        .flatten()
        .collect();

    let types: Vec<&Value> = schema
        .get("types")
        .and_then(Value::as_array)
        .map(|types| {
            types
                .iter()
                .filter(|t| matches!(t.get("kind").and_then(Value::as_str), Some("OBJECT" | "INTERFACE")))
                .filter(|t| {
                    t.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|n| !n.starts_with("__") && !skipped.contains(n))
                })
                .collect()
        })
        .unwrap_or_default();
    let object_names: BTreeSet<&str> = types
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .collect();

    let mut relations = BTreeMap::new();
    for ty in &types {
        let Some(name) = ty.get("name").and_then(Value::as_str) else {
            continue;
        };
        let mut relation = Relation::new(name, RelationKind::ObjectType);
        let fields = ty.get("fields").and_then(Value::as_array).cloned().unwrap_or_default();
        for field in fields {
            let Some(field_name) = field.get("name").and_then(Value::as_str) else {
                continue;
            };
            let field_type = field.get("type").unwrap_or(&Value::Null);
            let mut f = Field::new(field_name, render_type(field_type));
            f.nullable = field_type.get("kind").and_then(Value::as_str) != Some("NON_NULL");
            relation.fields.push(f);

            match named_type(field_type) {
                Some("ID") => relation.keys.push(field_name.to_string()),
                Some(target) if object_names.contains(target) => {
                    relation.relationships.push(Relationship {
                        fields: vec![field_name.to_string()],
                        target: target.to_string(),
                        target_fields: Vec::new(),
                        label: Some(field_name.to_string()),
                    })
                }
                _ => {}
            }
        }
        relations.insert(name.to_string(), relation);
    }
    relations.into_values().collect()
}

/// Flatten `data` into rows: each element of a top-level list is a row, a
/// top-level object is one row, a scalar becomes a one-column row.
fn flatten_data(data: &Value, fetch: usize) -> RowSet {
    let mut objects: Vec<Map<String, Value>> = Vec::new();
    if let Some(root) = data.as_object() {
        for (field, value) in root {
            match value {
                Value::Array(items) => {
                    for item in items {
                        objects.push(as_row(field, item));
                    }
                }
                Value::Null => {}
                other => objects.push(as_row(field, other)),
            }
        }
    }
    objects.truncate(fetch);
    RowSet::from_objects(objects)
}

fn as_row(field: &str, value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        scalar => {
            let mut map = Map::new();
            map.insert(field.to_string(), scalar.clone());
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CellValue;
    use crate::error::FailureKind;

    fn sample_schema() -> Value {
        json!({
            "queryType": {"name": "Query"},
            "mutationType": {"name": "Mutation"},
            "subscriptionType": null,
            "types": [
                {"kind": "OBJECT", "name": "Query", "fields": [
                    {"name": "orders", "type": {"kind": "NON_NULL", "name": null, "ofType":
                        {"kind": "LIST", "name": null, "ofType":
                            {"kind": "NON_NULL", "name": null, "ofType": {"kind": "OBJECT", "name": "Order", "ofType": null}}}}}
                ]},
                {"kind": "OBJECT", "name": "Mutation", "fields": [
                    {"name": "deleteOrder", "type": {"kind": "SCALAR", "name": "Boolean", "ofType": null}}
                ]},
                {"kind": "OBJECT", "name": "Order", "fields": [
                    {"name": "id", "type": {"kind": "NON_NULL", "name": null, "ofType": {"kind": "SCALAR", "name": "ID", "ofType": null}}},
                    {"name": "createdAt", "type": {"kind": "SCALAR", "name": "DateTime", "ofType": null}},
                    {"name": "customer", "type": {"kind": "OBJECT", "name": "Customer", "ofType": null}}
                ]},
                {"kind": "OBJECT", "name": "Customer", "fields": [
                    {"name": "id", "type": {"kind": "NON_NULL", "name": null, "ofType": {"kind": "SCALAR", "name": "ID", "ofType": null}}}
                ]},
                {"kind": "SCALAR", "name": "DateTime", "fields": null},
                {"kind": "OBJECT", "name": "__Type", "fields": []}
            ]
        })
    }

    #[test]
    fn test_assemble_graphql_schema() {
        let relations = assemble_graphql_schema(&sample_schema());
        let names: Vec<&str> = relations.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Customer", "Order", "Query"]);

        let query = relations.iter().find(|r| r.name == "Query").unwrap();
        assert_eq!(query.fields[0].data_type, "[Order!]!");
        assert!(!query.fields[0].nullable);
        assert_eq!(query.relationships[0].target, "Order");

        let order = relations.iter().find(|r| r.name == "Order").unwrap();
        assert_eq!(order.keys, vec!["id"]);
        assert!(order.field("createdAt").unwrap().nullable);
        assert_eq!(order.relationships.len(), 1);
        assert_eq!(order.relationships[0].target, "Customer");
    }

    #[test]
    fn test_response_data_errors() {
        let body = json!({"errors": [{"message": "Cannot query field \"ordrs\" on type \"Query\"."}]});
        assert_eq!(response_data(body).unwrap_err().kind, FailureKind::Syntax);

        let body = json!({"errors": [{"message": "nope", "extensions": {"code": "FORBIDDEN"}}], "data": null});
        assert_eq!(response_data(body).unwrap_err().kind, FailureKind::Permission);

        let body = json!({"errors": [{"message": "who", "extensions": {"code": "UNAUTHENTICATED"}}]});
        assert_eq!(response_data(body).unwrap_err().kind, FailureKind::Connection);
    }

    #[test]
    fn test_response_data_keeps_partial_data() {
        let body = json!({
            "data": {"orders": [{"id": "1"}]},
            "errors": [{"message": "field failed", "path": ["orders", 0, "customer"]}]
        });
        let data = response_data(body).unwrap();
        assert_eq!(data["orders"][0]["id"], json!("1"));
    }

    #[test]
    fn test_flatten_data_lists_and_objects() {
        let data = json!({
            "orders": [
                {"id": "1", "total": 10, "customer": {"id": "c1"}},
                {"id": "2", "total": 20, "customer": null}
            ]
        });
        let set = flatten_data(&data, 1001);
        assert_eq!(set.columns, vec!["id", "total", "customer"]);
        assert_eq!(set.rows.len(), 2);
        assert_eq!(set.rows[0][2], CellValue::Json(json!({"id": "c1"})));

        let data = json!({"orderCount": 42});
        let set = flatten_data(&data, 1001);
        assert_eq!(set.columns, vec!["orderCount"]);
        assert_eq!(set.rows[0][0], CellValue::Int64(42));
    }

    #[test]
    fn test_flatten_data_caps_rows() {
        let items: Vec<Value> = (0..50).map(|i| json!({"n": i})).collect();
        let set = flatten_data(&json!({ "items": items }), 11);
        assert_eq!(set.rows.len(), 11);
    }
}
