//! Static deny-list for destructive operations.
//!
//! This is a safety net over scrubbed query text, not a parser. Only
//! [`validate`] can produce a [`ValidatedCandidate`], and the executor
//! accepts nothing else.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::extract::{graphql_tokens, mask_literals, GqlToken};
use crate::backend::{Backend, DialectFamily};
use crate::error::ValidationRejected;

/// How a deny-list match is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    /// Reject the candidate.
    #[default]
    Gate,
    /// Log a warning and let the candidate through.
    Advisory,
}

/// A model-generated query, not yet validated. Not `Clone`: a candidate is
/// consumed by validation and executed at most once.
#[derive(Debug)]
pub struct QueryCandidate {
    backend: Backend,
    text: String,
}

impl QueryCandidate {
    pub(crate) fn generated(backend: Backend, text: String) -> Self {
        Self { backend, text }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

/// A candidate that passed (or, in advisory mode, was waved through) the
/// deny-list.
#[derive(Debug)]
pub struct ValidatedCandidate {
    backend: Backend,
    text: String,
    warning: Option<String>,
}

impl ValidatedCandidate {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The deny-list reason, when advisory mode let a match through.
    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

pub fn validate(candidate: QueryCandidate, mode: SafetyMode) -> Result<ValidatedCandidate, ValidationRejected> {
    let reason = match candidate.backend.family() {
        DialectFamily::Relational => check_sql(&candidate.text),
        DialectFamily::Graph => check_cypher(&candidate.text),
        DialectFamily::Document => check_document(&candidate.text),
        DialectFamily::ApiQuery => check_graphql(&candidate.text),
    };

    match (reason, mode) {
        (None, _) => Ok(ValidatedCandidate {
            backend: candidate.backend,
            text: candidate.text,
            warning: None,
        }),
        (Some(reason), SafetyMode::Gate) => Err(ValidationRejected {
            candidate: candidate.text,
            reason,
        }),
        (Some(reason), SafetyMode::Advisory) => {
            warn!(backend = %candidate.backend, reason = %reason, "destructive candidate allowed in advisory mode");
            Ok(ValidatedCandidate {
                backend: candidate.backend,
                text: candidate.text,
                warning: Some(reason),
            })
        }
    }
}

static SQL_DENIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(DROP|TRUNCATE|DELETE|ALTER|CREATE|GRANT|REVOKE)\b").unwrap());
static CYPHER_DENIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(DELETE|DETACH|REMOVE|DROP)\b").unwrap());
static UPDATE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bUPDATE\b").unwrap());
static SET_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSET\b").unwrap());
static WHERE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").unwrap());
static INTO_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bINTO\b").unwrap());
static LAST_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\w+)\s*$").unwrap());

fn check_sql(text: &str) -> Option<String> {
    let scrubbed = mask_literals(text, DialectFamily::Relational);
    if let Some(m) = SQL_DENIED.find(&scrubbed) {
        return Some(format!("{} statement", m.as_str().to_uppercase()));
    }
    for m in UPDATE_WORD.find_iter(&scrubbed) {
        // Row locks (FOR UPDATE, FOR NO KEY UPDATE) and upsert actions (DO UPDATE).
        let preceding = LAST_WORD
            .captures(&scrubbed[..m.start()])
            .map(|c| c[1].to_uppercase());
        if matches!(preceding.as_deref(), Some("FOR" | "KEY" | "DO")) {
            continue;
        }
        if !has_own_where(&scrubbed[m.end()..]) {
            return Some("UPDATE without a WHERE clause".to_string());
        }
    }
    for m in INTO_WORD.find_iter(&scrubbed) {
        let preceding = LAST_WORD
            .captures(&scrubbed[..m.start()])
            .map(|c| c[1].to_uppercase());
        if !matches!(preceding.as_deref(), Some("INSERT" | "MERGE")) {
            return Some("SELECT INTO statement".to_string());
        }
    }
    None
}

/// Whether the statement starting at `rest` has a WHERE clause of its own.
/// WHERE clauses of subqueries and of an enclosing query do not count.
fn has_own_where(rest: &str) -> bool {
    let mut depth = 0i32;
    let mut end = rest.len();
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => {
                end = i;
                break;
            }
            ')' => depth -= 1,
            ';' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let statement = &rest[..end];
    WHERE_WORD
        .find_iter(statement)
        .any(|m| paren_depth(&statement[..m.start()]) == 0)
}

fn paren_depth(text: &str) -> i32 {
    text.chars().fold(0, |depth, c| match c {
        '(' => depth + 1,
        ')' => depth - 1,
        _ => depth,
    })
}

fn check_cypher(text: &str) -> Option<String> {
    let scrubbed = mask_literals(text, DialectFamily::Graph);
    if let Some(m) = CYPHER_DENIED.find(&scrubbed) {
        return Some(format!("{} clause", m.as_str().to_uppercase()));
    }
    for m in SET_WORD.find_iter(&scrubbed) {
        if !WHERE_WORD.is_match(&scrubbed[..m.start()]) {
            return Some("SET without a preceding WHERE clause".to_string());
        }
    }
    None
}

const DESTRUCTIVE_DOCUMENT_KEYS: &[&str] = &[
    "delete",
    "deletemany",
    "remove",
    "drop",
    "purge",
    "truncate",
    "update",
    "updatemany",
    "replace",
    "bulk_docs",
    "_bulk_docs",
];

const DESTRUCTIVE_OPERATION_PREFIXES: &[&str] = &[
    "delete", "remove", "drop", "purge", "truncate", "destroy", "update", "replace", "compact",
];

fn check_document(text: &str) -> Option<String> {
    let Ok(document) = serde_json::from_str::<Value>(text) else {
        return None;
    };
    if let Some(object) = document.as_object() {
        for (key, value) in object {
            let lowered = key.to_lowercase();
            if DESTRUCTIVE_DOCUMENT_KEYS.contains(&lowered.as_str()) {
                return Some(format!("destructive key \"{key}\""));
            }
            if matches!(lowered.as_str(), "operation" | "op" | "action" | "method") {
                if let Some(op) = value.as_str() {
                    let op = op.to_lowercase();
                    if DESTRUCTIVE_OPERATION_PREFIXES.iter().any(|p| op.starts_with(p)) {
                        return Some(format!("destructive operation \"{op}\""));
                    }
                }
            }
        }
    }
    contains_deleted_marker(&document).then(|| "document deletion marker \"_deleted\"".to_string())
}

fn contains_deleted_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k == "_deleted" || contains_deleted_marker(v)),
        Value::Array(items) => items.iter().any(contains_deleted_marker),
        _ => false,
    }
}

const DESTRUCTIVE_MUTATION_PREFIXES: &[&str] =
    &["delete", "remove", "drop", "truncate", "purge", "destroy", "clear"];
const UNCONDITIONAL_MUTATION_PREFIXES: &[&str] = &["update", "upsert", "set", "modify"];

fn check_graphql(text: &str) -> Option<String> {
    for (field, has_args) in mutation_root_fields(&graphql_tokens(text)) {
        let lowered = field.to_lowercase();
        if DESTRUCTIVE_MUTATION_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            return Some(format!("destructive mutation \"{field}\""));
        }
        if !has_args && UNCONDITIONAL_MUTATION_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            return Some(format!("mutation \"{field}\" without arguments"));
        }
    }
    None
}

/// Root selections of every mutation operation, with whether each carries
/// non-empty arguments.
fn mutation_root_fields(tokens: &[GqlToken]) -> Vec<(String, bool)> {
    let mut fields = Vec::new();
    let mut braces = 0usize;
    let mut parens = 0usize;
    let mut pending_mutation = false;
    let mut in_mutation = false;

    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            GqlToken::Punct('{') => {
                if braces == 0 && parens == 0 && pending_mutation {
                    in_mutation = true;
                    pending_mutation = false;
                }
                braces += 1;
            }
            GqlToken::Punct('}') => {
                braces = braces.saturating_sub(1);
                if braces == 0 {
                    in_mutation = false;
                }
            }
            GqlToken::Punct('(') => parens += 1,
            GqlToken::Punct(')') => parens = parens.saturating_sub(1),
            GqlToken::Name(name) if braces == 0 && parens == 0 => match name.as_str() {
                "mutation" => pending_mutation = true,
                "query" | "subscription" | "fragment" => pending_mutation = false,
                _ => {}
            },
            GqlToken::Name(name) if in_mutation && braces == 1 && parens == 0 => {
                let prev = i.checked_sub(1).map(|p| &tokens[p]);
                let skip = matches!(prev, Some(GqlToken::Punct('@') | GqlToken::Punct('$') | GqlToken::Spread))
                    || (name == "on" && matches!(prev, Some(GqlToken::Spread)));
                if !skip {
                    let mut field = name.clone();
                    // `alias: field`
                    if tokens.get(i + 1) == Some(&GqlToken::Punct(':')) {
                        if let Some(GqlToken::Name(target)) = tokens.get(i + 2) {
                            field = target.clone();
                            i += 2;
                        }
                    }
                    let has_args = tokens.get(i + 1) == Some(&GqlToken::Punct('('))
                        && tokens.get(i + 2) != Some(&GqlToken::Punct(')'));
                    fields.push((field, has_args));
                }
            }
            _ => {}
        }
        i += 1;
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(backend: Backend, text: &str) -> Result<ValidatedCandidate, ValidationRejected> {
        validate(QueryCandidate::generated(backend, text.to_string()), SafetyMode::Gate)
    }

    #[test]
    fn test_sql_select_passes() {
        let ok = check(
            Backend::Postgres,
            "SELECT id, created_at FROM orders WHERE created_at > now() - interval '7 days'",
        )
        .unwrap();
        assert!(ok.warning().is_none());
        assert!(check(Backend::Postgres, "SELECT * FROM jobs FOR UPDATE SKIP LOCKED").is_ok());
        assert!(check(Backend::Postgres, "SELECT is_deleted, created_by FROM t").is_ok());
    }

    #[test]
    fn test_sql_denied_keywords() {
        for text in [
            "DROP TABLE orders",
            "truncate orders",
            "DELETE FROM orders WHERE id = 1",
            "ALTER TABLE orders ADD COLUMN x int",
            "CREATE TABLE x (id int)",
            "GRANT ALL ON orders TO public",
            "WITH gone AS (DELETE FROM orders RETURNING *) SELECT * FROM gone",
        ] {
            let err = check(Backend::Postgres, text).unwrap_err();
            assert_eq!(err.candidate, text);
        }
    }

    #[test]
    fn test_sql_update_requires_where() {
        assert!(check(Backend::Postgres, "UPDATE orders SET status = 'x'").is_err());
        assert!(check(Backend::Postgres, "UPDATE orders SET status = 'x' WHERE id = 3").is_ok());
        assert!(check(
            Backend::Postgres,
            "UPDATE orders SET total = (SELECT sum(amount) FROM items WHERE items.order_id = 7)"
        )
        .is_err());
        assert!(check(
            Backend::Postgres,
            "WITH touched AS (UPDATE orders SET seen = true RETURNING id) SELECT * FROM touched WHERE id > 1"
        )
        .is_err());
        assert!(check(
            Backend::Postgres,
            "UPDATE orders SET total = (SELECT 1) WHERE id IN (SELECT id FROM stale)"
        )
        .is_ok());
    }

    #[test]
    fn test_sql_select_into_denied() {
        let err = check(Backend::Postgres, "SELECT id, total INTO archived_orders FROM orders").unwrap_err();
        assert_eq!(err.reason, "SELECT INTO statement");
        assert!(check(Backend::Postgres, "INSERT INTO audit SELECT * FROM orders WHERE id = 1").is_ok());
        assert!(check(Backend::Postgres, "SELECT 'copy into' AS note FROM orders").is_ok());
    }

    #[test]
    fn test_sql_keywords_in_literals_and_comments_ignored() {
        assert!(check(Backend::Postgres, "SELECT 'DROP TABLE x' AS label -- delete me").is_ok());
        assert!(check(Backend::Postgres, "SELECT \"Delete\" FROM audit").is_ok());
    }

    #[test]
    fn test_cypher_rules() {
        assert!(check(Backend::Neo4j, "MATCH (p:Person) RETURN p.name AS name").is_ok());
        assert!(check(Backend::Neo4j, "MATCH (p) DETACH DELETE p").is_err());
        assert!(check(Backend::Neo4j, "MATCH (p) REMOVE p.email").is_err());
        assert!(check(Backend::Neo4j, "MATCH (p) SET p.active = false").is_err());
        assert!(check(Backend::Neo4j, "MATCH (p) WHERE p.id = 1 SET p.active = false").is_ok());
        assert!(check(Backend::Neo4j, "MATCH (p) WHERE p.note = 'delete' RETURN p").is_ok());
    }

    #[test]
    fn test_document_rules() {
        assert!(check(Backend::CouchDb, r#"{"selector":{"total":{"$gt":1}}}"#).is_ok());
        assert!(check(Backend::CouchDb, r#"{"selector":{},"delete":true}"#).is_err());
        assert!(check(Backend::CouchDb, r#"{"operation":"deleteMany","selector":{}}"#).is_err());
        assert!(check(Backend::CouchDb, r#"{"docs":[{"_id":"a","_deleted":true}]}"#).is_err());
        assert!(check(Backend::CouchDb, r#"{"selector":{"status":"delete"}}"#).is_ok());
    }

    #[test]
    fn test_graphql_rules() {
        assert!(check(Backend::GraphQl, "query { orders { id } }").is_ok());
        assert!(check(Backend::GraphQl, "mutation { deleteOrder(id: 1) { id } }").is_err());
        assert!(check(Backend::GraphQl, "mutation M { gone: purgeCache }").is_err());
        assert!(check(Backend::GraphQl, "mutation { updateAllOrders { count } }").is_err());
        assert!(check(Backend::GraphQl, "mutation { updateOrder(id: 1, input: {status: OPEN}) { id } }").is_ok());
        assert!(check(Backend::GraphQl, "query { deleteHistory { id } }").is_ok());
    }

    #[test]
    fn test_mutation_root_fields_skip_nested_and_arguments() {
        let tokens = graphql_tokens(
            "mutation Run($id: ID!) { a: createOrder(input: {clear: true}) { items { removeMe } } touch @include(if: $x) }",
        );
        assert_eq!(
            mutation_root_fields(&tokens),
            vec![("createOrder".to_string(), true), ("touch".to_string(), false)]
        );
    }

    #[test]
    fn test_advisory_mode_lets_match_through() {
        let candidate = QueryCandidate::generated(Backend::Postgres, "DROP TABLE orders".into());
        let validated = validate(candidate, SafetyMode::Advisory).unwrap();
        assert_eq!(validated.warning(), Some("DROP statement"));
        assert_eq!(validated.into_text(), "DROP TABLE orders");
    }

    #[test]
    fn test_safety_mode_serde() {
        let mode: SafetyMode = serde_json::from_str("\"advisory\"").unwrap();
        assert_eq!(mode, SafetyMode::Advisory);
        assert_eq!(SafetyMode::default(), SafetyMode::Gate);
    }
}
