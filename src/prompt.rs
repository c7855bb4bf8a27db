//! Prompt assembly.
//!
//! [`build_prompt`] is a pure function: the same inputs always produce the
//! same bytes, which keeps model calls reproducible under a fixed seed.
use std::collections::BTreeSet;

use crate::backend::{Backend, DialectFamily, QuoteStyle};
use crate::schema::{Relation, SchemaDescriptor};

pub const DEFAULT_MAX_SCHEMA_CHARS: usize = 12_000;
pub const DEFAULT_MAX_ERROR_CHARS: usize = 800;

/// Maximum relation names listed in the omission note.
const MAX_OMITTED_NAMES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    pub max_schema_chars: usize,
    pub max_error_chars: usize,
    /// Row cap the model is told to respect.
    pub max_rows: usize,
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self {
            max_schema_chars: DEFAULT_MAX_SCHEMA_CHARS,
            max_error_chars: DEFAULT_MAX_ERROR_CHARS,
            max_rows: crate::connector::DEFAULT_MAX_ROWS,
        }
    }
}

/// A failed candidate and the backend's complaint about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorAttempt {
    pub candidate: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub request: &'a str,
    pub schema: &'a SchemaDescriptor,
    pub backend: Backend,
    pub prior: Option<&'a PriorAttempt>,
    pub budget: PromptBudget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}

/// Code fence language tag for a family.
pub fn fence_tag(family: DialectFamily) -> &'static str {
    match family {
        DialectFamily::Relational => "sql",
        DialectFamily::Document => "json",
        DialectFamily::Graph => "cypher",
        DialectFamily::ApiQuery => "graphql",
    }
}

pub fn build_prompt(input: &PromptInput<'_>) -> Prompt {
    let descriptor = input.backend.descriptor();
    let family = descriptor.family;

    let mut system = format!(
        "You translate natural-language requests into {} queries for {} ({} backend).\n\n",
        descriptor.query_language, descriptor.display_name, family
    );
    system.push_str("Rules:\n");
    for rule in dialect_rules(input.backend, input.budget.max_rows) {
        system.push_str("- ");
        system.push_str(&rule);
        system.push('\n');
    }
    system.push_str(&format!(
        "- Answer with exactly one query in a single ```{}``` fenced code block and nothing else.\n\n",
        fence_tag(family)
    ));
    system.push_str(&schema_summary(
        input.schema,
        input.backend,
        input.request,
        input.budget.max_schema_chars,
    ));

    let mut user = format!("Request: {}\n", input.request.trim());
    if let Some(prior) = input.prior {
        user.push_str(&format!(
            "\nYour previous query was rejected by {}.\nPrevious query:\n```{}\n{}\n```\nError: {}\nReturn a corrected query.\n",
            descriptor.display_name,
            fence_tag(family),
            prior.candidate.trim(),
            truncate_chars(prior.error.trim(), input.budget.max_error_chars)
        ));
    }

    Prompt { system, user }
}

fn dialect_rules(backend: Backend, max_rows: usize) -> Vec<String> {
    let mut rules: Vec<String> = match backend.family() {
        DialectFamily::Relational => vec![
            "Write one read-only SELECT statement (a WITH clause is allowed).".into(),
            "Use only the tables and columns listed in the schema.".into(),
            match backend.descriptor().quoting {
                QuoteStyle::Backtick => "Quote identifiers with backticks when they contain spaces or special characters.".into(),
                _ => "Quote identifiers with double quotes when they contain upper-case letters or special characters.".into(),
            },
            format!("Add LIMIT {max_rows} unless the request asks for fewer rows."),
            "Never use INSERT, UPDATE, DELETE, DROP, ALTER, TRUNCATE, CREATE, GRANT or REVOKE.".into(),
        ],
        DialectFamily::Document => vec![
            r#"Write one JSON object of the form {"collection": "<name>", "selector": {...}, "fields": [...], "sort": [...], "limit": n}."#.into(),
            "Use Mango selector operators ($eq, $ne, $gt, $gte, $lt, $lte, $in, $exists, $regex, $and, $or).".into(),
            "Use only the collections and fields listed in the schema.".into(),
            format!("Set limit to at most {max_rows}."),
            "Never write, update or delete documents.".into(),
        ],
        DialectFamily::Graph => vec![
            "Write one read-only Cypher query built from MATCH, OPTIONAL MATCH, WHERE, WITH and RETURN.".into(),
            "Use only the node labels, relationship types and properties listed in the schema.".into(),
            "Alias every returned expression with AS.".into(),
            format!("End with LIMIT {max_rows} unless the request asks for fewer rows."),
            "Never use CREATE, MERGE, SET, DELETE, DETACH, REMOVE or DROP.".into(),
        ],
        DialectFamily::ApiQuery => vec![
            "Write one GraphQL query operation; never a mutation or subscription.".into(),
            "Root fields are the fields of the query type listed in the schema.".into(),
            "Select scalar fields explicitly; do not reference fragments that are not defined in the answer.".into(),
            format!("Request at most {max_rows} items when a field accepts a page size argument."),
        ],
    };
    match backend {
        Backend::Redshift => rules.push(
            "Redshift is based on PostgreSQL 8.0: avoid RETURNING, arrays, JSONB operators and FILTER clauses.".into(),
        ),
        Backend::MySql => rules.push(
            "MySQL has no FULL OUTER JOIN, RETURNING or ILIKE; use LIKE, which is case-insensitive under the default collation.".into(),
        ),
        Backend::CockroachDb => {
            rules.push("CockroachDB is PostgreSQL-compatible; avoid PostgreSQL extensions and system catalogs.".into())
        }
        _ => {}
    }
    rules
}

/// Lowercase words of a request, singularized.
fn request_terms(request: &str) -> BTreeSet<String> {
    request
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= 3)
        .map(|w| singular(&w.to_lowercase()))
        .collect()
}

fn singular(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Split `created_at` or `createdAt` into lowercase parts.
fn identifier_parts(ident: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in ident.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn identifier_matches(ident: &str, terms: &BTreeSet<String>) -> bool {
    if terms.contains(&singular(&ident.to_lowercase())) {
        return true;
    }
    identifier_parts(ident)
        .iter()
        .filter(|p| p.len() >= 4)
        .any(|p| terms.contains(&singular(p)))
}

/// How strongly a relation matches the request: a name match outweighs any
/// number of field matches. Zero means unrelated.
fn relevance(relation: &Relation, terms: &BTreeSet<String>) -> usize {
    let fields = relation.fields.iter().filter(|f| identifier_matches(&f.name, terms)).count();
    if identifier_matches(&relation.name, terms) {
        relation.fields.len() + 1 + fields
    } else {
        fields
    }
}

fn render_relation(relation: &Relation, backend: Backend) -> String {
    let mut out = format!("{} [{}]", backend.render_identifier(&relation.name), relation.kind.label());
    if !relation.keys.is_empty() {
        let keys: Vec<String> = relation.keys.iter().map(|k| backend.render_identifier(k)).collect();
        out.push_str(&format!(" key({})", keys.join(", ")));
    }
    out.push('\n');
    for field in &relation.fields {
        out.push_str(&format!(
            "  {}: {}{}\n",
            backend.render_identifier(&field.name),
            field.data_type,
            if field.nullable { "" } else { " NOT NULL" }
        ));
    }
    for edge in &relation.relationships {
        let line = match backend.family() {
            DialectFamily::Graph => format!(
                "  -[:{}]->({})\n",
                edge.label.as_deref().unwrap_or("?"),
                edge.target
            ),
            _ if edge.target_fields.is_empty() => {
                format!("  {} -> {}\n", edge.fields.join(", "), edge.target)
            }
            _ => format!(
                "  {} -> {}({})\n",
                edge.fields.join(", "),
                edge.target,
                edge.target_fields.join(", ")
            ),
        };
        out.push_str(&line);
    }
    out
}

/// Render the schema within `max_chars`. Relations that mention a request
/// term get the budget first, strongest match first; the rest follow
/// alphabetically while budget remains. Whatever does not fit is named in a
/// closing note.
fn schema_summary(schema: &SchemaDescriptor, backend: Backend, request: &str, max_chars: usize) -> String {
    if schema.is_empty() {
        return "Schema: no collections were found in this database.\n".to_string();
    }

    let terms = request_terms(request);
    let rendered: Vec<String> = schema.relations.iter().map(|r| render_relation(r, backend)).collect();
    let scores: Vec<usize> = schema.relations.iter().map(|r| relevance(r, &terms)).collect();

    // Relations are stored sorted by name, so index order breaks ties alphabetically.
    let mut order: Vec<usize> = (0..rendered.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(scores[i]));

    let mut used = 0usize;
    let mut included = vec![false; rendered.len()];
    for i in order {
        if used + rendered[i].len() <= max_chars {
            included[i] = true;
            used += rendered[i].len();
        }
    }

    let mut out = format!("Schema ({} collections):\n", schema.relations.len());
    let mut omitted = Vec::new();
    for (i, text) in rendered.iter().enumerate() {
        if included[i] {
            out.push_str(text);
        } else {
            omitted.push(schema.relations[i].name.as_str());
        }
    }
    if !omitted.is_empty() {
        let shown: Vec<&str> = omitted.iter().take(MAX_OMITTED_NAMES).copied().collect();
        out.push_str(&format!(
            "Omitted for size ({} collections, not shown above): {}",
            omitted.len(),
            shown.join(", ")
        ));
        if omitted.len() > shown.len() {
            out.push_str(&format!(", and {} more", omitted.len() - shown.len()));
        }
        out.push('\n');
    }
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
