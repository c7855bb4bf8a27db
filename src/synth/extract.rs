//! Candidate extraction from free-form model output.
//!
//! A response yields exactly one statement for the backend's dialect family
//! or an error: [`SynthesisError::EmptyResponse`] when nothing usable is
//! found, [`SynthesisError::AmbiguousCandidate`] when more than one
//! statement is.
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, RedshiftSqlDialect};
use sqlparser::parser::Parser as SqlParser;

use crate::backend::{Backend, DialectFamily};
use crate::error::SynthesisError;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[ \t]*([^\n`]*)\n(.*?)```").unwrap());

static SQL_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(select|with|insert|update|delete|drop|alter|create|truncate|grant|revoke|merge|explain)\b")
        .unwrap()
});

static CYPHER_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(match|optional\s+match|with|unwind|call|return|create|merge|detach|delete|remove|drop|set|foreach)\b")
        .unwrap()
});

static GRAPHQL_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*((query|mutation|subscription|fragment)\b|\{)").unwrap());

fn accepted_fence_tags(family: DialectFamily) -> &'static [&'static str] {
    match family {
        DialectFamily::Relational => &["", "sql", "postgres", "postgresql", "pgsql", "psql", "mysql", "mariadb"],
        DialectFamily::Document => &["", "json", "mango", "javascript", "js"],
        DialectFamily::Graph => &["", "cypher", "neo4j", "opencypher"],
        DialectFamily::ApiQuery => &["", "graphql", "gql"],
    }
}

/// Extract exactly one candidate statement from a model response.
pub fn extract_candidate(response: &str, backend: Backend) -> Result<String, SynthesisError> {
    let family = backend.family();
    let body = match fenced_body(response, family)? {
        Some(body) => body,
        None => unfenced_body(response, family).ok_or(SynthesisError::EmptyResponse)?,
    };

    let candidate = match family {
        DialectFamily::Relational => {
            let text = strip_trailing_semicolon(&body);
            expect_single(count_sql_statements(&text, backend))?;
            text
        }
        DialectFamily::Graph => {
            let text = strip_trailing_semicolon(&body);
            expect_single(split_statements(&text, family).len())?;
            text
        }
        DialectFamily::Document => single_json_document(&body)?,
        DialectFamily::ApiQuery => {
            let text = body.trim().to_string();
            expect_single(count_graphql_operations(&text))?;
            text
        }
    };

    if candidate.trim().is_empty() {
        return Err(SynthesisError::EmptyResponse);
    }
    Ok(candidate)
}

fn expect_single(count: usize) -> Result<(), SynthesisError> {
    match count {
        0 => Err(SynthesisError::EmptyResponse),
        1 => Ok(()),
        count => Err(SynthesisError::AmbiguousCandidate { count }),
    }
}

/// Body of the fenced code block(s). Identical blocks collapse into one;
/// distinct blocks are ambiguous.
fn fenced_body(response: &str, family: DialectFamily) -> Result<Option<String>, SynthesisError> {
    let all_blocks: Vec<(String, String)> = FENCED_BLOCK
        .captures_iter(response)
        .map(|c| (c[1].trim().to_lowercase(), c[2].trim().to_string()))
        .collect();
    let closed_fence = !all_blocks.is_empty();
    let blocks: Vec<(String, String)> = all_blocks.into_iter().filter(|(_, body)| !body.is_empty()).collect();

    if blocks.is_empty() {
        if closed_fence {
            return Err(SynthesisError::EmptyResponse);
        }
        // An unterminated fence still carries the candidate after its opening line.
        if let Some(pos) = response.find("```") {
            let rest = &response[pos + 3..];
            let body = rest.split_once('\n').map_or("", |(_, b)| b).trim();
            if !body.is_empty() {
                return Ok(Some(body.to_string()));
            }
        }
        return Ok(None);
    }

    let accepted = accepted_fence_tags(family);
    let mut chosen: Vec<&String> = blocks
        .iter()
        .filter(|(tag, _)| accepted.contains(&tag.as_str()))
        .map(|(_, body)| body)
        .collect();
    if chosen.is_empty() {
        chosen = blocks.iter().map(|(_, body)| body).collect();
    }
    let mut distinct: Vec<&String> = Vec::new();
    for body in chosen {
        if !distinct.contains(&body) {
            distinct.push(body);
        }
    }
    match distinct.len() {
        1 => Ok(Some(distinct[0].clone())),
        count => Err(SynthesisError::AmbiguousCandidate { count }),
    }
}

/// Words that open a continuation line of a SQL or Cypher statement.
const CLAUSE_WORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "join", "inner", "left", "right", "full", "outer",
    "cross", "natural", "lateral", "on", "using", "group", "order", "by", "having", "limit", "offset",
    "fetch", "union", "intersect", "except", "as", "with", "case", "when", "then", "else", "end", "in",
    "is", "between", "like", "ilike", "exists", "values", "window", "partition", "over", "distinct",
    "all", "any", "match", "optional", "return", "skip", "unwind", "call", "yield", "asc", "desc",
];

/// Locate the statement in prose. It starts at the first line that begins
/// like one and ends at a blank line, a statement terminator or a line of
/// prose, unless what follows begins like another statement.
fn unfenced_body(response: &str, family: DialectFamily) -> Option<String> {
    let start_pattern: &Regex = match family {
        DialectFamily::Relational => &SQL_START,
        DialectFamily::Graph => &CYPHER_START,
        DialectFamily::ApiQuery => &GRAPHQL_START,
        DialectFamily::Document => {
            let start = response.find(['{', '['])?;
            return Some(response[start..].to_string());
        }
    };

    let lines: Vec<&str> = response.lines().collect();
    let first = lines.iter().position(|l| start_pattern.is_match(l))?;

    let mut kept: Vec<String> = Vec::new();
    let mut paragraph_start = true;
    let mut terminated = false;
    for line in &lines[first..] {
        if line.trim().is_empty() {
            paragraph_start = true;
            continue;
        }
        let starts_statement = start_pattern.is_match(line);
        if !kept.is_empty() {
            if !starts_statement && (paragraph_start || terminated || looks_like_prose(line)) {
                break;
            }
            if paragraph_start {
                kept.push(String::new());
            }
        }
        paragraph_start = false;
        let (text, ends) = cut_at_terminator(line, family, start_pattern);
        terminated = ends;
        kept.push(text);
    }
    Some(kept.join("\n"))
}

/// Cut `line` after its first `;` unless another statement follows on the
/// same line. Returns the kept text and whether a terminator was seen.
fn cut_at_terminator(line: &str, family: DialectFamily, start_pattern: &Regex) -> (String, bool) {
    if family == DialectFamily::ApiQuery {
        return (line.to_string(), false);
    }
    let masked: Vec<char> = mask_literals(line, family).chars().collect();
    let Some(pos) = masked.iter().position(|&c| c == ';') else {
        return (line.to_string(), false);
    };
    let chars: Vec<char> = line.chars().collect();
    let rest: String = chars[pos + 1..].iter().collect();
    let rest_masked: String = masked[pos + 1..].iter().collect();
    if rest_masked.trim().is_empty() || start_pattern.is_match(&rest) {
        return (line.to_string(), true);
    }
    (chars[..=pos].iter().collect(), true)
}

/// An unindented sentence: a capitalized ordinary word followed by at least
/// two more words. Clause keywords only count when the line ends like a
/// sentence.
fn looks_like_prose(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() < 3 {
        return false;
    }
    let first = words[0].trim_end_matches(|c: char| !c.is_alphanumeric());
    let mut chars = first.chars();
    let capitalized = chars.next().is_some_and(char::is_uppercase)
        && first.len() > 1
        && chars.all(char::is_lowercase);
    if !capitalized {
        return false;
    }
    let keyword = CLAUSE_WORDS.contains(&first.to_lowercase().as_str());
    !keyword || line.trim_end().ends_with(['.', ':', '!', '?'])
}

fn strip_trailing_semicolon(text: &str) -> String {
    let trimmed = text.trim();
    trimmed
        .strip_suffix(';')
        .unwrap_or(trimmed)
        .trim_end()
        .to_string()
}

fn count_sql_statements(text: &str, backend: Backend) -> usize {
    let dialect: Box<dyn Dialect> = match backend {
        Backend::Redshift => Box::new(RedshiftSqlDialect {}),
        Backend::MySql => Box::new(MySqlDialect {}),
        _ => Box::new(PostgreSqlDialect {}),
    };
    match SqlParser::parse_sql(dialect.as_ref(), text) {
        Ok(statements) => statements.len(),
        // Vendor syntax the parser does not know; count lexically.
        Err(_) => split_statements(text, DialectFamily::Relational).len(),
    }
}

/// Read JSON values from the start of `body`, stopping at trailing prose.
fn single_json_document(body: &str) -> Result<String, SynthesisError> {
    let mut values: Vec<Value> = Vec::new();
    let stream = serde_json::Deserializer::from_str(body.trim()).into_iter::<Value>();
    for value in stream {
        match value {
            Ok(v @ (Value::Object(_) | Value::Array(_))) => values.push(v),
            _ => break,
        }
    }

    let document = match values.len() {
        0 => return Err(SynthesisError::EmptyResponse),
        1 => values.remove(0),
        count => return Err(SynthesisError::AmbiguousCandidate { count }),
    };
    let document = match document {
        Value::Array(mut items) => match items.len() {
            0 => return Err(SynthesisError::EmptyResponse),
            1 => items.remove(0),
            count => return Err(SynthesisError::AmbiguousCandidate { count }),
        },
        other => other,
    };
    if !document.is_object() {
        return Err(SynthesisError::EmptyResponse);
    }
    serde_json::to_string(&document).map_err(|_| SynthesisError::EmptyResponse)
}

/// Replace the contents of string literals, quoted identifiers and comments
/// with spaces. The output has the same number of chars as the input.
pub(crate) fn mask_literals(text: &str, family: DialectFamily) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let blank = |c: char| if c == '\n' { '\n' } else { ' ' };
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        let line_comment = match family {
            DialectFamily::Relational => c == '-' && next == Some('-'),
            DialectFamily::Graph => c == '/' && next == Some('/'),
            DialectFamily::ApiQuery => c == '#',
            DialectFamily::Document => false,
        };
        if line_comment {
            while i < len && chars[i] != '\n' {
                out.push(' ');
                i += 1;
            }
            continue;
        }

        if c == '/'
            && next == Some('*')
            && matches!(family, DialectFamily::Relational | DialectFamily::Graph)
        {
            out.push_str("  ");
            i += 2;
            while i < len && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                out.push(blank(chars[i]));
                i += 1;
            }
            if i < len {
                out.push_str("  ");
                i += 2;
            }
            continue;
        }

        if family == DialectFamily::ApiQuery && chars[i..].starts_with(&['"', '"', '"']) {
            out.push_str("\"\"\"");
            i += 3;
            while i < len && !chars[i..].starts_with(&['"', '"', '"']) {
                out.push(blank(chars[i]));
                i += 1;
            }
            if i < len {
                out.push_str("\"\"\"");
                i += 3;
            }
            continue;
        }

        if family == DialectFamily::Relational && c == '$' {
            if let Some(tag_len) = dollar_tag(&chars, i) {
                let tag: Vec<char> = chars[i..i + tag_len].to_vec();
                out.extend(tag.iter());
                i += tag_len;
                while i < len && !chars[i..].starts_with(&tag) {
                    out.push(blank(chars[i]));
                    i += 1;
                }
                if i < len {
                    out.extend(tag.iter());
                    i += tag_len;
                }
                continue;
            }
        }

        let quotes: &[char] = match family {
            DialectFamily::Relational => &['\'', '"', '`'],
            DialectFamily::Graph => &['\'', '"', '`'],
            DialectFamily::Document | DialectFamily::ApiQuery => &['"'],
        };
        if quotes.contains(&c) {
            let backslash_escapes = family != DialectFamily::Relational && c != '`';
            out.push(c);
            i += 1;
            while i < len {
                let d = chars[i];
                if backslash_escapes && d == '\\' && i + 1 < len {
                    out.push(' ');
                    out.push(blank(chars[i + 1]));
                    i += 2;
                    continue;
                }
                if d == c {
                    // Doubled delimiter escapes itself.
                    if !backslash_escapes && chars.get(i + 1) == Some(&c) {
                        out.push_str("  ");
                        i += 2;
                        continue;
                    }
                    break;
                }
                out.push(blank(d));
                i += 1;
            }
            if i < len {
                out.push(c);
                i += 1;
            }
            continue;
        }

        out.push(c);
        i += 1;
    }
    out
}

/// Length of a PostgreSQL dollar-quote tag (`$$` or `$tag$`) starting at `i`.
fn dollar_tag(chars: &[char], i: usize) -> Option<usize> {
    if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut j = i + 1;
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    (j < chars.len() && chars[j] == '$').then_some(j - i + 1)
}

/// Split on `;` outside literals and comments, dropping empty segments.
pub(crate) fn split_statements(text: &str, family: DialectFamily) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let masked: Vec<char> = mask_literals(text, family).chars().collect();
    let mut statements = Vec::new();
    let mut start = 0;
    for i in 0..=masked.len() {
        if i < masked.len() && masked[i] != ';' {
            continue;
        }
        if masked[start..i].iter().any(|c| !c.is_whitespace()) {
            statements.push(chars[start..i].iter().collect::<String>().trim().to_string());
        }
        start = i + 1;
    }
    statements
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GqlToken {
    Name(String),
    Punct(char),
    Spread,
}

/// Tokenize GraphQL names and punctuation, skipping literals and comments.
pub(crate) fn graphql_tokens(text: &str) -> Vec<GqlToken> {
    let masked: Vec<char> = mask_literals(text, DialectFamily::ApiQuery).chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < masked.len() {
        let c = masked[i];
        if c == '_' || c.is_ascii_alphabetic() {
            let start = i;
            while i < masked.len() && (masked[i] == '_' || masked[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            tokens.push(GqlToken::Name(masked[start..i].iter().collect()));
            continue;
        }
        if masked[i..].starts_with(&['.', '.', '.']) {
            tokens.push(GqlToken::Spread);
            i += 3;
            continue;
        }
        if matches!(c, '{' | '}' | '(' | ')' | ':' | '@' | '$' | '[' | ']' | '=' | '!') {
            tokens.push(GqlToken::Punct(c));
        }
        i += 1;
    }
    tokens
}

/// Number of executable operations; fragment definitions are not counted.
fn count_graphql_operations(text: &str) -> usize {
    let mut depth = 0usize;
    let mut pending_definition = false;
    let mut count = 0;
    for token in graphql_tokens(text) {
        match token {
            GqlToken::Punct('{') => {
                if depth == 0 {
                    if !pending_definition {
                        count += 1;
                    }
                    pending_definition = false;
                }
                depth += 1;
            }
            GqlToken::Punct('}') => depth = depth.saturating_sub(1),
            GqlToken::Name(name) if depth == 0 && !pending_definition => match name.as_str() {
                "query" | "mutation" | "subscription" => {
                    count += 1;
                    pending_definition = true;
                }
                "fragment" => pending_definition = true,
                _ => {}
            },
            _ => {}
        }
    }
    count
}
