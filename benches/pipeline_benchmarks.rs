//! Benchmarks for the CPU-bound pipeline stages.
//!
//! - Prompt assembly over schemas of increasing size
//! - Candidate extraction from model responses
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nlquery::backend::Backend;
use nlquery::prompt::{build_prompt, PriorAttempt, PromptBudget, PromptInput};
use nlquery::schema::{Field, Relation, RelationKind, SchemaDescriptor};
use nlquery::synth::extract_candidate;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

fn synthetic_schema(tables: usize) -> SchemaDescriptor {
    let relations = (0..tables)
        .map(|i| {
            let fields = (0..12)
                .map(|f| Field::new(format!("column_{f}"), "character varying"))
                .chain([
                    Field::new("id", "bigint").not_null(),
                    Field::new("created_at", "timestamp with time zone"),
                ])
                .collect();
            Relation::new(format!("table_{i:04}"), RelationKind::Table)
                .with_fields(fields)
                .with_keys(vec!["id".into()])
        })
        .chain([Relation::new("orders", RelationKind::Table).with_fields(vec![
            Field::new("id", "bigint").not_null(),
            Field::new("customer_id", "bigint"),
            Field::new("created_at", "timestamp with time zone"),
        ])])
        .collect();
    SchemaDescriptor::new(Backend::Postgres, relations)
}

const FENCED_SQL: &str = "Here is the query:\n\n```sql\nSELECT o.id, o.created_at \
    FROM orders o WHERE o.created_at > now() - interval '7 days' ORDER BY o.created_at DESC;\n```\n\
    It returns last week's orders.";

const UNFENCED_SQL: &str = "The following query answers the request.\n\n\
    WITH recent AS (SELECT id, customer_id FROM orders WHERE created_at > '2024-01-01')\n\
    SELECT customer_id, COUNT(*) FROM recent GROUP BY customer_id";

const FENCED_CYPHER: &str = "```cypher\nMATCH (p:Person {name: 'Ada'})-[:KNOWS]->(f:Person) \
    RETURN f.name ORDER BY f.name\n```";

const FENCED_JSON: &str = "```json\n{\"selector\": {\"type\": \"order\", \"total\": {\"$gt\": 100}}, \
    \"fields\": [\"_id\", \"total\"], \"sort\": [{\"total\": \"desc\"}]}\n```";

const FENCED_GRAPHQL: &str = "```graphql\nquery RecentOrders {\n  orders(first: 20, orderBy: CREATED_AT_DESC) \
    {\n    id\n    total\n    customer { name }\n  }\n}\n```";

// ---------------------------------------------------------------------------
// Benchmark groups
// ---------------------------------------------------------------------------

fn bench_prompt(c: &mut Criterion) {
    let mut group = c.benchmark_group("prompt");

    for tables in [10, 100, 1000] {
        let schema = synthetic_schema(tables);
        group.bench_with_input(BenchmarkId::new("build", tables), &schema, |b, schema| {
            b.iter(|| {
                build_prompt(black_box(&PromptInput {
                    request: "list orders created in the last week",
                    schema,
                    backend: Backend::Postgres,
                    prior: None,
                    budget: PromptBudget::default(),
                }))
            });
        });
    }

    let schema = synthetic_schema(100);
    let prior = PriorAttempt {
        candidate: "SELECT * FROM ordrs".into(),
        error: "relation \"ordrs\" does not exist".into(),
    };
    group.bench_function("build_with_prior_attempt", |b| {
        b.iter(|| {
            build_prompt(black_box(&PromptInput {
                request: "list orders created in the last week",
                schema: &schema,
                backend: Backend::Postgres,
                prior: Some(&prior),
                budget: PromptBudget::default(),
            }))
        });
    });

    group.finish();
}

fn bench_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("extraction");

    let cases = [
        ("fenced_sql", FENCED_SQL, Backend::Postgres),
        ("unfenced_sql", UNFENCED_SQL, Backend::Postgres),
        ("redshift", FENCED_SQL, Backend::Redshift),
        ("cypher", FENCED_CYPHER, Backend::Neo4j),
        ("json", FENCED_JSON, Backend::CouchDb),
        ("graphql", FENCED_GRAPHQL, Backend::GraphQl),
    ];

    for (name, response, backend) in &cases {
        group.bench_with_input(BenchmarkId::new("extract", name), response, |b, response| {
            b.iter(|| extract_candidate(black_box(response), *backend).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_prompt, bench_extraction);
criterion_main!(benches);
