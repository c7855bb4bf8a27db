//! Executes validated candidates and maps connector rows into the uniform
//! result shape.
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use crate::connector::{Connector, ExecutionLimits, Row, RowSet};
use crate::error::{ExecutionError, FailureKind};
use crate::synth::ValidatedCandidate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub elapsed_ms: u64,
    /// The backend had more rows than `max_rows`.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    limits: ExecutionLimits,
}

impl Executor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    /// Run the candidate once. The candidate is consumed either way.
    pub async fn execute(
        &self,
        candidate: ValidatedCandidate,
        connector: &dyn Connector,
    ) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.limits.timeout,
            connector.execute(candidate.text(), &self.limits),
        )
        .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let set = match outcome {
            Ok(Ok(set)) => set,
            Ok(Err(e)) => {
                debug!(kind = %e.kind, backend_message = %e.message, "execution failed");
                return Err(ExecutionError {
                    kind: e.kind,
                    candidate: candidate.into_text(),
                    backend_message: e.message,
                });
            }
            Err(_) => {
                return Err(ExecutionError {
                    kind: FailureKind::Connection,
                    candidate: candidate.into_text(),
                    backend_message: format!(
                        "execution timed out after {}s",
                        self.limits.timeout.as_secs()
                    ),
                });
            }
        };

        let (columns, rows, truncated) = map_rows(set, self.limits.max_rows);
        info!(
            backend = %connector.backend(),
            rows = rows.len(),
            truncated,
            elapsed_ms,
            "query executed"
        );
        Ok(ExecutionResult {
            columns,
            row_count: rows.len(),
            rows,
            elapsed_ms,
            truncated,
        })
    }
}

/// Pair each value with its column name, keeping at most `max_rows` rows.
pub fn map_rows(set: RowSet, max_rows: usize) -> (Vec<String>, Vec<Row>, bool) {
    let truncated = set.rows.len() > max_rows;
    let columns = set.columns;
    let rows = set
        .rows
        .into_iter()
        .take(max_rows)
        .map(|values| Row(columns.iter().cloned().zip(values).collect()))
        .collect();
    (columns, rows, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::connector::CellValue;
    use crate::error::ConnectorError;
    use crate::schema::SchemaDescriptor;
    use crate::synth::{validate, QueryCandidate, SafetyMode};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedConnector {
        result: Result<RowSet, ConnectorError>,
        delay: Duration,
    }

    #[async_trait]
    impl Connector for FixedConnector {
        fn backend(&self) -> Backend {
            Backend::Postgres
        }

        async fn connect(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn introspect_schema(&self) -> Result<SchemaDescriptor, ConnectorError> {
            Ok(SchemaDescriptor::new(Backend::Postgres, vec![]))
        }

        async fn execute(&self, _query: &str, _limits: &ExecutionLimits) -> Result<RowSet, ConnectorError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }

        async fn close(&self) {}
    }

    fn candidate(text: &str) -> ValidatedCandidate {
        validate(QueryCandidate::generated(Backend::Postgres, text.into()), SafetyMode::Gate).unwrap()
    }

    fn numbers(n: i64) -> RowSet {
        let mut set = RowSet::new(vec!["n".into(), "label".into()]);
        for i in 0..n {
            set.rows.push(vec![CellValue::Int64(i), CellValue::Text(format!("row {i}"))]);
        }
        set
    }

    #[test]
    fn test_map_rows_pairs_columns() {
        let (columns, rows, truncated) = map_rows(numbers(2), 10);
        assert_eq!(columns, vec!["n", "label"]);
        assert!(!truncated);
        assert_eq!(rows[1].get("label"), Some(&CellValue::Text("row 1".into())));
        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"n":0,"label":"row 0"}"#
        );
    }

    #[test]
    fn test_map_rows_truncates() {
        let (_, rows, truncated) = map_rows(numbers(11), 10);
        assert_eq!(rows.len(), 10);
        assert!(truncated);
        let (_, rows, truncated) = map_rows(numbers(10), 10);
        assert_eq!(rows.len(), 10);
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_execute_success() {
        let connector = FixedConnector {
            result: Ok(numbers(3)),
            delay: Duration::ZERO,
        };
        let executor = Executor::new(ExecutionLimits {
            max_rows: 2,
            timeout: Duration::from_secs(5),
        });
        let result = executor.execute(candidate("SELECT n FROM t"), &connector).await.unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_execute_failure_keeps_kind_and_candidate() {
        let connector = FixedConnector {
            result: Err(ConnectorError::permission("permission denied for table t")),
            delay: Duration::ZERO,
        };
        let err = Executor::default()
            .execute(candidate("SELECT n FROM t"), &connector)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Permission);
        assert_eq!(err.candidate, "SELECT n FROM t");
        assert_eq!(err.backend_message, "permission denied for table t");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_timeout_is_connection_failure() {
        let connector = FixedConnector {
            result: Ok(numbers(1)),
            delay: Duration::from_secs(120),
        };
        let executor = Executor::new(ExecutionLimits {
            max_rows: 10,
            timeout: Duration::from_secs(1),
        });
        let err = executor.execute(candidate("SELECT 1"), &connector).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Connection);
        assert!(err.backend_message.contains("timed out"));
    }
}
