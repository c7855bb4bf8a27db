use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{info, warn};

/// Per-request pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    SchemaReady,
    CandidateGenerated,
    Executed,
    ReturnedUnexecuted,
    SchemaFailed,
    SynthesisFailed,
    ExecutionFailed,
}

impl RequestState {
    pub fn label(&self) -> &'static str {
        match self {
            RequestState::Received => "RECEIVED",
            RequestState::SchemaReady => "SCHEMA_READY",
            RequestState::CandidateGenerated => "CANDIDATE_GENERATED",
            RequestState::Executed => "EXECUTED",
            RequestState::ReturnedUnexecuted => "RETURNED_UNEXECUTED",
            RequestState::SchemaFailed => "SCHEMA_FAILED",
            RequestState::SynthesisFailed => "SYNTHESIS_FAILED",
            RequestState::ExecutionFailed => "EXECUTION_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Executed
                | RequestState::ReturnedUnexecuted
                | RequestState::SchemaFailed
                | RequestState::SynthesisFailed
                | RequestState::ExecutionFailed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestState::Executed | RequestState::ReturnedUnexecuted)
    }

    /// Legal edges. EXECUTION_FAILED → CANDIDATE_GENERATED is the bounded
    /// syntax retry; SYNTHESIS_FAILED is reachable from CANDIDATE_GENERATED
    /// when validation rejects the candidate.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, SchemaReady)
                | (Received, SchemaFailed)
                | (SchemaReady, CandidateGenerated)
                | (SchemaReady, SynthesisFailed)
                | (CandidateGenerated, Executed)
                | (CandidateGenerated, ReturnedUnexecuted)
                | (CandidateGenerated, ExecutionFailed)
                | (CandidateGenerated, SynthesisFailed)
                | (ExecutionFailed, CandidateGenerated)
                | (ExecutionFailed, SynthesisFailed)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub component: &'static str,
    pub state: RequestState,
    /// Milliseconds since the request was received.
    pub elapsed_ms: u64,
}

/// Tracks one request through the state machine, logging every transition.
#[derive(Debug)]
pub struct RequestTracker {
    request_id: u64,
    state: RequestState,
    started: Instant,
    transitions: Vec<Transition>,
}

impl RequestTracker {
    pub fn new(request_id: u64) -> Self {
        let tracker = Self {
            request_id,
            state: RequestState::Received,
            started: Instant::now(),
            transitions: vec![Transition {
                component: "orchestrator",
                state: RequestState::Received,
                elapsed_ms: 0,
            }],
        };
        info!(
            request_id,
            component = "orchestrator",
            state = RequestState::Received.label(),
            elapsed_ms = 0u64,
            "request state"
        );
        tracker
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn advance(&mut self, component: &'static str, next: RequestState) {
        if !self.state.can_transition_to(next) {
            warn!(
                request_id = self.request_id,
                from = self.state.label(),
                to = next.label(),
                "unexpected request state transition"
            );
        }
        let elapsed_ms = self.elapsed_ms();
        info!(
            request_id = self.request_id,
            component,
            state = next.label(),
            elapsed_ms,
            "request state"
        );
        self.state = next;
        self.transitions.push(Transition {
            component,
            state: next,
            elapsed_ms,
        });
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<Transition> {
        self.transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut tracker = RequestTracker::new(1);
        tracker.advance("schema_cache", RequestState::SchemaReady);
        tracker.advance("synthesizer", RequestState::CandidateGenerated);
        tracker.advance("executor", RequestState::Executed);
        assert!(tracker.state().is_terminal());
        assert!(tracker.state().is_success());
        let states: Vec<RequestState> = tracker.transitions().iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                RequestState::Received,
                RequestState::SchemaReady,
                RequestState::CandidateGenerated,
                RequestState::Executed
            ]
        );
    }

    #[test]
    fn test_retry_edge_is_legal() {
        assert!(RequestState::ExecutionFailed.can_transition_to(RequestState::CandidateGenerated));
        assert!(RequestState::CandidateGenerated.can_transition_to(RequestState::SynthesisFailed));
        assert!(!RequestState::Received.can_transition_to(RequestState::Executed));
        assert!(!RequestState::Executed.can_transition_to(RequestState::CandidateGenerated));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RequestState::Received.is_terminal());
        assert!(!RequestState::CandidateGenerated.is_terminal());
        assert!(RequestState::SchemaFailed.is_terminal());
        assert!(!RequestState::SchemaFailed.is_success());
    }

    #[test]
    fn test_state_serializes_screaming_snake_case() {
        for state in [
            RequestState::Received,
            RequestState::CandidateGenerated,
            RequestState::ReturnedUnexecuted,
            RequestState::ExecutionFailed,
        ] {
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.label())
            );
        }
    }
}
