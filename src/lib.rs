//! Natural-language query translation over relational, document, graph and
//! GraphQL backends.
//!
//! The [`orchestrator::Orchestrator`] composes the pipeline: it resolves a
//! [`connector::ConnectionProfile`], obtains the backend schema through the
//! shared [`schema::SchemaCache`], builds a prompt, asks the configured
//! language model for one candidate, validates it against the destructive
//! operation deny-list, and optionally executes it.
pub mod backend;
pub mod config;
pub mod connector;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod prompt;
pub mod schema;
pub mod synth;

pub use backend::{Backend, DialectFamily};
pub use config::Config;
pub use error::{ErrorKind, ErrorRecord};
pub use orchestrator::{Orchestrator, TranslateRequest, TranslateResponse};
