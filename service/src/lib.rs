//! The inventory sync service process.
//!
//! Wires the engine to its production collaborators: Redpanda for inbound
//! events, PostgreSQL for dead letters, an HTTP source of record for
//! reconciliation and the log as the audit trail. Serves the query and
//! operator API plus a Prometheus endpoint, and stops every background task
//! on Ctrl+C or SIGTERM.

pub mod app;
pub mod audit;
pub mod config;
pub mod source_of_record;

pub use audit::TracingAuditSink;
pub use config::ServiceConfig;
pub use source_of_record::HttpSourceOfRecord;
