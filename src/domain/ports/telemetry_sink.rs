//! Telemetry Sink Port
//!
//! Defines where finished query attempt records go.

use crate::domain::query_record::QueryAttemptRecord;

/// Best-effort destination for finished records.
///
/// `send` must never block or fail the caller. A sink that cannot keep up
/// drops records and counts the drops.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, record: QueryAttemptRecord);
}
