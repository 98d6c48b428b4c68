//! Audit trail for scan sessions.
//!
//! Every session writes `SessionStart`, one `PolicyVerdict` per result,
//! `Aggregation` when remediation ran and `SessionEnd`. Problems that do not
//! abort the session are recorded as `Error` entries.
//!
//! Records are JSON Lines in rotating segments. Audit records are kept apart
//! from diagnostic logging and never go through `tracing`.

mod entry;
mod logger;
mod store;

pub use entry::{AuditEntryType, AuditEvent, AuditLogEntry};
pub use logger::{AuditLogger, AuditWriteError, RotationPolicy};
pub use store::{segment_file_name, FileSegmentStore, MemorySegment, MemorySegmentStore, SegmentStore};
