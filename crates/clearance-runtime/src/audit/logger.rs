//! Append-only audit logger with segment rotation.

use chrono::Utc;
use parking_lot::Mutex;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::entry::{AuditEvent, AuditLogEntry};
use super::store::{FileSegmentStore, SegmentStore};
use crate::config::AuditConfig;

/// Failure to persist an audit entry. Never aborts a scan session.
#[derive(Error, Debug)]
pub enum AuditWriteError {
    #[error("Failed to write audit entry: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// When to start a new segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate before a segment would grow past this size
    pub max_bytes: u64,

    /// Rotate once a segment has been open this long
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::from(&AuditConfig::default())
    }
}

impl From<&AuditConfig> for RotationPolicy {
    fn from(config: &AuditConfig) -> Self {
        Self {
            max_bytes: config.max_segment_bytes,
            max_age: config.max_segment_age,
        }
    }
}

struct WriterState {
    store: Box<dyn SegmentStore>,
    next_seq: u64,
    segment_bytes: u64,
    segment_opened_at: Option<Instant>,
    rotation_requested: bool,
}

impl WriterState {
    fn needs_new_segment(&self, record_len: u64, policy: &RotationPolicy) -> bool {
        let Some(opened_at) = self.segment_opened_at else {
            return true;
        };
        if self.segment_bytes == 0 {
            return false;
        }
        self.rotation_requested
            || self.segment_bytes + record_len > policy.max_bytes
            || opened_at.elapsed() >= policy.max_age
    }

    fn begin_segment(&mut self) -> io::Result<()> {
        self.store.begin_segment(self.next_seq)?;
        self.segment_bytes = 0;
        self.segment_opened_at = Some(Instant::now());
        self.rotation_requested = false;
        Ok(())
    }
}

/// Single-writer audit trail.
///
/// Sequence numbers start at 1 and increase by one per successful append,
/// continuously across segments. An entry is one JSON line written with a
/// single store call and is never split across segments. A failed append
/// consumes no sequence number.
pub struct AuditLogger {
    state: Mutex<WriterState>,
    policy: RotationPolicy,
}

impl AuditLogger {
    pub fn new(store: impl SegmentStore + 'static, policy: RotationPolicy) -> Self {
        Self {
            state: Mutex::new(WriterState {
                store: Box::new(store),
                next_seq: 1,
                segment_bytes: 0,
                segment_opened_at: None,
                rotation_requested: false,
            }),
            policy,
        }
    }

    /// File-backed logger in the configured directory.
    pub fn open(config: &AuditConfig) -> Result<Self, AuditWriteError> {
        let store = FileSegmentStore::open(&config.directory)?;
        Ok(Self::new(store, RotationPolicy::from(config)))
    }

    /// Persist one entry and return its sequence number.
    pub fn append(&self, event: AuditEvent) -> Result<u64, AuditWriteError> {
        let mut state = self.state.lock();

        let entry = AuditLogEntry {
            seq: state.next_seq,
            timestamp: Utc::now(),
            request_id: event.request_id,
            entry_type: event.entry_type,
            payload: event.payload,
        };
        let mut record = serde_json::to_vec(&entry)?;
        record.push(b'\n');
        let record_len = record.len() as u64;

        if state.needs_new_segment(record_len, &self.policy) {
            state.begin_segment()?;
        }

        if let Err(e) = state.store.append(&record) {
            // A partial record may be on disk, so the segment is abandoned
            // even when nothing was written to it successfully.
            state.rotation_requested = state.segment_bytes > 0;
            if state.segment_bytes == 0 {
                state.segment_opened_at = None;
            }
            return Err(e.into());
        }

        state.segment_bytes += record_len;
        state.next_seq += 1;
        Ok(entry.seq)
    }

    /// Start a new segment before the next entry.
    pub fn force_rotate(&self) {
        self.state.lock().rotation_requested = true;
    }

    /// Sequence number the next successful append will get.
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_seq
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("next_seq", &self.next_sequence())
            .field("policy", &self.policy)
            .finish()
    }
}
