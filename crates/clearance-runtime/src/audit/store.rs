//! Segment storage for the audit trail.
//!
//! A store only knows how to start a segment and append bytes to the
//! active one. Sequencing and rotation decisions belong to the logger.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::entry::AuditLogEntry;

const SEGMENT_PREFIX: &str = "audit-";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// Backing storage for audit segments.
pub trait SegmentStore: Send {
    /// Close the active segment, if any, and open a new one whose first entry
    /// will carry `first_seq`.
    fn begin_segment(&mut self, first_seq: u64) -> io::Result<()>;

    /// Append one complete record to the active segment in a single write.
    fn append(&mut self, record: &[u8]) -> io::Result<()>;
}

/// Segment file name: `audit-{index:06}-{first_seq:012}.jsonl`.
pub fn segment_file_name(index: u64, first_seq: u64) -> String {
    format!("{}{:06}-{:012}{}", SEGMENT_PREFIX, index, first_seq, SEGMENT_SUFFIX)
}

fn segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    rest.split('-').next()?.parse().ok()
}

/// JSON Lines segments in one directory.
#[derive(Debug)]
pub struct FileSegmentStore {
    directory: PathBuf,
    next_index: u64,
    active: Option<File>,
}

impl FileSegmentStore {
    /// Open a store. Numbering continues after any segments already present,
    /// so earlier runs are never overwritten.
    pub fn open(directory: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let next_index = Self::segments(&directory)?
            .iter()
            .filter_map(|p| segment_index(p))
            .max()
            .map_or(1, |i| i + 1);

        Ok(Self {
            directory,
            next_index,
            active: None,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Segment files in `directory`, oldest first.
    pub fn segments(directory: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| segment_index(p).is_some())
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Read every entry from every segment, oldest first. Lines that do not
    /// parse (a record cut short by a failed write) are skipped.
    pub fn read_entries(directory: &Path) -> io::Result<Vec<AuditLogEntry>> {
        let mut entries = Vec::new();
        for path in Self::segments(directory)? {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditLogEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => tracing::warn!(
                        segment = %path.display(),
                        error = %e,
                        "Skipping unreadable audit record"
                    ),
                }
            }
        }
        Ok(entries)
    }
}

impl SegmentStore for FileSegmentStore {
    fn begin_segment(&mut self, first_seq: u64) -> io::Result<()> {
        if let Some(mut file) = self.active.take() {
            file.flush()?;
        }

        let path = self
            .directory
            .join(segment_file_name(self.next_index, first_seq));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        tracing::debug!(segment = %path.display(), first_seq, "Opened audit segment");
        self.next_index += 1;
        self.active = Some(file);
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let file = self
            .active
            .as_mut()
            .ok_or_else(|| io::Error::other("no active audit segment"))?;
        file.write_all(record)?;
        file.flush()
    }
}

/// One in-memory segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySegment {
    pub first_seq: u64,
    pub bytes: Vec<u8>,
}

impl MemorySegment {
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_slice(line).ok())
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    segments: Vec<MemorySegment>,
    failing_appends: usize,
}

/// In-memory store. Clones share the same segments, so a test can keep a
/// handle after giving one to the logger.
#[derive(Debug, Clone, Default)]
pub struct MemorySegmentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail without writing anything.
    pub fn fail_appends(&self, count: usize) {
        self.state.lock().failing_appends = count;
    }

    pub fn segments(&self) -> Vec<MemorySegment> {
        self.state.lock().segments.clone()
    }

    /// Every entry across all segments, in write order.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.segments().iter().flat_map(MemorySegment::entries).collect()
    }
}

impl SegmentStore for MemorySegmentStore {
    fn begin_segment(&mut self, first_seq: u64) -> io::Result<()> {
        self.state.lock().segments.push(MemorySegment {
            first_seq,
            bytes: Vec::new(),
        });
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(io::Error::other("injected audit write failure"));
        }
        let segment = state
            .segments
            .last_mut()
            .ok_or_else(|| io::Error::other("no active audit segment"))?;
        segment.bytes.extend_from_slice(record);
        Ok(())
    }
}
