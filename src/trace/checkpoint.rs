//! Durable checkpoint store for the span reservoir.
//!
//! The store is an append-only log of JSON snapshot records in a single
//! file. `checkpoint` appends one fsynced record; `load_checkpoint` replays
//! the log and returns the last record that parses, so a crash mid-append
//! leaves the previous snapshot intact. `compact` rewrites the log down to
//! its latest record through a temp file and an atomic rename.

use crate::core::types::Span;
use crate::core::{Result, SiftError};
use crate::monitoring::MetricsReporter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// One durable snapshot of the reservoir and its window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Window number the snapshot belongs to.
    pub window_id: u64,
    /// Window start.
    pub start: SystemTime,
    /// Window end.
    pub end: SystemTime,
    /// Stream positions consumed in the window.
    pub stream_count: u64,
    /// Reservoir contents keyed by span identity.
    pub spans: HashMap<String, Span>,
}

impl Default for CheckpointSnapshot {
    fn default() -> Self {
        Self {
            window_id: 0,
            start: UNIX_EPOCH,
            end: UNIX_EPOCH,
            stream_count: 0,
            spans: HashMap::new(),
        }
    }
}

impl CheckpointSnapshot {
    /// Returns true when this is the empty pre-first-checkpoint snapshot.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.stream_count == 0 && self.start == UNIX_EPOCH
    }
}

/// File-backed checkpoint store. One instance owns its file exclusively.
pub struct CheckpointStore {
    path: PathBuf,
    target_size_bytes: u64,
    reporter: Arc<dyn MetricsReporter>,
    last_checkpoint_at: Mutex<Option<Instant>>,
    writes_serialized: Mutex<()>,
}

impl CheckpointStore {
    /// Opens (or prepares to create) the store at `path`.
    pub fn new(
        path: PathBuf,
        target_size_bytes: u64,
        reporter: Arc<dyn MetricsReporter>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SiftError::checkpoint_write(format!(
                        "cannot create checkpoint directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Ok(Self {
            path,
            target_size_bytes,
            reporter,
            last_checkpoint_at: Mutex::new(None),
            writes_serialized: Mutex::new(()),
        })
    }

    /// Atomically replaces the stored snapshot.
    ///
    /// After this returns, `load_checkpoint` observes the new snapshot; if
    /// the process dies mid-write, it observes the previous one.
    pub fn checkpoint(&self, snapshot: &CheckpointSnapshot) -> Result<()> {
        let _write_lock = self.writes_serialized.lock();
        let mut line = serde_json::to_string(snapshot)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                SiftError::checkpoint_write(format!("cannot open {}: {e}", self.path.display()))
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| {
                SiftError::checkpoint_write(format!("cannot append to {}: {e}", self.path.display()))
            })?;

        *self.last_checkpoint_at.lock() = Some(Instant::now());
        self.reporter.report_checkpoint_age(Duration::ZERO);
        self.report_size();
        debug!(
            window_id = snapshot.window_id,
            spans = snapshot.spans.len(),
            "checkpoint committed"
        );
        Ok(())
    }

    /// Returns the last fully committed snapshot, or the empty snapshot
    /// when none has ever been written.
    pub fn load_checkpoint(&self) -> Result<CheckpointSnapshot> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointSnapshot::default());
            }
            Err(e) => {
                return Err(SiftError::checkpoint_read(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let mut latest = None;
        let mut skipped = 0usize;
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointSnapshot>(line) {
                Ok(snapshot) => latest = Some(snapshot),
                // A torn record from a crash mid-append is expected once,
                // at the log tail.
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, path = %self.path.display(), "skipped unparseable checkpoint records");
        }
        Ok(latest.unwrap_or_default())
    }

    /// Rewrites the log down to its latest snapshot when it has outgrown
    /// the target size. Returns true when a compaction ran.
    pub fn compact(&self) -> Result<bool> {
        let _write_lock = self.writes_serialized.lock();
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(SiftError::checkpoint_write(format!(
                    "cannot stat {}: {e}",
                    self.path.display()
                )));
            }
        };
        if size <= self.target_size_bytes {
            return Ok(false);
        }

        let latest = self.load_checkpoint()?;
        let mut line = serde_json::to_string(&latest)?;
        line.push('\n');

        let tmp_path = self.path.with_extension("compact.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| {
                SiftError::checkpoint_write(format!("cannot create {}: {e}", tmp_path.display()))
            })?;
            tmp.write_all(line.as_bytes())
                .and_then(|()| tmp.sync_all())
                .map_err(|e| {
                    SiftError::checkpoint_write(format!(
                        "cannot write {}: {e}",
                        tmp_path.display()
                    ))
                })?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            SiftError::checkpoint_write(format!(
                "cannot replace {} with compacted log: {e}",
                self.path.display()
            ))
        })?;

        self.reporter.report_compactions(1);
        self.report_size();
        debug!(previous_size = size, path = %self.path.display(), "compacted checkpoint log");
        Ok(true)
    }

    /// Time since the last successful checkpoint in this process.
    pub fn age(&self) -> Option<Duration> {
        let at = *self.last_checkpoint_at.lock();
        at.map(|at| at.elapsed())
    }

    /// Publishes the checkpoint-age gauge.
    pub fn report_age(&self) {
        if let Some(age) = self.age() {
            self.reporter.report_checkpoint_age(age);
        }
    }

    /// Current store file size in bytes.
    pub fn size_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn report_size(&self) {
        self.reporter.report_db_size(self.size_bytes());
    }
}
