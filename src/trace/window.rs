//! The rolling sampling window.
//!
//! The reservoir samples within one window at a time. When the wall clock
//! crosses the window end, the window advances by its duration and the
//! previous window's identity is handed back so the caller can drain the
//! reservoir downstream.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Identity and bounds of one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    /// Monotonically increasing window number.
    pub window_id: u64,
    /// Inclusive window start.
    pub start: SystemTime,
    /// Exclusive window end.
    pub end: SystemTime,
    /// Stream positions consumed within the window.
    pub stream_count: u64,
}

/// The active sampling window.
pub struct TimeWindow {
    duration: Duration,
    state: Mutex<WindowState>,
}

impl TimeWindow {
    /// Opens window 0 starting now.
    pub fn new(duration: Duration) -> Self {
        let start = SystemTime::now();
        Self {
            duration,
            state: Mutex::new(WindowState {
                window_id: 0,
                start,
                end: start + duration,
                stream_count: 0,
            }),
        }
    }

    /// Returns the active window.
    pub fn current(&self) -> WindowState {
        *self.state.lock()
    }

    /// Restores the window from checkpointed state.
    pub fn set_state(&self, window_id: u64, start: SystemTime, end: SystemTime, stream_count: u64) {
        let mut state = self.state.lock();
        state.window_id = window_id;
        state.start = start;
        state.end = end;
        state.stream_count = stream_count;
    }

    /// Records the window's stream position, kept in sync with the
    /// reservoir by the owning processor.
    pub fn record_stream_count(&self, stream_count: u64) {
        self.state.lock().stream_count = stream_count;
    }

    /// Advances past every window whose end the wall clock has crossed.
    ///
    /// Returns the window that was active before the first advance, or None
    /// when the current window is still open. Called once per maintenance
    /// tick, so a long stall skips straight to the window containing `now`
    /// while still reporting a single rollover. The stream count restarts
    /// at zero in the new window.
    pub fn maybe_rollover(&self) -> Option<WindowState> {
        let now = SystemTime::now();
        let mut state = self.state.lock();
        if now < state.end {
            return None;
        }
        let finished = *state;
        while state.end <= now {
            state.window_id += 1;
            state.start = state.end;
            state.end = state.start + self.duration;
        }
        state.stream_count = 0;
        Some(finished)
    }
}
