use crate::source::Message;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Identifies a window by its start, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(i64);

impl WindowId {
    pub fn from_start(start: DateTime<Utc>) -> Self {
        Self(start.timestamp_millis())
    }

    pub fn start_millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(start) => write!(f, "{}", start.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Accepting messages
    Open,
    /// Handed to a committer; no further messages join
    Closing,
    Committed,
    /// Commit retries exhausted; retained until reopened or discarded
    Failed,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowState::Open => "open",
            WindowState::Closing => "closing",
            WindowState::Committed => "committed",
            WindowState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A tumbling window: the half-open interval `[start, end)` and its messages
/// in arrival order.
#[derive(Debug, Clone)]
pub struct Window {
    pub id: WindowId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub state: WindowState,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: WindowId::from_start(start),
            start,
            end,
            messages: Vec::new(),
            state: WindowState::Open,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Where an assigned message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRef {
    pub id: WindowId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Position of the message within the window
    pub position: usize,
}

/// Snapshot of a window handed out for commit.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub id: WindowId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl ClosedWindow {
    pub(crate) fn from_window(window: &Window) -> Self {
        Self {
            id: window.id,
            start: window.start,
            end: window.end,
            messages: window.messages.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateReason {
    /// The window's lateness allowance had already passed
    PastAllowedLateness,
    /// The window had already been handed out for commit
    WindowClosed,
}

impl fmt::Display for LateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LateReason::PastAllowedLateness => f.write_str("past allowed lateness"),
            LateReason::WindowClosed => f.write_str("window already closed"),
        }
    }
}

/// A message that arrived too late to join its window.
#[derive(Debug, Clone)]
pub struct LateMessage {
    pub message: Message,
    pub window_id: WindowId,
    pub watermark: Option<DateTime<Utc>>,
    pub reason: LateReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub open_windows: usize,
    pub closing_windows: usize,
    pub failed_windows: usize,
    pub buffered_messages: usize,
    pub paused: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window {0} is not buffered")]
    Unknown(WindowId),

    #[error("window {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: WindowId,
        from: WindowState,
        to: WindowState,
    },
}
