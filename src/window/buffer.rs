use super::types::*;
use crate::source::Message;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Assigns messages to tumbling windows and hands out windows whose
/// watermark has passed.
///
/// Window membership depends only on event time, so redelivered or
/// out-of-order messages always land in the same window.
pub struct WindowBuffer {
    duration_ms: i64,
    allowed_lateness: chrono::Duration,
    windows: BTreeMap<WindowId, Window>,
    paused: bool,
}

impl WindowBuffer {
    /// Durations are truncated to whole milliseconds, with a floor of 1ms.
    pub fn new(duration: Duration, allowed_lateness: Duration) -> Self {
        let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1);
        Self {
            duration_ms,
            allowed_lateness: chrono::Duration::from_std(allowed_lateness)
                .unwrap_or(chrono::Duration::MAX),
            windows: BTreeMap::new(),
            paused: false,
        }
    }

    /// Start of the window containing `t`.
    pub fn window_start_for(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let millis = t.timestamp_millis();
        let start = millis - millis.rem_euclid(self.duration_ms);
        DateTime::<Utc>::from_timestamp_millis(start).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn window_end_for(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_signed(chrono::Duration::milliseconds(self.duration_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn lateness_passed(&self, end: DateTime<Utc>, watermark: Option<DateTime<Utc>>) -> bool {
        let Some(watermark) = watermark else {
            return false;
        };
        match end.checked_add_signed(self.allowed_lateness) {
            Some(deadline) => deadline <= watermark,
            None => false,
        }
    }

    /// Put a message into its window, or hand it back if it is late.
    pub fn assign(
        &mut self,
        message: Message,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<WindowRef, LateMessage> {
        let start = self.window_start_for(message.event_time());
        let end = self.window_end_for(start);
        let id = WindowId::from_start(start);

        let reason = match self.windows.get(&id) {
            Some(window) if window.state != WindowState::Open => Some(LateReason::WindowClosed),
            _ if self.lateness_passed(end, watermark) => Some(LateReason::PastAllowedLateness),
            _ => None,
        };
        if let Some(reason) = reason {
            debug!(
                message_id = %message.id,
                window_start = %id,
                reason = %reason,
                "Late message"
            );
            return Err(LateMessage {
                message,
                window_id: id,
                watermark,
                reason,
            });
        }

        let window = self.windows.entry(id).or_insert_with(|| {
            debug!(window_start = %id, "Opened window");
            Window::new(start, end)
        });
        window.messages.push(message);

        Ok(WindowRef {
            id,
            start,
            end,
            position: window.messages.len() - 1,
        })
    }

    /// Windows ready to commit under `watermark`, oldest first.
    ///
    /// Each returned window moves to `Closing`. Nothing is returned while paused.
    pub fn poll_closed_windows(&mut self, watermark: Option<DateTime<Utc>>) -> Vec<ClosedWindow> {
        if self.paused || watermark.is_none() {
            return Vec::new();
        }

        let ready: Vec<WindowId> = self
            .windows
            .values()
            .filter(|w| w.state == WindowState::Open && self.lateness_passed(w.end, watermark))
            .map(|w| w.id)
            .collect();

        self.close_all(ready)
    }

    /// Every open window regardless of watermark, for shutdown.
    pub fn drain(&mut self) -> Vec<ClosedWindow> {
        let open: Vec<WindowId> = self
            .windows
            .values()
            .filter(|w| w.state == WindowState::Open)
            .map(|w| w.id)
            .collect();

        if !open.is_empty() {
            info!(windows = open.len(), "Draining open windows");
        }
        self.close_all(open)
    }

    fn close_all(&mut self, ids: Vec<WindowId>) -> Vec<ClosedWindow> {
        // BTreeMap order is start order; with a fixed duration that is also end order
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(window) = self.windows.get_mut(&id) {
                window.state = WindowState::Closing;
                debug!(
                    window_start = %window.id,
                    messages = window.messages.len(),
                    "Closed window"
                );
                closed.push(ClosedWindow::from_window(window));
            }
        }
        closed
    }

    fn transition(
        &mut self,
        id: WindowId,
        from: WindowState,
        to: WindowState,
    ) -> Result<&mut Window, WindowError> {
        let window = self.windows.get_mut(&id).ok_or(WindowError::Unknown(id))?;
        if window.state != from {
            return Err(WindowError::InvalidTransition {
                id,
                from: window.state,
                to,
            });
        }
        window.state = to;
        Ok(window)
    }

    /// The window's batch is durably written; forget it.
    pub fn mark_committed(&mut self, id: WindowId) -> Result<(), WindowError> {
        self.transition(id, WindowState::Closing, WindowState::Committed)?;
        self.windows.remove(&id);
        Ok(())
    }

    /// Commit retries ran out; keep the window for inspection or replay.
    pub fn mark_failed(&mut self, id: WindowId) -> Result<(), WindowError> {
        self.transition(id, WindowState::Closing, WindowState::Failed)?;
        Ok(())
    }

    /// Hand a failed window out again with its contents unchanged.
    pub fn reopen(&mut self, id: WindowId) -> Result<ClosedWindow, WindowError> {
        let window = self.transition(id, WindowState::Failed, WindowState::Closing)?;
        Ok(ClosedWindow::from_window(window))
    }

    /// Drop a failed window after its messages were quarantined.
    pub fn discard(&mut self, id: WindowId) -> Result<(), WindowError> {
        let window = self.windows.get(&id).ok_or(WindowError::Unknown(id))?;
        if window.state != WindowState::Failed {
            return Err(WindowError::InvalidTransition {
                id,
                from: window.state,
                to: WindowState::Committed,
            });
        }
        self.windows.remove(&id);
        Ok(())
    }

    pub fn state_of(&self, id: WindowId) -> Option<WindowState> {
        self.windows.get(&id).map(|w| w.state)
    }

    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Window polling paused");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            debug!("Window polling resumed");
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        let mut stats = BufferStats {
            paused: self.paused,
            ..Default::default()
        };
        for window in self.windows.values() {
            match window.state {
                WindowState::Open => stats.open_windows += 1,
                WindowState::Closing => stats.closing_windows += 1,
                WindowState::Failed => stats.failed_windows += 1,
                WindowState::Committed => {}
            }
            stats.buffered_messages += window.messages.len();
        }
        stats
    }
}
