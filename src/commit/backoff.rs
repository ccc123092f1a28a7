use std::time::Duration;

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.min(cap);
        Self {
            base,
            cap,
            next: base,
        }
    }

    /// Delay to wait before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = std::cmp::min(self.next.saturating_mul(2), self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }
}
