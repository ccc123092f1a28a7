use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Counts commits that are currently retrying and signals when the count
/// reaches the configured threshold.
///
/// While engaged, the windowing task stops handing out windows and the
/// intake task stops pulling.
#[derive(Clone)]
pub struct BackpressureGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    threshold: usize,
    retrying: Mutex<usize>,
    engaged: watch::Sender<bool>,
}

impl BackpressureGate {
    pub fn new(threshold: usize) -> Self {
        let (engaged, _) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                threshold: threshold.max(1),
                retrying: Mutex::new(0),
                engaged,
            }),
        }
    }

    pub fn threshold(&self) -> usize {
        self.inner.threshold
    }

    pub fn retrying(&self) -> usize {
        match self.inner.retrying.lock() {
            Ok(count) => *count,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_engaged(&self) -> bool {
        *self.inner.engaged.borrow()
    }

    /// Register a commit as retrying until the returned guard is dropped.
    pub fn enter_retry(&self) -> RetryGuard {
        self.update(|count| *count += 1);
        RetryGuard { gate: self.clone() }
    }

    /// Resolves once the gate is not engaged.
    pub async fn released(&self) {
        let mut rx = self.inner.engaged.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|engaged| !*engaged).await;
    }

    /// Receiver for callers that select on engagement changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.engaged.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut usize)) {
        let mut count = match self.inner.retrying.lock() {
            Ok(count) => count,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut count);

        let engaged = *count >= self.inner.threshold;
        let changed = self.inner.engaged.send_if_modified(|current| {
            let changed = *current != engaged;
            *current = engaged;
            changed
        });
        if changed && engaged {
            warn!(retrying = *count, threshold = self.inner.threshold, "Backpressure engaged");
        } else if changed {
            debug!(retrying = *count, "Backpressure released");
        }
    }
}

/// Holds one slot in the retrying count.
pub struct RetryGuard {
    gate: BackpressureGate,
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        self.gate.update(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_engages_at_threshold() {
        let gate = BackpressureGate::new(2);
        let first = gate.enter_retry();
        assert!(!gate.is_engaged());

        let second = gate.enter_retry();
        assert!(gate.is_engaged());
        assert_eq!(gate.retrying(), 2);

        drop(first);
        assert!(!gate.is_engaged());
        drop(second);
        assert_eq!(gate.retrying(), 0);
    }

    #[tokio::test]
    async fn test_released_waits_for_guards() {
        let gate = BackpressureGate::new(1);
        let guard = gate.enter_retry();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.released().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
