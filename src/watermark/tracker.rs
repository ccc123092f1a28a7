use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Tracks event-time progress and derives a monotonic watermark.
///
/// A watermark of T means the pipeline does not expect messages with event
/// time earlier than T. Windows ending at or before it may be closed.
pub struct WatermarkTracker {
    clock: Arc<dyn Clock>,
    safety_margin: chrono::Duration,
    degraded_mode: bool,
    max_observed: Option<DateTime<Utc>>,
    hint: Option<DateTime<Utc>>,
    last_emitted: Option<DateTime<Utc>>,
    exhausted: bool,
    regressions: u64,
}

impl WatermarkTracker {
    /// # Arguments
    /// * `safety_margin` - Subtracted from every candidate watermark
    /// * `degraded_mode` - Use processing time when the source gives no hint
    pub fn new(clock: Arc<dyn Clock>, safety_margin: Duration, degraded_mode: bool) -> Self {
        Self {
            clock,
            safety_margin: chrono::Duration::from_std(safety_margin)
                .unwrap_or(chrono::Duration::MAX),
            degraded_mode,
            max_observed: None,
            hint: None,
            last_emitted: None,
            exhausted: false,
            regressions: 0,
        }
    }

    /// Record the event time of an incoming message.
    pub fn observe(&mut self, event_time: DateTime<Utc>) {
        self.max_observed = Some(match self.max_observed {
            Some(max) => max.max(event_time),
            None => event_time,
        });
    }

    /// Record the low watermark reported by the source.
    pub fn observe_hint(&mut self, hint: DateTime<Utc>) {
        self.hint = Some(hint);
    }

    /// The input is exhausted: every remaining window may close.
    pub fn advance_to_end(&mut self) {
        self.exhausted = true;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of candidate watermarks that were clamped because they went backwards.
    pub fn regressions(&self) -> u64 {
        self.regressions
    }

    pub fn max_observed(&self) -> Option<DateTime<Utc>> {
        self.max_observed
    }

    /// Current watermark, never lower than any value returned before.
    pub fn current_watermark(&mut self) -> Option<DateTime<Utc>> {
        let candidate = if self.exhausted {
            Some(DateTime::<Utc>::MAX_UTC)
        } else {
            self.candidate().map(|t| self.minus_margin(t))
        };

        let Some(candidate) = candidate else {
            return self.last_emitted;
        };

        match self.last_emitted {
            Some(last) if candidate < last => {
                self.regressions += 1;
                debug!(
                    candidate = %candidate,
                    watermark = %last,
                    "WatermarkRegressionAnomaly: candidate below current watermark, clamped"
                );
                Some(last)
            }
            _ => {
                self.last_emitted = Some(candidate);
                Some(candidate)
            }
        }
    }

    fn candidate(&self) -> Option<DateTime<Utc>> {
        match (self.hint, self.max_observed) {
            (Some(hint), Some(max)) => Some(hint.min(max)),
            (Some(hint), None) => Some(hint),
            (None, _) if self.degraded_mode => Some(self.clock.now()),
            (None, max) => max,
        }
    }

    fn minus_margin(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t.checked_sub_signed(self.safety_margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn tracker(margin_ms: u64) -> WatermarkTracker {
        WatermarkTracker::new(
            Arc::new(SystemClock),
            Duration::from_millis(margin_ms),
            false,
        )
    }

    #[test]
    fn test_nothing_known_yet() {
        let mut wm = tracker(0);
        assert_eq!(wm.current_watermark(), None);
    }

    #[test]
    fn test_event_time_heuristic_with_margin() {
        let mut wm = tracker(500);
        wm.observe(at(10_000));
        wm.observe(at(12_000));
        assert_eq!(wm.current_watermark(), Some(at(11_500)));
    }

    #[test]
    fn test_non_decreasing_for_out_of_order_input() {
        let mut wm = tracker(0);
        let mut last = None;
        for t in [5_000, 1_000, 9_000, 3_000, 8_999, 12_000, 0] {
            wm.observe(at(t));
            let current = wm.current_watermark();
            assert!(current >= last, "{current:?} < {last:?}");
            last = current;
        }
        assert_eq!(last, Some(at(12_000)));
    }

    #[test]
    fn test_hint_bounds_watermark() {
        let mut wm = tracker(0);
        wm.observe(at(10_000));
        wm.observe_hint(at(7_000));
        assert_eq!(wm.current_watermark(), Some(at(7_000)));

        // Observed time below the hint holds the watermark back
        let mut wm = tracker(0);
        wm.observe_hint(at(20_000));
        wm.observe(at(15_000));
        assert_eq!(wm.current_watermark(), Some(at(15_000)));
    }

    #[test]
    fn test_hint_without_observations() {
        let mut wm = tracker(1_000);
        wm.observe_hint(at(5_000));
        assert_eq!(wm.current_watermark(), Some(at(4_000)));
    }

    #[test]
    fn test_regressing_hint_is_clamped_and_counted() {
        let mut wm = tracker(0);
        wm.observe(at(50_000));
        wm.observe_hint(at(10_000));
        assert_eq!(wm.current_watermark(), Some(at(10_000)));

        wm.observe_hint(at(4_000));
        assert_eq!(wm.current_watermark(), Some(at(10_000)));
        assert_eq!(wm.regressions(), 1);
    }

    #[test]
    fn test_degraded_mode_uses_clock() {
        let clock = ManualClock::new(at(100_000));
        let mut wm = WatermarkTracker::new(
            Arc::new(clock.clone()),
            Duration::from_millis(2_000),
            true,
        );
        wm.observe(at(500_000));
        assert_eq!(wm.current_watermark(), Some(at(98_000)));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(wm.current_watermark(), Some(at(108_000)));
    }

    #[test]
    fn test_advance_to_end() {
        let mut wm = tracker(0);
        wm.observe(at(1_000));
        wm.advance_to_end();
        assert_eq!(wm.current_watermark(), Some(DateTime::<Utc>::MAX_UTC));
    }
}
