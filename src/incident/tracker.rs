// Incident tracking module
// Per-component sliding-window state machine deciding when raw probe
// failures escalate into paging events
//
// Numan Thabit 2025 Nov

use crate::config::AlertPolicy;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Outcome of recording one failure against a component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    /// the failure crossed a threshold and must page
    pub escalate: bool,
    /// one more consecutive failure will page, warn the operators now
    pub pre_alert: bool,
}

/// Mutable escalation state for one component.
#[derive(Debug)]
pub struct IncidentTracker {
    counters: i64,
    eval_window: Duration,
    alerts: Vec<Instant>,
    limit_in_window: u32,
    limit: u32,
    last_updated_at: Instant,
}

impl IncidentTracker {
    fn new(policy: &AlertPolicy) -> Self {
        Self {
            counters: 0,
            eval_window: crate::config::duration_or(policy.moving_window_seconds, 1),
            alerts: Vec::new(),
            limit_in_window: policy.ceiling_in_moving_window,
            limit: policy.ceiling,
            last_updated_at: Instant::now(),
        }
    }

    /// Records one failure at `now` and evaluates both thresholds in
    /// order, consecutive count first. Crossing either threshold resets
    /// the counter and the window so the next page requires a full
    /// accumulation again.
    fn report_at(&mut self, now: Instant) -> TrackOutcome {
        self.last_updated_at = now;
        self.counters += 1;
        self.alerts.push(now);

        if self.limit > 0 && self.counters >= i64::from(self.limit) {
            self.counters = 0;
            self.alerts.clear();
            return TrackOutcome {
                escalate: true,
                pre_alert: false,
            };
        }

        let pre_alert = self.limit > 0 && self.counters + 1 >= i64::from(self.limit);

        // evict expired entries before the window evaluation
        let window = self.eval_window;
        self.alerts.retain(|t| now.duration_since(*t) < window);
        let window_counts = self.alerts.len();

        if self.limit_in_window > 0 && window_counts >= self.limit_in_window as usize {
            self.counters = 0;
            self.alerts.clear();
            return TrackOutcome {
                escalate: true,
                pre_alert: false,
            };
        }

        TrackOutcome {
            escalate: false,
            pre_alert,
        }
    }

    /// Decrements the failure counter. Window entries are left in place,
    /// a single successful probe between failures must not reset an
    /// accumulating moving window.
    fn clear(&mut self) -> i64 {
        self.counters -= 1;
        self.counters
    }

    fn touched_within(&self, now: Instant, within: Duration) -> bool {
        now.duration_since(self.last_updated_at) < within
    }
}

/// Process-wide registry of per-component trackers.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: RwLock<HashMap<String, IncidentTracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failure for the component, creating the tracker on
    /// first report.
    pub fn track(&self, component: &str, policy: &AlertPolicy) -> TrackOutcome {
        self.track_at(component, policy, Instant::now())
    }

    fn track_at(&self, component: &str, policy: &AlertPolicy, now: Instant) -> TrackOutcome {
        let mut guard = self.trackers.write().unwrap();
        guard
            .entry(component.to_string())
            .or_insert_with(|| IncidentTracker::new(policy))
            .report_at(now)
    }

    /// Reverses one failure. The tracker entry is dropped once the
    /// counter reaches zero or below.
    pub fn clear(&self, component: &str) {
        let mut guard = self.trackers.write().unwrap();
        if let Some(tracker) = guard.get_mut(component) {
            if tracker.clear() <= 0 {
                guard.remove(component);
            }
        }
    }

    /// Number of distinct components whose tracker was updated within
    /// the duration. Feeds the cross-component correlation rule.
    pub fn recently_active(&self, within: Duration) -> usize {
        let now = Instant::now();
        let guard = self.trackers.read().unwrap();
        guard
            .values()
            .filter(|t| t.touched_within(now, within))
            .count()
    }

    pub fn len(&self) -> usize {
        self.trackers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ceiling: u32, window_secs: u64, in_window: u32) -> AlertPolicy {
        AlertPolicy {
            ceiling,
            moving_window_seconds: window_secs,
            ceiling_in_moving_window: in_window,
        }
    }

    #[test]
    fn ceiling_escalates_every_n_consecutive_failures() {
        let registry = TrackerRegistry::new();
        let p = policy(3, 0, 0);
        let base = Instant::now();

        assert!(!registry.track_at("c1", &p, base).escalate);
        assert!(!registry.track_at("c1", &p, base + Duration::from_secs(1)).escalate);
        assert!(registry.track_at("c1", &p, base + Duration::from_secs(2)).escalate);
        // state reset on escalation, the next failure starts over
        assert!(!registry.track_at("c1", &p, base + Duration::from_secs(3)).escalate);
    }

    #[test]
    fn pre_alert_one_failure_before_ceiling() {
        let registry = TrackerRegistry::new();
        let p = policy(3, 0, 0);
        let base = Instant::now();

        assert!(!registry.track_at("c1", &p, base).pre_alert);
        let second = registry.track_at("c1", &p, base + Duration::from_secs(1));
        assert!(second.pre_alert && !second.escalate);
        let third = registry.track_at("c1", &p, base + Duration::from_secs(2));
        assert!(third.escalate && !third.pre_alert);
    }

    #[test]
    fn moving_window_escalates_and_resets() {
        let registry = TrackerRegistry::new();
        let p = policy(0, 2, 3);
        let base = Instant::now();

        assert!(!registry.track_at("c3", &p, base).escalate);
        assert!(!registry.track_at("c3", &p, base + Duration::from_millis(100)).escalate);
        assert!(registry.track_at("c3", &p, base + Duration::from_millis(200)).escalate);

        // a failure after the window drained accumulates from scratch
        assert!(!registry.track_at("c3", &p, base + Duration::from_millis(3500)).escalate);
        assert!(!registry.track_at("c3", &p, base + Duration::from_millis(3600)).escalate);
        assert!(registry.track_at("c3", &p, base + Duration::from_millis(3700)).escalate);
        // reset again after the second escalation
        assert!(!registry.track_at("c3", &p, base + Duration::from_millis(3800)).escalate);
    }

    #[test]
    fn failures_far_apart_never_accumulate_in_window() {
        let registry = TrackerRegistry::new();
        let p = policy(0, 1, 2);
        let base = Instant::now();

        for i in 0..10u64 {
            let outcome = registry.track_at("c4", &p, base + Duration::from_secs(i * 5));
            assert!(!outcome.escalate, "failures more than a window apart");
        }
    }

    #[test]
    fn disabled_policy_never_escalates() {
        let registry = TrackerRegistry::new();
        let p = policy(0, 0, 0);
        let base = Instant::now();
        for i in 0..100u64 {
            assert!(!registry.track_at("c5", &p, base + Duration::from_millis(i)).escalate);
        }
    }

    #[test]
    fn clear_decrements_and_drops_at_zero() {
        let registry = TrackerRegistry::new();
        let p = policy(20, 30, 40);

        // clear with no tracker is a no-op
        registry.clear("component1");
        assert_eq!(registry.len(), 0);

        let base = Instant::now();
        for i in 0..19u64 {
            assert!(!registry.track_at("component1", &p, base + Duration::from_millis(i)).escalate);
            assert!(!registry.track_at("component2", &p, base + Duration::from_millis(i)).escalate);
            assert_eq!(registry.len(), 2);
            // clear resets component2's counter back down each round
            registry.clear("component2");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.track_at("component1", &p, base + Duration::from_millis(19)).escalate);
        assert!(!registry.track_at("component1", &p, base + Duration::from_millis(20)).escalate);
    }

    #[test]
    fn clear_does_not_evict_window_entries() {
        let registry = TrackerRegistry::new();
        let p = policy(300, 10, 3);
        let base = Instant::now();

        assert!(!registry.track_at("c6", &p, base).escalate);
        assert!(!registry.track_at("c6", &p, base + Duration::from_millis(10)).escalate);
        // one success between failures must not drain the window
        registry.clear("c6");
        assert!(registry.track_at("c6", &p, base + Duration::from_millis(20)).escalate);
    }

    #[test]
    fn counters_monotonic_up_down() {
        let registry = TrackerRegistry::new();
        let p = policy(3, 0, 0);
        let base = Instant::now();

        // up, down, then up again never skips a level
        assert!(!registry.track_at("c7", &p, base).escalate);
        assert!(!registry.track_at("c7", &p, base + Duration::from_millis(1)).escalate);
        registry.clear("c7");
        assert!(!registry.track_at("c7", &p, base + Duration::from_millis(2)).escalate);
        assert!(registry.track_at("c7", &p, base + Duration::from_millis(3)).escalate);
    }

    #[test]
    fn recently_active_counts_distinct_components() {
        let registry = TrackerRegistry::new();
        let p = policy(10, 60, 0);
        registry.track("a", &p);
        registry.track("b", &p);
        registry.track("c", &p);
        assert_eq!(registry.recently_active(Duration::from_secs(60)), 3);
        assert_eq!(registry.recently_active(Duration::from_nanos(0)), 0);
    }
}
