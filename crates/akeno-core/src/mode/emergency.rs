//! Emergency tier tracking with escalation and dwell-based de-escalation

use super::EmergencyState;

/// Remembers since when the demanded tier has been below the current one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmergencyTracker {
    below_since_us: Option<u64>,
}

impl EmergencyTracker {
    /// Tracker with no de-escalation pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Tier for this cycle.
    ///
    /// Escalates one tier per call while the demand is higher. Steps down one
    /// tier once the demand has stayed lower for `dwell_us`, then restarts the
    /// dwell for the next step.
    pub fn update(
        &mut self,
        current: EmergencyState,
        demanded: EmergencyState,
        now_us: u64,
        dwell_us: u64,
    ) -> EmergencyState {
        if demanded >= current {
            self.below_since_us = None;
            return if demanded > current {
                current.step_up()
            } else {
                current
            };
        }

        match self.below_since_us {
            None => {
                self.below_since_us = Some(now_us);
                current
            }
            Some(since) if now_us.saturating_sub(since) >= dwell_us => {
                let next = current.step_down();
                self.below_since_us = (demanded < next).then_some(now_us);
                next
            }
            Some(_) => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DWELL: u64 = 1_000;

    #[test]
    fn test_escalation_one_tier_per_cycle() {
        let mut tracker = EmergencyTracker::new();
        let mut state = EmergencyState::Normal;
        let mut seen = Vec::new();
        for t in 0..4 {
            state = tracker.update(state, EmergencyState::Emergency, t, DWELL);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                EmergencyState::PowerLift1,
                EmergencyState::PowerLift2,
                EmergencyState::Emergency,
                EmergencyState::Emergency,
            ]
        );
    }

    #[test]
    fn test_deescalation_waits_for_dwell_each_step() {
        let mut tracker = EmergencyTracker::new();
        let mut state = EmergencyState::PowerLift2;

        state = tracker.update(state, EmergencyState::Normal, 0, DWELL);
        assert_eq!(state, EmergencyState::PowerLift2);
        state = tracker.update(state, EmergencyState::Normal, DWELL - 1, DWELL);
        assert_eq!(state, EmergencyState::PowerLift2);
        state = tracker.update(state, EmergencyState::Normal, DWELL, DWELL);
        assert_eq!(state, EmergencyState::PowerLift1);

        // dwell restarted at DWELL
        state = tracker.update(state, EmergencyState::Normal, DWELL + 10, DWELL);
        assert_eq!(state, EmergencyState::PowerLift1);
        state = tracker.update(state, EmergencyState::Normal, 2 * DWELL, DWELL);
        assert_eq!(state, EmergencyState::Normal);
    }

    #[test]
    fn test_renewed_demand_restarts_dwell() {
        let mut tracker = EmergencyTracker::new();
        let mut state = EmergencyState::PowerLift1;

        state = tracker.update(state, EmergencyState::Normal, 0, DWELL);
        state = tracker.update(state, EmergencyState::PowerLift1, 500, DWELL);
        state = tracker.update(state, EmergencyState::Normal, 600, DWELL);
        state = tracker.update(state, EmergencyState::Normal, 1_200, DWELL);
        assert_eq!(state, EmergencyState::PowerLift1);
        state = tracker.update(state, EmergencyState::Normal, 1_600, DWELL);
        assert_eq!(state, EmergencyState::Normal);
    }
}
