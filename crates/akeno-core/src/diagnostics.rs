//! Fault and diagnostic reporting
//!
//! Control code never blocks on reporting: faults bump an atomic counter and
//! push an event onto a bounded queue that a lower-priority task drains.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::mode::EmergencyState;

/// Events kept before the oldest are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Conditions the control core reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Calibration data failed validation; the fallback set is active
    MalformedCalibration,
    /// No fresh snapshot was available for a cycle
    StaleSnapshot,
    /// Snapshot flagged a sensor fault or an implausible reading
    SensorLoss,
    /// A cycle exceeded its time budget
    CycleOverrun,
    /// Consecutive overruns reached the escalation count
    SustainedOverrun,
    /// Operating-mode combination not permitted; previous modes held
    InvalidStateCombination,
    /// Knock level above the overload threshold on a bank
    KnockOverload,
    /// Coolant, oil or exhaust temperature above its limit
    Overheat,
    /// A crank-angle event was handed out after its angle had passed
    LateEvent,
}

impl FaultKind {
    /// All kinds, in counter order
    pub const ALL: [FaultKind; 9] = [
        FaultKind::MalformedCalibration,
        FaultKind::StaleSnapshot,
        FaultKind::SensorLoss,
        FaultKind::CycleOverrun,
        FaultKind::SustainedOverrun,
        FaultKind::InvalidStateCombination,
        FaultKind::KnockOverload,
        FaultKind::Overheat,
        FaultKind::LateEvent,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Something worth telling the outside world about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    /// A fault was raised
    Fault {
        /// Which fault
        kind: FaultKind,
        /// Snapshot time of the raising cycle (µs)
        timestamp_us: u64,
    },
    /// The emergency tier changed
    EmergencyChanged {
        /// Tier before the change
        from: EmergencyState,
        /// Tier after the change
        to: EmergencyState,
        /// Snapshot time of the change (µs)
        timestamp_us: u64,
    },
}

/// Receiver for drained diagnostic events
pub trait DiagnosticSink {
    /// Handle one event
    fn report(&mut self, event: &DiagnosticEvent);
}

impl DiagnosticSink for Vec<DiagnosticEvent> {
    fn report(&mut self, event: &DiagnosticEvent) {
        self.push(*event);
    }
}

/// Snapshot of all fault counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounters {
    /// See [`FaultKind::MalformedCalibration`]
    pub malformed_calibration: u64,
    /// See [`FaultKind::StaleSnapshot`]
    pub stale_snapshot: u64,
    /// See [`FaultKind::SensorLoss`]
    pub sensor_loss: u64,
    /// See [`FaultKind::CycleOverrun`]
    pub cycle_overrun: u64,
    /// See [`FaultKind::SustainedOverrun`]
    pub sustained_overrun: u64,
    /// See [`FaultKind::InvalidStateCombination`]
    pub invalid_state_combination: u64,
    /// See [`FaultKind::KnockOverload`]
    pub knock_overload: u64,
    /// See [`FaultKind::Overheat`]
    pub overheat: u64,
    /// See [`FaultKind::LateEvent`]
    pub late_event: u64,
    /// Events dropped because the queue was full
    pub dropped_events: u64,
}

/// Fault counters plus a bounded event queue.
///
/// Shared between the control cycle (producer) and a reporting task
/// (consumer). Producers never wait: if the queue lock is contended the
/// event is counted as dropped.
pub struct Diagnostics {
    counters: [AtomicU64; FaultKind::ALL.len()],
    dropped: AtomicU64,
    queue: Mutex<VecDeque<DiagnosticEvent>>,
    capacity: usize,
}

impl Diagnostics {
    /// Create with the default queue capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create with a specific queue capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            counters: Default::default(),
            dropped: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Count a fault and queue an event for it.
    pub fn raise(&self, kind: FaultKind, timestamp_us: u64) {
        self.counters[kind.index()].fetch_add(1, Ordering::Relaxed);
        tracing::warn!(?kind, timestamp_us, "fault raised");
        self.record(DiagnosticEvent::Fault { kind, timestamp_us });
    }

    /// Queue an event without touching the counters.
    pub fn record(&self, event: DiagnosticEvent) {
        let Some(mut queue) = self.queue.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Times `kind` has been raised
    pub fn count(&self, kind: FaultKind) -> u64 {
        self.counters[kind.index()].load(Ordering::Relaxed)
    }

    /// All counters at once
    pub fn counters(&self) -> FaultCounters {
        let c = |kind| self.count(kind);
        FaultCounters {
            malformed_calibration: c(FaultKind::MalformedCalibration),
            stale_snapshot: c(FaultKind::StaleSnapshot),
            sensor_loss: c(FaultKind::SensorLoss),
            cycle_overrun: c(FaultKind::CycleOverrun),
            sustained_overrun: c(FaultKind::SustainedOverrun),
            invalid_state_combination: c(FaultKind::InvalidStateCombination),
            knock_overload: c(FaultKind::KnockOverload),
            overheat: c(FaultKind::Overheat),
            late_event: c(FaultKind::LateEvent),
            dropped_events: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Remove and return all queued events, oldest first.
    pub fn drain(&self) -> Vec<DiagnosticEvent> {
        self.queue.lock().drain(..).collect()
    }

    /// Drain queued events into a sink. Returns the number forwarded.
    pub fn forward(&self, sink: &mut dyn DiagnosticSink) -> usize {
        let events = self.drain();
        for event in &events {
            sink.report(event);
        }
        events.len()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("counters", &self.counters())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_counts_and_queues() {
        let diag = Diagnostics::new();
        diag.raise(FaultKind::StaleSnapshot, 10);
        diag.raise(FaultKind::StaleSnapshot, 20);
        diag.raise(FaultKind::Overheat, 30);

        assert_eq!(diag.count(FaultKind::StaleSnapshot), 2);
        assert_eq!(diag.counters().overheat, 1);

        let events = diag.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            DiagnosticEvent::Fault {
                kind: FaultKind::Overheat,
                timestamp_us: 30
            }
        );
        assert!(diag.drain().is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let diag = Diagnostics::with_capacity(2);
        for t in 0..3 {
            diag.raise(FaultKind::CycleOverrun, t);
        }
        let events = diag.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(diag.counters().dropped_events, 1);
        assert!(matches!(events[0], DiagnosticEvent::Fault { timestamp_us: 1, .. }));
    }

    #[test]
    fn test_forward_to_sink() {
        let diag = Diagnostics::new();
        diag.record(DiagnosticEvent::EmergencyChanged {
            from: EmergencyState::Normal,
            to: EmergencyState::PowerLift1,
            timestamp_us: 5,
        });
        let mut sink: Vec<DiagnosticEvent> = Vec::new();
        assert_eq!(diag.forward(&mut sink), 1);
        assert_eq!(sink.len(), 1);
    }
}
