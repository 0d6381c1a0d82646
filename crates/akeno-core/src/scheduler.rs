//! Cylinder actuation scheduler
//!
//! Converts per-cylinder commands into crank-angle events. Angles are
//! absolute (1/10 °, monotonic across engine cycles) so that ordering never
//! has to deal with the 720 ° wrap.
//!
//! Each (cylinder, event kind) has at most one pending event. Rescheduling
//! before the event is due replaces it with the fresh angle; once due it is
//! left alone until drained. Events for a key are issued in strictly
//! increasing angle order.
//!
//! The queue is drained once per control cycle, so [`ActuationScheduler::drain_due`]
//! takes a look-ahead horizon: everything whose issue point falls before the
//! next cycle is handed out now, together with the angle it acts at.

use serde::{Deserialize, Serialize};

use crate::actuation::{CoilState, CylinderCommand, FuelState, IgnitionState};
use crate::CYLINDER_COUNT;

/// One engine cycle (1/10 °)
pub const CYCLE_ANGLE: u64 = 7200;

const EVENT_KINDS: usize = 4;

/// Degrees between consecutive firings (1/10 °)
const FIRING_INTERVAL: u64 = CYCLE_ANGLE / CYLINDER_COUNT as u64;

/// What an event does to its cylinder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// Start charging the coil
    CoilCharge,
    /// Stop charging; the plug fires
    Spark,
    /// Start of injection
    InjectorOpen,
    /// End of injection
    InjectorClose,
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

/// A scheduled actuator event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireEvent {
    /// Cylinder index (0-based)
    pub cylinder: usize,
    /// What happens at `angle`
    pub kind: EventKind,
    /// Crank angle the actuator acts at (absolute, 1/10 °)
    pub angle: u64,
    /// Crank angle by which the event must be handed to the driver
    pub issue_at: u64,
    sequence: u64,
}

/// Turns the 0..7200 crank position into an absolute angle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrankAngle {
    cycles: u64,
    last_position: Option<u32>,
}

impl CrankAngle {
    /// Start at cycle zero with no position seen yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute angle for `position`. A position lower than the previous one
    /// starts a new engine cycle.
    pub fn update(&mut self, position: u32) -> u64 {
        let position = u64::from(position) % CYCLE_ANGLE;
        if let Some(last) = self.last_position {
            if position < u64::from(last) {
                self.cycles += 1;
            }
        }
        self.last_position = Some(position as u32);
        self.cycles * CYCLE_ANGLE + position
    }
}

/// Angle turned during `us` at `rpm` (1/10 °).
pub fn angle_for_duration(us: u32, rpm: u32) -> u64 {
    // rpm * 3600 tenths per minute = rpm * 6 / 100_000 tenths per µs
    u64::from(us) * u64::from(rpm) * 6 / 100_000
}

/// Angle the crank may turn during `us` at `rpm`, rounded up plus one unit
/// for the truncated position reading (1/10 °).
pub fn lookahead_angle(us: u64, rpm: u32) -> u64 {
    (us * u64::from(rpm) * 6).div_ceil(100_000) + 1
}

/// Crank-angle event queue for all cylinders
#[derive(Debug, Clone)]
pub struct ActuationScheduler {
    /// Firing TDC of each cylinder within the cycle (1/10 °)
    tdc: [u64; CYLINDER_COUNT],
    lead_time_us: u32,
    queue: Vec<FireEvent>,
    last_issued: [[Option<u64>; EVENT_KINDS]; CYLINDER_COUNT],
    next_sequence: u64,
    deferred: u64,
    late: u64,
}

impl ActuationScheduler {
    /// Create a scheduler for the given firing order.
    pub fn new(firing_order: [usize; CYLINDER_COUNT], lead_time_us: u32) -> Self {
        let mut tdc = [0; CYLINDER_COUNT];
        for (position, &cylinder) in firing_order.iter().enumerate() {
            if let Some(slot) = tdc.get_mut(cylinder) {
                *slot = position as u64 * FIRING_INTERVAL;
            }
        }
        Self {
            tdc,
            lead_time_us,
            queue: Vec::with_capacity(CYLINDER_COUNT * EVENT_KINDS),
            last_issued: [[None; EVENT_KINDS]; CYLINDER_COUNT],
            next_sequence: 0,
            deferred: 0,
            late: 0,
        }
    }

    /// Firing TDC of `cylinder` within the cycle (1/10 °)
    pub fn tdc_of(&self, cylinder: usize) -> u64 {
        self.tdc[cylinder]
    }

    /// Events waiting to be issued, in issue order
    pub fn pending(&self) -> &[FireEvent] {
        &self.queue
    }

    /// Events that could no longer be issued in time for their angle and
    /// slipped to the next engine cycle
    pub fn deferred_count(&self) -> u64 {
        self.deferred
    }

    /// Events handed out after their angle had already passed
    pub fn late_count(&self) -> u64 {
        self.late
    }

    /// Drop everything, as on power-down.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.last_issued = [[None; EVENT_KINDS]; CYLINDER_COUNT];
    }

    fn pending_index(&self, cylinder: usize, kind: EventKind) -> Option<usize> {
        self.queue
            .iter()
            .position(|e| e.cylinder == cylinder && e.kind == kind)
    }

    fn remove_pending(&mut self, cylinder: usize, kind: EventKind, now: u64) {
        self.queue
            .retain(|e| !(e.cylinder == cylinder && e.kind == kind && e.issue_at > now));
    }

    /// Whether the opener of a pair was issued more recently than its closer,
    /// i.e. a coil is charging or an injector is open.
    fn pair_open(&self, cylinder: usize, opener: EventKind, closer: EventKind) -> bool {
        let issued = &self.last_issued[cylinder];
        match (issued[opener.index()], issued[closer.index()]) {
            (Some(open), Some(close)) => open > close,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Angle the closing event must follow: the opener already issued if the
    /// pair is open, otherwise the opener just placed.
    fn closer_floor(&self, cylinder: usize, opener: EventKind, closer: EventKind, placed: u64) -> u64 {
        if self.pair_open(cylinder, opener, closer) {
            self.last_issued[cylinder][opener.index()].unwrap_or(placed)
        } else {
            placed
        }
    }

    /// Place or replace the event for a key at `phase` within the cycle,
    /// strictly after `after` when given. Returns the event's angle.
    fn place(
        &mut self,
        cylinder: usize,
        kind: EventKind,
        phase: i64,
        now: u64,
        lead: u64,
        after: Option<u64>,
    ) -> u64 {
        let pending = self.pending_index(cylinder, kind);
        if let Some(i) = pending {
            if self.queue[i].issue_at <= now {
                // due, waiting to be drained
                return self.queue[i].angle;
            }
        }
        let previous = pending.map(|i| self.queue[i].angle);

        let phase = phase.rem_euclid(CYCLE_ANGLE as i64) as u64;
        let mut angle = (now / CYCLE_ANGLE) * CYCLE_ANGLE + phase;
        let floor = self.last_issued[cylinder][kind.index()].max(after);
        if let Some(floor) = floor {
            while angle <= floor {
                angle += CYCLE_ANGLE;
            }
        }

        // An angle the crank has already passed simply belongs to the next
        // cycle. One still ahead but inside the lead window is a slip.
        let mut slipped = false;
        while angle.saturating_sub(lead) < now {
            slipped |= angle >= now;
            angle += CYCLE_ANGLE;
        }
        if let Some(previous) = previous {
            slipped |= angle >= previous + CYCLE_ANGLE / 2;
        }
        if slipped {
            self.deferred += 1;
        }

        let event = FireEvent {
            cylinder,
            kind,
            angle,
            issue_at: angle.saturating_sub(lead),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        match pending {
            Some(i) => self.queue[i] = event,
            None => self.queue.push(event),
        }
        angle
    }

    /// Schedule the next firing of every cylinder from this cycle's commands.
    ///
    /// `now` is the absolute crank angle, `rpm` the current crank speed.
    /// Cylinders whose ignition or fuel is off lose their pending events,
    /// except the closing half of a pair whose opening half already went out.
    pub fn schedule(&mut self, now: u64, rpm: u32, commands: &[CylinderCommand; CYLINDER_COUNT]) {
        let lead = angle_for_duration(self.lead_time_us, rpm);

        for (cyl, cmd) in commands.iter().enumerate() {
            let tdc = self.tdc[cyl] as i64;

            if cmd.ignition == IgnitionState::On && cmd.coil == CoilState::On {
                let spark = tdc - i64::from(cmd.timing);
                let dwell = angle_for_duration(cmd.dwell_us, rpm) as i64;
                let charge = self.place(cyl, EventKind::CoilCharge, spark - dwell, now, lead, None);
                let after = self.closer_floor(cyl, EventKind::CoilCharge, EventKind::Spark, charge);
                self.place(cyl, EventKind::Spark, spark, now, lead, Some(after));
            } else {
                self.remove_pending(cyl, EventKind::CoilCharge, now);
                if !self.pair_open(cyl, EventKind::CoilCharge, EventKind::Spark) {
                    self.remove_pending(cyl, EventKind::Spark, now);
                }
            }

            if cmd.fuel == FuelState::On && cmd.injector_duration_us > 0 {
                let open = tdc - i64::from(cmd.injection_angle) * 10;
                let duration = angle_for_duration(cmd.injector_duration_us, rpm) as i64;
                let opened = self.place(cyl, EventKind::InjectorOpen, open, now, lead, None);
                let after = self.closer_floor(cyl, EventKind::InjectorOpen, EventKind::InjectorClose, opened);
                self.place(cyl, EventKind::InjectorClose, open + duration, now, lead, Some(after));
            } else {
                self.remove_pending(cyl, EventKind::InjectorOpen, now);
                if !self.pair_open(cyl, EventKind::InjectorOpen, EventKind::InjectorClose) {
                    self.remove_pending(cyl, EventKind::InjectorClose, now);
                }
            }
        }

        self.queue.sort_by_key(|e| (e.issue_at, e.sequence));
    }

    /// Remove and return every event whose issue point falls before
    /// `now + horizon`, in issue order.
    ///
    /// `horizon` must cover the angle the crank turns before the next drain.
    /// Events whose angle is already behind `now` are still returned and
    /// counted as late.
    pub fn drain_due(&mut self, now: u64, horizon: u64) -> Vec<FireEvent> {
        let limit = now.saturating_add(horizon);
        let split = self.queue.partition_point(|e| e.issue_at <= limit);
        let due: Vec<FireEvent> = self.queue.drain(..split).collect();
        for event in &due {
            self.last_issued[event.cylinder][event.kind.index()] = Some(event.angle);
            if event.angle < now {
                self.late += 1;
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crank_angle_wraps_into_next_cycle() {
        let mut crank = CrankAngle::new();
        assert_eq!(crank.update(7000), 7000);
        assert_eq!(crank.update(100), 7300);
        assert_eq!(crank.update(200), 7400);
    }

    #[test]
    fn test_angle_for_duration() {
        // 6000 rpm = 36 ° per ms
        assert_eq!(angle_for_duration(1000, 6000), 360);
    }

    #[test]
    fn test_lookahead_rounds_up() {
        assert_eq!(lookahead_angle(1000, 6000), 361);
        // 0.48 tenths still needs a whole unit
        assert_eq!(lookahead_angle(1000, 8), 2);
        assert_eq!(lookahead_angle(1000, 0), 1);
    }

    #[test]
    fn test_firing_order_phases() {
        let sched = ActuationScheduler::new([0, 3, 1, 4, 2, 5], 0);
        assert_eq!(sched.tdc_of(0), 0);
        assert_eq!(sched.tdc_of(3), 1200);
        assert_eq!(sched.tdc_of(1), 2400);
        assert_eq!(sched.tdc_of(5), 6000);
    }
}
