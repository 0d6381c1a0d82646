//! Operating-mode state machine
//!
//! Three cooperating states decide what the pipelines are allowed to do:
//! - `RunningState`: started, idling, limiting, cutting, launching
//! - `EmergencyState`: how much power is withdrawn because of faults
//! - `PerformanceState`: driver-selected calibration column
//!
//! The machine is advanced once per cycle from the snapshot and the fault
//! conditions derived from it.

mod emergency;
mod running;

pub use emergency::EmergencyTracker;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModeConfig;
use crate::diagnostics::{DiagnosticEvent, Diagnostics, FaultKind};
use crate::snapshot::{Gear, StateSnapshot};

/// Engine running state. Discriminants are the wire encoding (3 is unused).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunningState {
    /// Engine not turning
    #[default]
    Stopped = 0,
    /// Cranking, fuel and spark enabled until the engine catches
    StoppedPrepping = 1,
    /// Stopped by the automatic start-stop function
    StoppedAutostop = 2,
    /// Stalled while running
    StoppedDied = 4,
    /// Idling with no load from the driveline
    RunningIdleFree = 5,
    /// Idling with a gear engaged and the vehicle creeping
    RunningIdleDriving = 6,
    /// Following the driver demand
    RunningNormal = 7,
    /// Above the hard speed limit, fuel cut
    RunningHardLimiter = 8,
    /// Above the soft speed limit, ignition cut on alternate cylinders
    RunningSoftLimiter = 9,
    /// Ignition cut for an upshift
    RunningIgnitionCut = 10,
    /// Overrun fuel cut
    RunningFuelCut = 11,
    /// Fuel and ignition cut on every cylinder
    RunningCompleteCut = 12,
    /// Launch requested at a standstill with the brake held
    RunningLaunchPrep = 13,
    /// Pedal pressed against the brake, speed held at the launch limit
    RunningLaunchLimit = 14,
    /// Vehicle pulling away under launch control
    RunningLaunchStart = 15,
}

/// Whether a cylinder may be fueled and fired in a given running state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutPattern {
    /// Fuel allowed
    pub fuel: bool,
    /// Spark allowed
    pub ignition: bool,
}

impl CutPattern {
    const ALL_ON: Self = Self {
        fuel: true,
        ignition: true,
    };
    const ALL_OFF: Self = Self {
        fuel: false,
        ignition: false,
    };
}

impl RunningState {
    /// Encoded value
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Any of the stopped states
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            RunningState::Stopped
                | RunningState::StoppedPrepping
                | RunningState::StoppedAutostop
                | RunningState::StoppedDied
        )
    }

    /// Engine is turning under its own power
    pub fn is_running(self) -> bool {
        !self.is_stopped()
    }

    /// Either idle state
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            RunningState::RunningIdleFree | RunningState::RunningIdleDriving
        )
    }

    /// Any of the launch-control states
    pub fn is_launch(self) -> bool {
        matches!(
            self,
            RunningState::RunningLaunchPrep
                | RunningState::RunningLaunchLimit
                | RunningState::RunningLaunchStart
        )
    }

    /// Fuel and ignition enables for `cylinder` in this state.
    ///
    /// Limiters working on ignition cut every odd cylinder, so the engine
    /// keeps firing evenly on the remaining three.
    pub fn cut_pattern(self, cylinder: usize) -> CutPattern {
        use RunningState::*;
        match self {
            Stopped | StoppedAutostop | StoppedDied | RunningCompleteCut => CutPattern::ALL_OFF,
            // the starter is turning the engine; fuel and spark are needed to catch
            StoppedPrepping => CutPattern::ALL_ON,
            RunningIdleFree | RunningIdleDriving | RunningNormal | RunningLaunchPrep
            | RunningLaunchStart => CutPattern::ALL_ON,
            RunningSoftLimiter | RunningLaunchLimit => CutPattern {
                fuel: true,
                ignition: cylinder % 2 == 0,
            },
            RunningHardLimiter | RunningFuelCut => CutPattern {
                fuel: false,
                ignition: true,
            },
            RunningIgnitionCut => CutPattern {
                fuel: true,
                ignition: false,
            },
        }
    }
}

/// Power reduction tier, ordered from none to most severe
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EmergencyState {
    /// Full power
    #[default]
    Normal = 0,
    /// First reduction step
    PowerLift1 = 1,
    /// Second reduction step
    PowerLift2 = 2,
    /// Limp home
    Emergency = 3,
}

impl EmergencyState {
    /// Number of tiers; emergency-indexed table axes must be `0..COUNT`
    pub const COUNT: usize = 4;

    /// Table axis index
    pub fn index(self) -> i32 {
        self as i32
    }

    /// Next more severe tier
    pub fn step_up(self) -> Self {
        match self {
            EmergencyState::Normal => EmergencyState::PowerLift1,
            EmergencyState::PowerLift1 => EmergencyState::PowerLift2,
            EmergencyState::PowerLift2 | EmergencyState::Emergency => EmergencyState::Emergency,
        }
    }

    /// Next less severe tier
    pub fn step_down(self) -> Self {
        match self {
            EmergencyState::Normal | EmergencyState::PowerLift1 => EmergencyState::Normal,
            EmergencyState::PowerLift2 => EmergencyState::PowerLift1,
            EmergencyState::Emergency => EmergencyState::PowerLift2,
        }
    }
}

/// Driver-selected performance mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PerformanceState {
    /// Low grip
    Wet = 0,
    /// Road default
    #[default]
    Norm = 1,
    /// Sharper response
    Sport = 2,
    /// Race, reduced thermal load
    RaceCool = 3,
    /// Race
    RaceNorm = 4,
    /// Race, qualifying power
    RaceFast = 5,
    /// Race, maximum power for short stints
    RaceSprint = 6,
}

impl PerformanceState {
    /// Number of modes; performance-indexed table axes must be `0..COUNT`
    pub const COUNT: usize = 7;

    /// Table axis index
    pub fn index(self) -> i32 {
        self as i32
    }
}

/// The three states together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingMode {
    /// Running state
    pub running: RunningState,
    /// Emergency tier
    pub emergency: EmergencyState,
    /// Performance mode
    pub performance: PerformanceState,
}

/// Fault conditions present in the current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultConditions {
    /// Knock above the overload level on either bank
    pub knock_overload: bool,
    /// Coolant, oil or exhaust above its overheat limit
    pub overheat: bool,
    /// Coolant above the critical limit
    pub critical_overheat: bool,
    /// Inputs missing or implausible
    pub sensor_loss: bool,
    /// Cycle time overrun has latched
    pub sustained_overrun: bool,
}

impl FaultConditions {
    /// Derive the conditions from a snapshot. `sensor_loss` and
    /// `sustained_overrun` come from the cycle supervision.
    pub fn evaluate(
        snapshot: &StateSnapshot,
        config: &ModeConfig,
        sensor_loss: bool,
        sustained_overrun: bool,
    ) -> Self {
        let knock_overload = snapshot
            .banks
            .iter()
            .any(|b| b.knock_level >= config.knock_overload_level);
        let overheat = snapshot.coolant_out_temp >= config.overheat_coolant
            || snapshot.max_oil_temp() >= config.overheat_oil
            || snapshot.max_exhaust_temp() >= config.overheat_exhaust;

        Self {
            knock_overload,
            overheat,
            critical_overheat: snapshot.coolant_out_temp >= config.critical_coolant,
            sensor_loss: sensor_loss || snapshot.sensor_fault,
            sustained_overrun,
        }
    }

    /// Most severe tier any active condition asks for
    pub fn demanded_tier(&self) -> EmergencyState {
        if self.critical_overheat || self.sensor_loss || self.sustained_overrun {
            EmergencyState::Emergency
        } else if self.overheat {
            EmergencyState::PowerLift2
        } else if self.knock_overload {
            EmergencyState::PowerLift1
        } else {
            EmergencyState::Normal
        }
    }
}

/// Input combinations that cannot be physically valid.
pub(crate) fn invalid_combination(snapshot: &StateSnapshot, config: &ModeConfig) -> bool {
    let trans = &snapshot.transmission;

    let implausible_speed = snapshot.crank_speed > config.max_plausible_rpm;
    let stalled_but_coupled = snapshot.crank_speed == 0
        && trans.clutch.is_engaged()
        && trans.gear.is_forward()
        && !snapshot.is_stationary(config.stationary_shaft_rpm);
    let launch_in_reverse = snapshot.driver.launch_requested && trans.gear == Gear::Reverse;

    implausible_speed || stalled_but_coupled || launch_in_reverse
}

/// Owns the operating mode and advances it once per cycle.
#[derive(Debug, Default)]
pub struct ModeMachine {
    mode: OperatingMode,
    emergency: EmergencyTracker,
    invalid_active: bool,
}

impl ModeMachine {
    /// Start in Stopped / Normal / Norm
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mode
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Return to the power-up state.
    pub fn reset(&mut self) {
        debug!("mode machine reset");
        *self = Self::default();
    }

    /// Advance all three states by one cycle.
    pub fn update(
        &mut self,
        snapshot: &StateSnapshot,
        faults: &FaultConditions,
        config: &ModeConfig,
        diagnostics: &Diagnostics,
    ) -> OperatingMode {
        let now = snapshot.timestamp_us;

        if invalid_combination(snapshot, config) {
            if !self.invalid_active {
                diagnostics.raise(FaultKind::InvalidStateCombination, now);
            }
            self.invalid_active = true;
            return self.mode;
        }
        self.invalid_active = false;

        let previous = self.mode;

        let running = running::next(previous.running, snapshot, faults, config);
        if running != previous.running {
            debug!(from = ?previous.running, to = ?running, "running state changed");
        }

        let emergency = self.emergency.update(
            previous.emergency,
            faults.demanded_tier(),
            now,
            config.deescalation_dwell_us,
        );
        if emergency != previous.emergency {
            debug!(from = ?previous.emergency, to = ?emergency, "emergency state changed");
            diagnostics.record(DiagnosticEvent::EmergencyChanged {
                from: previous.emergency,
                to: emergency,
                timestamp_us: now,
            });
        }

        let performance = if running.is_launch() || previous.running.is_launch() {
            previous.performance
        } else {
            snapshot.driver.performance_request
        };
        if performance != previous.performance {
            debug!(from = ?previous.performance, to = ?performance, "performance state changed");
        }

        self.mode = OperatingMode {
            running,
            emergency,
            performance,
        };
        self.mode
    }
}
