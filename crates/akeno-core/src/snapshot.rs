//! State snapshot
//!
//! Every input the pipelines read for one control cycle, copied out of the
//! acquisition path at the start of the cycle. Pipelines never look at live
//! sensor values.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::mode::PerformanceState;
use crate::{BANK_COUNT, CYLINDER_COUNT};

/// Cylinder bank, each fed by its own turbocharger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bank {
    /// Cylinders 0..=2
    Left,
    /// Cylinders 3..=5
    Right,
}

impl Bank {
    /// Both banks in index order
    pub const ALL: [Bank; BANK_COUNT] = [Bank::Left, Bank::Right];

    /// Index into per-bank arrays
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Bank a cylinder belongs to: cylinders 0..=2 are left, 3..=5 right.
pub fn bank_of(cylinder: usize) -> Bank {
    if cylinder < CYLINDER_COUNT / 2 {
        Bank::Left
    } else {
        Bank::Right
    }
}

/// Variable valve timing stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VtecState {
    /// Low-lift cam
    #[default]
    Off,
    /// High-lift cam
    On,
}

/// Fuel grade in the tank, selects the base ignition map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuelQuality {
    /// 95 RON
    #[default]
    Octane95,
    /// 102 RON
    Octane102,
}

/// Selected gear
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gear {
    /// Reverse
    Reverse,
    /// No gear
    #[default]
    Neutral,
    /// First
    D1,
    /// Second
    D2,
    /// Third
    D3,
    /// Fourth
    D4,
    /// Fifth
    D5,
    /// Sixth
    D6,
    /// Seventh
    D7,
    /// Eighth
    D8,
}

impl Gear {
    /// Any of the drive gears
    pub fn is_forward(self) -> bool {
        !matches!(self, Gear::Reverse | Gear::Neutral)
    }
}

/// Gearbox selector position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionMode {
    /// R
    Reverse,
    /// N
    #[default]
    Neutral,
    /// D, automatic shifting
    DriveAuto,
    /// D, paddle shifting
    DriveManual,
}

/// Progress of a gear change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShiftState {
    /// No gear engaged
    #[default]
    Neutral,
    /// Gear engaged, no shift running
    InGear,
    /// Leaving the old gear
    DisengagingGear,
    /// Entering the new gear
    EngagingGear,
}

/// Clutch condition reported by the gearbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClutchState {
    /// Open
    #[default]
    Disengaged,
    /// Closed
    FullEngaged,
    /// Slipping for a gear change
    ShiftSlip,
    /// Slipping for a launch
    LaunchSlip,
    /// Slipping without being commanded to
    UncontrolledSlip,
}

impl ClutchState {
    /// Clutch transmits torque
    pub fn is_engaged(self) -> bool {
        !matches!(self, ClutchState::Disengaged)
    }
}

/// Foot brake switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrakePedal {
    /// Not pressed
    #[default]
    Released,
    /// Pressed
    Pressed,
}

/// Parking brake switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParkingBrake {
    /// Released
    #[default]
    Disengaged,
    /// Applied
    Engaged,
}

/// Per-bank sensor values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankInputs {
    /// rpm
    pub turbo_speed: u32,
    /// 1/10 °
    pub cam_position: u32,
    /// mbar
    pub turbo_oil_pressure: u32,
    /// mbar
    pub pre_turbo_pressure: u32,
    /// Measured boost downstream of the intercooler (mbar)
    pub boost_pressure: u32,
    /// Throttle body position (1/10 %)
    pub throttle: u32,
    /// 1/100 lambda, 0 = no valid reading
    pub lambda: u32,
    /// 1/100 lambda
    pub post_cat_lambda: u32,
    /// 1/10 %
    pub knock_level: u32,
    /// Retard requested by knock control (1/10 °)
    pub knock_retard: u32,
    /// Measured wastegate opening (1/10 %)
    pub wastegate: u32,
    /// 1/10 °C
    pub pre_turbo_temp: i32,
    /// 1/10 °C
    pub pre_intercooler_temp: i32,
    /// 1/10 °C
    pub post_intercooler_temp: i32,
    /// Two sensors per bank (1/10 °C)
    pub exhaust_temp: [i32; 2],
}

/// Driver controls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInputs {
    /// Accelerator pedal (1/10 %)
    pub pedal: u32,
    /// Pedal change over the last 200 ms (1/10 %, signed)
    pub pedal_delta: i32,
    /// Foot brake
    pub brake: BrakePedal,
    /// Parking brake
    pub parking_brake: ParkingBrake,
    /// Upshift paddle held
    pub upshift_pressed: bool,
    /// ms
    pub upshift_press_duration: u32,
    /// Downshift paddle held
    pub downshift_pressed: bool,
    /// ms
    pub downshift_press_duration: u32,
    /// Launch control button held
    pub launch_requested: bool,
    /// Mode on the selector switch
    pub performance_request: PerformanceState,
}

/// Gearbox state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionInputs {
    /// Engaged gear
    pub gear: Gear,
    /// Selector position
    pub mode: TransmissionMode,
    /// Shift in progress
    pub shift_state: ShiftState,
    /// Clutch
    pub clutch: ClutchState,
    /// rpm
    pub input_shaft_speed: u32,
    /// rpm
    pub output_shaft_speed: u32,
    /// 1/10 °C
    pub oil_temp: i32,
}

/// Immutable copy of all inputs for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Acquisition time (µs, monotonic)
    pub timestamp_us: u64,
    /// rpm
    pub crank_speed: u32,
    /// Position within the 720 ° cycle (1/10 °)
    pub crank_position: u32,

    /// 1/10 °C
    pub coolant_in_temp: i32,
    /// 1/10 °C
    pub coolant_out_temp: i32,
    /// 1/10 °C
    pub intercooler_water_in_temp: i32,
    /// 1/10 °C
    pub intercooler_water_out_temp: i32,
    /// 1/10 °C
    pub oil_tank_temp: i32,
    /// 1/10 °C
    pub oil_sump_temp: i32,
    /// 1/10 °C
    pub intake_manifold_temp: i32,

    /// mbar
    pub water_pressure: u32,
    /// mbar
    pub oil_pressure: u32,
    /// mbar
    pub intake_manifold_pressure: u32,
    /// mbar, 0 = no reading
    pub fuel_rail_pressure: u32,

    /// mV
    pub supply_voltage: u32,

    /// Indexed by [`Bank::index`]
    pub banks: [BankInputs; BANK_COUNT],
    /// Cam stage
    pub vtec: VtecState,
    /// Fuel grade
    pub fuel_quality: FuelQuality,
    /// Driver controls
    pub driver: DriverInputs,
    /// Gearbox
    pub transmission: TransmissionInputs,

    /// Set by acquisition when any sensor reading is known bad
    pub sensor_fault: bool,
}

impl StateSnapshot {
    /// Inputs of one bank
    pub fn bank(&self, bank: Bank) -> &BankInputs {
        &self.banks[bank.index()]
    }

    /// Output shaft below the stationary threshold
    pub fn is_stationary(&self, stationary_shaft_rpm: u32) -> bool {
        self.transmission.output_shaft_speed < stationary_shaft_rpm
    }

    /// Highest exhaust gas temperature over both banks
    pub fn max_exhaust_temp(&self) -> i32 {
        self.banks
            .iter()
            .flat_map(|b| b.exhaust_temp)
            .max()
            .unwrap_or(i32::MIN)
    }

    /// Highest oil temperature (tank or sump)
    pub fn max_oil_temp(&self) -> i32 {
        self.oil_tank_temp.max(self.oil_sump_temp)
    }
}

/// Single-slot handoff from acquisition to the control cycle.
///
/// Acquisition overwrites the slot with the newest snapshot; the cycle takes
/// it with `try_lock` and never waits on the producer.
#[derive(Debug, Default)]
pub struct SnapshotExchange {
    slot: Mutex<Option<StateSnapshot>>,
}

impl SnapshotExchange {
    /// Empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot, replacing any that was not yet consumed.
    pub fn publish(&self, snapshot: StateSnapshot) {
        *self.slot.lock() = Some(snapshot);
    }

    /// Take the pending snapshot if there is one and the slot is not
    /// currently being written.
    pub fn try_take(&self) -> Option<StateSnapshot> {
        self.slot.try_lock().and_then(|mut slot| slot.take())
    }
}

/// Snapshot handed to one control cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSnapshot {
    /// Inputs for the cycle
    pub snapshot: StateSnapshot,
    /// No new snapshot arrived; the previous one is being reused
    pub stale: bool,
    /// Consecutive cycles the same snapshot has been reused
    pub stale_cycles: u32,
}

/// Cycle-side consumer that remembers the last snapshot for reuse.
#[derive(Debug, Default)]
pub struct SnapshotReader {
    last: StateSnapshot,
    stale_cycles: u32,
}

impl SnapshotReader {
    /// Reader that has not seen a snapshot yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for this cycle: the fresh one if available, otherwise the
    /// previous one flagged stale. Before the first publish this is an
    /// all-zero snapshot (engine stopped).
    pub fn acquire(&mut self, exchange: &SnapshotExchange) -> AcquiredSnapshot {
        match exchange.try_take() {
            Some(snapshot) => {
                self.last = snapshot;
                self.stale_cycles = 0;
            }
            None => self.stale_cycles = self.stale_cycles.saturating_add(1),
        }

        AcquiredSnapshot {
            snapshot: self.last,
            stale: self.stale_cycles > 0,
            stale_cycles: self.stale_cycles,
        }
    }

    /// Forget the last snapshot, as on power-down.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
