//! Control cycle
//!
//! One call to [`ControlUnit::run_cycle`] takes a snapshot, advances the
//! operating mode, runs every pipeline against a single calibration set and
//! produces the actuator commands plus the crank-angle events that are due.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::actuation::{ActuatorCommands, ActuatorSink, CylinderCommand};
use crate::boost::{BoostController, BoostOutput};
use crate::calibration::CalibrationStore;
use crate::config::EcuConfig;
use crate::diagnostics::{Diagnostics, FaultKind};
use crate::fuel::{self, FuelOutput};
use crate::ignition::{self, IgnitionOutput};
use crate::mode::{FaultConditions, ModeMachine, OperatingMode};
use crate::scheduler::{self, ActuationScheduler, CrankAngle, FireEvent};
use crate::snapshot::{SnapshotExchange, SnapshotReader, StateSnapshot};
use crate::thermal;
use crate::torque::{self, TorqueOutput};
use crate::CYLINDER_COUNT;

/// Everything one cycle computed
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Timestamp of the snapshot (µs)
    pub timestamp_us: u64,
    /// Inputs the cycle ran on
    pub snapshot: StateSnapshot,
    /// Mode after this cycle's transitions
    pub mode: OperatingMode,
    /// Output handed to the actuator sink
    pub commands: ActuatorCommands,
    /// Ignition pipeline detail
    pub ignition: IgnitionOutput,
    /// Fuel pipeline detail
    pub fuel: FuelOutput,
    /// Torque arbitration detail
    pub torque: TorqueOutput,
    /// Boost control detail
    pub boost: BoostOutput,
    /// The snapshot was reused from an earlier cycle
    pub stale: bool,
    /// Crank-angle events handed out this cycle
    pub events: Vec<FireEvent>,
}

/// Conditions reported on their rising edge only
#[derive(Debug, Clone, Copy, Default)]
struct LatchedFaults {
    knock_overload: bool,
    overheat: bool,
    sensor_loss: bool,
}

/// The engine control unit: owns all per-cycle state.
#[derive(Debug)]
pub struct ControlUnit {
    config: EcuConfig,
    store: Arc<CalibrationStore>,
    exchange: Arc<SnapshotExchange>,
    diagnostics: Arc<Diagnostics>,
    reader: SnapshotReader,
    modes: ModeMachine,
    boost: BoostController,
    scheduler: ActuationScheduler,
    crank: CrankAngle,
    latched: LatchedFaults,
    consecutive_overruns: u32,
    sustained_overrun: bool,
    cycles: u64,
    last_timestamp_us: u64,
    /// Time between the last two fresh snapshots (µs)
    interval_us: u64,
}

impl ControlUnit {
    /// Create a control unit in the power-up state.
    pub fn new(
        config: EcuConfig,
        store: Arc<CalibrationStore>,
        exchange: Arc<SnapshotExchange>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let scheduler =
            ActuationScheduler::new(config.scheduler.firing_order, config.scheduler.lead_time_us);
        info!(fallback = store.is_fallback(), "control unit initialised");
        let interval_us = config.cycle.budget_us;
        Self {
            config,
            store,
            exchange,
            diagnostics,
            reader: SnapshotReader::new(),
            modes: ModeMachine::new(),
            boost: BoostController::new(),
            scheduler,
            crank: CrankAngle::new(),
            latched: LatchedFaults::default(),
            consecutive_overruns: 0,
            sustained_overrun: false,
            cycles: 0,
            last_timestamp_us: 0,
            interval_us,
        }
    }

    /// Active runtime configuration
    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    /// Shared fault counters and event queue
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Calibration store the cycle reads from
    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Crank-angle event queue
    pub fn scheduler(&self) -> &ActuationScheduler {
        &self.scheduler
    }

    /// Current operating mode
    pub fn mode(&self) -> OperatingMode {
        self.modes.mode()
    }

    /// Cycles run since start or the last power-down
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Consecutive overruns have reached the escalation count
    pub fn is_sustained_overrun(&self) -> bool {
        self.sustained_overrun
    }

    fn raise_on_edge(&self, active: bool, latched: &mut bool, kind: FaultKind, timestamp_us: u64) {
        if active && !*latched {
            self.diagnostics.raise(kind, timestamp_us);
        }
        *latched = active;
    }

    /// Run one control cycle.
    pub fn run_cycle(&mut self) -> CycleReport {
        let cal = self.store.current();
        let acquired = self.reader.acquire(&self.exchange);
        let snapshot = acquired.snapshot;
        let now_us = snapshot.timestamp_us;
        if !acquired.stale && self.cycles > 0 && now_us > self.last_timestamp_us {
            self.interval_us = now_us - self.last_timestamp_us;
        }
        self.last_timestamp_us = now_us;
        self.cycles += 1;

        if acquired.stale {
            self.diagnostics.raise(FaultKind::StaleSnapshot, now_us);
        }
        let sensor_loss = acquired.stale_cycles > self.config.mode.max_stale_cycles;

        let faults = FaultConditions::evaluate(
            &snapshot,
            &self.config.mode,
            sensor_loss,
            self.sustained_overrun,
        );
        let mut latched = self.latched;
        self.raise_on_edge(faults.knock_overload, &mut latched.knock_overload, FaultKind::KnockOverload, now_us);
        self.raise_on_edge(
            faults.overheat || faults.critical_overheat,
            &mut latched.overheat,
            FaultKind::Overheat,
            now_us,
        );
        self.raise_on_edge(faults.sensor_loss, &mut latched.sensor_loss, FaultKind::SensorLoss, now_us);
        self.latched = latched;

        let mode = self
            .modes
            .update(&snapshot, &faults, &self.config.mode, &self.diagnostics);

        let ignition = ignition::compute(&cal, &snapshot, &mode);
        let fuel = fuel::compute(&cal, &snapshot, &mode, &self.config.fuel);
        let torque = torque::arbitrate(
            &cal,
            &snapshot,
            &mode,
            ignition.blend_percent,
            &self.config.torque,
        );
        let boost = self.boost.update(
            &cal,
            &snapshot,
            &mode,
            torque.intake_pressure_cmd,
            &self.config.boost,
        );
        let pumps = thermal::compute(&cal, &snapshot, &mode);

        let mut cylinders = [CylinderCommand::default(); CYLINDER_COUNT];
        for (cyl, out) in cylinders.iter_mut().enumerate() {
            let spark = &ignition.cylinders[cyl];
            let inj = &fuel.cylinders[cyl];
            *out = CylinderCommand {
                fuel: inj.fuel,
                injector: inj.injector,
                injector_duration_us: inj.injector_duration_us,
                injection_angle: inj.injection_angle,
                ignition: spark.ignition,
                coil: spark.coil,
                timing: spark.timing,
                dwell_us: spark.dwell_us,
            };
        }

        let commands = ActuatorCommands {
            cylinders,
            wastegate: boost.wastegate,
            popoff: boost.popoff,
            throttle: torque.throttle_cmd,
            intake_pressure: torque.intake_pressure_cmd,
            torque: torque.torque_cmd,
            engine_brake_allowed: torque.engine_brake_allowed,
            coolant_pump_duty: pumps.coolant,
            intercooler_pump_duty: pumps.intercooler,
        };

        let angle = self.crank.update(snapshot.crank_position);
        self.scheduler
            .schedule(angle, snapshot.crank_speed, &commands.cylinders);
        let reach_us = self.interval_us * u64::from(self.config.scheduler.lookahead_percent) / 100;
        let horizon = scheduler::lookahead_angle(reach_us, snapshot.crank_speed);
        let late_before = self.scheduler.late_count();
        let events = self.scheduler.drain_due(angle, horizon);
        for _ in late_before..self.scheduler.late_count() {
            self.diagnostics.raise(FaultKind::LateEvent, now_us);
        }

        CycleReport {
            timestamp_us: now_us,
            snapshot,
            mode,
            commands,
            ignition,
            fuel,
            torque,
            boost,
            stale: acquired.stale,
            events,
        }
    }

    /// Run one cycle, hand the commands to `sink` and account for the time
    /// the cycle took.
    pub fn run_cycle_into(&mut self, sink: &mut dyn ActuatorSink) -> CycleReport {
        let started = Instant::now();
        let report = self.run_cycle();
        sink.apply(&report.commands);
        self.record_cycle_time(started.elapsed());
        report
    }

    /// Account for the duration of the last cycle.
    ///
    /// Overruns are counted individually; `overrun_escalation_count` in a row
    /// latch the sustained-overrun condition until a cycle meets its budget.
    pub fn record_cycle_time(&mut self, elapsed: Duration) {
        let budget = Duration::from_micros(self.config.cycle.budget_us);
        let now_us = self.last_timestamp_us;

        if elapsed <= budget {
            if self.sustained_overrun {
                info!("cycle time back within budget");
            }
            self.consecutive_overruns = 0;
            self.sustained_overrun = false;
            return;
        }

        self.consecutive_overruns = self.consecutive_overruns.saturating_add(1);
        debug!(
            elapsed_us = elapsed.as_micros() as u64,
            consecutive = self.consecutive_overruns,
            "cycle overrun"
        );
        self.diagnostics.raise(FaultKind::CycleOverrun, now_us);

        if !self.sustained_overrun
            && self.consecutive_overruns >= self.config.cycle.overrun_escalation_count
        {
            warn!(
                consecutive = self.consecutive_overruns,
                "sustained overrun, cutting engine"
            );
            self.sustained_overrun = true;
            self.diagnostics.raise(FaultKind::SustainedOverrun, now_us);
        }
    }

    /// Return to the power-up state and produce the safe output.
    pub fn power_down(&mut self) -> ActuatorCommands {
        info!(cycles = self.cycles, "power down");
        self.modes.reset();
        self.boost.reset();
        self.scheduler.clear();
        self.reader.reset();
        self.crank = CrankAngle::new();
        self.latched = LatchedFaults::default();
        self.consecutive_overruns = 0;
        self.sustained_overrun = false;
        self.cycles = 0;
        self.interval_us = self.config.cycle.budget_us;
        ActuatorCommands::shutdown()
    }
}
