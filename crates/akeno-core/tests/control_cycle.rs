//! Control cycle tests - snapshot supervision, overrun escalation and power-down

use akeno_core::prelude::*;
use akeno_core::scheduler::CrankAngle;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Rig {
    ecu: ControlUnit,
    exchange: Arc<SnapshotExchange>,
    diagnostics: Arc<Diagnostics>,
    now_us: u64,
}

impl Rig {
    fn new() -> Self {
        init_tracing();
        let diagnostics = Arc::new(Diagnostics::new());
        let store = Arc::new(CalibrationStore::new(CalibrationSet::fallback()).unwrap());
        let exchange = Arc::new(SnapshotExchange::new());
        let ecu = ControlUnit::new(
            EcuConfig::default(),
            store,
            Arc::clone(&exchange),
            Arc::clone(&diagnostics),
        );
        Self {
            ecu,
            exchange,
            diagnostics,
            now_us: 0,
        }
    }

    fn publish(&mut self, rpm: u32, pedal: u32) {
        self.now_us += 2_000;
        let mut s = StateSnapshot {
            timestamp_us: self.now_us,
            crank_speed: rpm,
            crank_position: ((self.now_us / 2_000) * 100 % 7200) as u32,
            coolant_out_temp: 850,
            intake_manifold_pressure: 900,
            supply_voltage: 13_500,
            ..Default::default()
        };
        s.driver.pedal = pedal;
        self.exchange.publish(s);
    }

    fn cycle(&mut self, rpm: u32, pedal: u32) -> CycleReport {
        self.publish(rpm, pedal);
        self.ecu.run_cycle()
    }

    fn start(&mut self) {
        self.cycle(200, 0);
        let report = self.cycle(900, 0);
        assert_eq!(report.mode.running, RunningState::RunningIdleFree);
    }
}

#[test]
fn test_first_cycle_without_snapshot_is_stopped() {
    let mut rig = Rig::new();
    let report = rig.ecu.run_cycle();

    assert!(report.stale);
    assert_eq!(report.mode.running, RunningState::Stopped);
    assert!(report.commands.cylinders.iter().all(|c| c.is_off()));
}

#[test]
fn test_running_engine_is_fueled_and_fired() {
    let mut rig = Rig::new();
    rig.start();
    let report = rig.cycle(3000, 400);

    assert_eq!(report.mode.running, RunningState::RunningNormal);
    for cmd in &report.commands.cylinders {
        assert_eq!(cmd.fuel, FuelState::On);
        assert_eq!(cmd.ignition, IgnitionState::On);
        assert!(cmd.injector_duration_us > 0);
    }
    assert!(report.commands.torque > 0);
    // 85.0 °C between the 60 and 90 °C breakpoints
    assert_eq!(report.commands.coolant_pump_duty, 55);
}

#[test]
fn test_stale_snapshots_escalate_to_sensor_loss() {
    let mut rig = Rig::new();
    rig.start();
    let max_stale = rig.ecu.config().mode.max_stale_cycles;

    for n in 1..=max_stale {
        let report = rig.ecu.run_cycle();
        assert!(report.stale);
        assert_eq!(report.snapshot.crank_speed, 900, "last snapshot is reused");
        assert_eq!(rig.diagnostics.count(FaultKind::SensorLoss), 0, "cycle {}", n);
    }

    rig.ecu.run_cycle();
    rig.ecu.run_cycle();
    assert_eq!(rig.diagnostics.count(FaultKind::SensorLoss), 1);
    assert_eq!(
        rig.diagnostics.count(FaultKind::StaleSnapshot),
        u64::from(max_stale) + 2
    );
    assert_eq!(rig.ecu.mode().emergency, EmergencyState::PowerLift2);

    // a fresh snapshot ends the stale streak
    let report = rig.cycle(900, 0);
    assert!(!report.stale);
}

#[test]
fn test_sustained_overrun_cuts_all_cylinders() {
    let mut rig = Rig::new();
    rig.start();

    let over = Duration::from_micros(rig.ecu.config().cycle.budget_us + 500);
    rig.ecu.record_cycle_time(over);
    rig.ecu.record_cycle_time(over);
    assert!(!rig.ecu.is_sustained_overrun());
    rig.ecu.record_cycle_time(over);
    assert!(rig.ecu.is_sustained_overrun());

    let report = rig.cycle(3000, 400);
    assert_eq!(report.mode.running, RunningState::RunningCompleteCut);
    assert!(report.commands.cylinders.iter().all(|c| c.is_off()));
    assert_eq!(report.commands.torque, 0);

    let counters = rig.diagnostics.counters();
    assert_eq!(counters.cycle_overrun, 3);
    assert_eq!(counters.sustained_overrun, 1);

    // back within budget: the engine is allowed to run again
    rig.ecu.record_cycle_time(Duration::from_micros(100));
    assert!(!rig.ecu.is_sustained_overrun());
    let report = rig.cycle(3000, 400);
    assert_eq!(report.mode.running, RunningState::RunningNormal);
}

#[test]
fn test_single_overrun_only_counted() {
    let mut rig = Rig::new();
    rig.start();
    rig.ecu.record_cycle_time(Duration::from_millis(5));
    rig.ecu.record_cycle_time(Duration::from_micros(10));
    rig.ecu.record_cycle_time(Duration::from_millis(5));

    assert!(!rig.ecu.is_sustained_overrun());
    assert_eq!(rig.diagnostics.count(FaultKind::CycleOverrun), 2);
    assert_eq!(rig.diagnostics.count(FaultKind::SustainedOverrun), 0);
}

#[test]
fn test_commands_reach_sink() {
    let mut rig = Rig::new();
    rig.start();
    rig.publish(2500, 300);

    let mut sink: Vec<ActuatorCommands> = Vec::new();
    let report = rig.ecu.run_cycle_into(&mut sink);

    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0], report.commands);
}

#[test]
fn test_overheat_reported_once() {
    let mut rig = Rig::new();
    rig.start();
    let hot = rig.ecu.config().mode.overheat_coolant;

    for _ in 0..5 {
        rig.now_us += 2_000;
        let s = StateSnapshot {
            timestamp_us: rig.now_us,
            crank_speed: 3000,
            coolant_out_temp: hot,
            ..Default::default()
        };
        rig.exchange.publish(s);
        rig.ecu.run_cycle();
    }
    assert_eq!(rig.diagnostics.count(FaultKind::Overheat), 1);
    assert_eq!(rig.ecu.mode().emergency, EmergencyState::PowerLift2);
}

#[test]
fn test_power_down_resets_state() {
    let mut rig = Rig::new();
    rig.start();
    rig.cycle(3000, 400);

    let shutdown = rig.ecu.power_down();
    assert_eq!(shutdown.wastegate, [1000, 1000]);
    assert!(shutdown.cylinders.iter().all(|c| c.is_off()));
    assert_eq!(rig.ecu.mode(), OperatingMode::default());
    assert!(rig.ecu.scheduler().pending().is_empty());
    assert_eq!(rig.ecu.cycles(), 0);
}

#[test]
fn test_simulated_start_reaches_idle() {
    let mut rig = Rig::new();
    let mut sim = AcquisitionSimulator::seeded(11);
    let mut events = 0;

    for n in 0..1250u64 {
        rig.exchange.publish(sim.update(n * 2_000));
        let report = rig.ecu.run_cycle();
        assert!(!report.stale);
        events += report.events.len();
    }

    assert_eq!(rig.ecu.mode().running, RunningState::RunningIdleFree);
    assert_eq!(rig.ecu.mode().emergency, EmergencyState::Normal);
    assert!(events > 0);
    assert_eq!(rig.diagnostics.count(FaultKind::InvalidStateCombination), 0);
}

#[test]
fn test_simulated_run_issues_events_ahead_of_crank() {
    let mut rig = Rig::new();
    let mut sim = AcquisitionSimulator::seeded(7);
    let mut crank = CrankAngle::new();
    let mut issued = 0u64;

    for n in 0..3000u64 {
        let snapshot = sim.update(n * 1_000);
        let now = crank.update(snapshot.crank_position);
        rig.exchange.publish(snapshot);
        let report = rig.ecu.run_cycle();

        for event in &report.events {
            assert!(
                event.angle >= now,
                "cycle {}: {:?} at {} issued with crank at {}",
                n,
                event.kind,
                event.angle,
                now
            );
        }
        issued += report.events.len() as u64;
    }

    assert!(issued > 0);
    assert_eq!(rig.ecu.scheduler().late_count(), 0);
    assert_eq!(rig.diagnostics.count(FaultKind::LateEvent), 0);
    assert!(rig.ecu.scheduler().deferred_count() <= issued);
}
