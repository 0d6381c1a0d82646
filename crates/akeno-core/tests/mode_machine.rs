//! Operating-mode tests - start sequence, limiters, launch, cuts and emergency tiers

use akeno_core::config::ModeConfig;
use akeno_core::diagnostics::{DiagnosticEvent, Diagnostics, FaultKind};
use akeno_core::mode::{
    EmergencyState, FaultConditions, ModeMachine, OperatingMode, PerformanceState, RunningState,
};
use akeno_core::snapshot::{BrakePedal, ClutchState, Gear, StateSnapshot};
use pretty_assertions::assert_eq;

struct Harness {
    machine: ModeMachine,
    config: ModeConfig,
    diag: Diagnostics,
    now_us: u64,
}

impl Harness {
    fn new() -> Self {
        Self {
            machine: ModeMachine::new(),
            config: ModeConfig::default(),
            diag: Diagnostics::new(),
            now_us: 0,
        }
    }

    fn step_with(&mut self, mut snapshot: StateSnapshot, faults: FaultConditions) -> OperatingMode {
        self.now_us += 2_000;
        snapshot.timestamp_us = self.now_us;
        self.machine.update(&snapshot, &faults, &self.config, &self.diag)
    }

    fn step(&mut self, snapshot: StateSnapshot) -> RunningState {
        let faults = FaultConditions::evaluate(&snapshot, &self.config, false, false);
        self.step_with(snapshot, faults).running
    }

    /// Crank and start into free idle
    fn start(&mut self) {
        assert_eq!(self.step(at_rpm(200)), RunningState::StoppedPrepping);
        assert_eq!(self.step(at_rpm(600)), RunningState::RunningIdleFree);
    }
}

fn at_rpm(rpm: u32) -> StateSnapshot {
    StateSnapshot {
        crank_speed: rpm,
        coolant_out_temp: 850,
        ..Default::default()
    }
}

fn with_pedal(rpm: u32, pedal: u32) -> StateSnapshot {
    let mut s = at_rpm(rpm);
    s.driver.pedal = pedal;
    s
}

#[test]
fn test_start_sequence() {
    let mut h = Harness::new();
    assert_eq!(h.step(at_rpm(0)), RunningState::Stopped);
    assert_eq!(h.step(at_rpm(100)), RunningState::Stopped);
    assert_eq!(h.step(at_rpm(200)), RunningState::StoppedPrepping);
    assert_eq!(h.step(at_rpm(400)), RunningState::StoppedPrepping);
    assert_eq!(h.step(at_rpm(600)), RunningState::RunningIdleFree);
}

#[test]
fn test_failed_start_returns_to_stopped() {
    let mut h = Harness::new();
    assert_eq!(h.step(at_rpm(200)), RunningState::StoppedPrepping);
    assert_eq!(h.step(at_rpm(0)), RunningState::Stopped);
}

#[test]
fn test_idle_to_normal_and_back() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.step(with_pedal(900, 300)), RunningState::RunningNormal);
    assert_eq!(h.step(with_pedal(2500, 300)), RunningState::RunningNormal);
    assert_eq!(h.step(with_pedal(1000, 0)), RunningState::RunningIdleFree);
}

#[test]
fn test_idle_driving_when_in_gear() {
    let mut h = Harness::new();
    h.start();
    let mut s = at_rpm(900);
    s.transmission.gear = Gear::D1;
    s.transmission.clutch = ClutchState::FullEngaged;
    assert_eq!(h.step(s), RunningState::RunningIdleDriving);
}

#[test]
fn test_limiters_with_hysteresis() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.step(with_pedal(3000, 800)), RunningState::RunningNormal);
    assert_eq!(h.step(with_pedal(8300, 800)), RunningState::RunningSoftLimiter);
    assert_eq!(h.step(with_pedal(8700, 800)), RunningState::RunningHardLimiter);
    // hard limit 8600, hysteresis 150
    assert_eq!(h.step(with_pedal(8500, 800)), RunningState::RunningHardLimiter);
    assert_eq!(h.step(with_pedal(8400, 800)), RunningState::RunningSoftLimiter);
    // soft limit 8200
    assert_eq!(h.step(with_pedal(8100, 800)), RunningState::RunningSoftLimiter);
    assert_eq!(h.step(with_pedal(8000, 800)), RunningState::RunningNormal);
}

#[test]
fn test_upshift_ignition_cut() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.step(with_pedal(5000, 800)), RunningState::RunningNormal);

    let mut s = with_pedal(6000, 800);
    s.driver.upshift_pressed = true;
    s.driver.upshift_press_duration = 10;
    assert_eq!(h.step(s), RunningState::RunningIgnitionCut);

    s.driver.upshift_press_duration = 100;
    assert_eq!(h.step(s), RunningState::RunningNormal);
}

#[test]
fn test_overrun_fuel_cut() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.step(with_pedal(4000, 500)), RunningState::RunningNormal);

    let mut s = with_pedal(4000, 0);
    s.transmission.gear = Gear::D3;
    s.transmission.clutch = ClutchState::FullEngaged;
    s.transmission.output_shaft_speed = 1500;
    assert_eq!(h.step(s), RunningState::RunningFuelCut);

    s.crank_speed = 1100;
    assert_eq!(h.step(s), RunningState::RunningNormal);
}

#[test]
fn test_launch_sequence() {
    let mut h = Harness::new();
    h.start();

    let mut s = at_rpm(900);
    s.transmission.gear = Gear::D1;
    s.driver.launch_requested = true;
    s.driver.brake = BrakePedal::Pressed;
    assert_eq!(h.step(s), RunningState::RunningLaunchPrep);

    s.driver.pedal = 1000;
    s.crank_speed = 4000;
    assert_eq!(h.step(s), RunningState::RunningLaunchLimit);

    // pedal lifted below the launch threshold
    s.driver.pedal = 300;
    assert_eq!(h.step(s), RunningState::RunningLaunchPrep);
    s.driver.pedal = 1000;
    assert_eq!(h.step(s), RunningState::RunningLaunchLimit);

    s.driver.brake = BrakePedal::Released;
    assert_eq!(h.step(s), RunningState::RunningLaunchStart);

    s.transmission.clutch = ClutchState::LaunchSlip;
    s.transmission.output_shaft_speed = 300;
    assert_eq!(h.step(s), RunningState::RunningLaunchStart);

    s.transmission.output_shaft_speed = 700;
    assert_eq!(h.step(s), RunningState::RunningNormal);
}

#[test]
fn test_performance_held_during_launch() {
    let mut h = Harness::new();
    h.start();

    let mut s = at_rpm(900);
    s.driver.launch_requested = true;
    s.driver.brake = BrakePedal::Pressed;
    let mode = h.step_with(s, FaultConditions::default());
    assert_eq!(mode.running, RunningState::RunningLaunchPrep);
    assert_eq!(mode.performance, PerformanceState::Norm);

    s.driver.performance_request = PerformanceState::RaceSprint;
    let mode = h.step_with(s, FaultConditions::default());
    assert_eq!(mode.performance, PerformanceState::Norm);

    s.driver.launch_requested = false;
    // leaving launch: still held on the transition cycle
    let mode = h.step_with(s, FaultConditions::default());
    assert_eq!(mode.running, RunningState::RunningIdleFree);
    assert_eq!(mode.performance, PerformanceState::Norm);

    let mode = h.step_with(s, FaultConditions::default());
    assert_eq!(mode.performance, PerformanceState::RaceSprint);
}

#[test]
fn test_stall_then_restart() {
    let mut h = Harness::new();
    h.start();
    assert_eq!(h.step(at_rpm(100)), RunningState::StoppedDied);
    assert_eq!(h.step(at_rpm(200)), RunningState::StoppedPrepping);
}

#[test]
fn test_sustained_overrun_forces_complete_cut() {
    let mut h = Harness::new();
    h.start();
    let overrun = FaultConditions {
        sustained_overrun: true,
        ..Default::default()
    };

    let mode = h.step_with(with_pedal(3000, 400), overrun);
    assert_eq!(mode.running, RunningState::RunningCompleteCut);
    assert_eq!(mode.emergency, EmergencyState::PowerLift1);

    h.step_with(with_pedal(3000, 400), overrun);
    let mode = h.step_with(with_pedal(3000, 400), overrun);
    assert_eq!(mode.running, RunningState::RunningCompleteCut);
    assert_eq!(mode.emergency, EmergencyState::Emergency);

    let mode = h.step_with(with_pedal(3000, 400), FaultConditions::default());
    assert_eq!(mode.running, RunningState::RunningNormal);
    // de-escalation waits for the dwell
    assert_eq!(mode.emergency, EmergencyState::Emergency);
}

#[test]
fn test_emergency_deescalates_after_dwell() {
    let mut h = Harness::new();
    h.config.deescalation_dwell_us = 10_000;
    h.start();

    let mut knocking = with_pedal(3000, 400);
    knocking.banks[1].knock_level = h.config.knock_overload_level;
    h.step(knocking);
    assert_eq!(h.machine.mode().emergency, EmergencyState::PowerLift1);

    let quiet = with_pedal(3000, 400);
    let mut cycles = 0;
    while h.machine.mode().emergency != EmergencyState::Normal {
        h.step(quiet);
        cycles += 1;
        assert!(cycles < 100, "never de-escalated");
    }
    // first quiet cycle starts the dwell, 10 ms at 2 ms per cycle
    assert_eq!(cycles, 6);

    let events = h.diag.drain();
    let changes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DiagnosticEvent::EmergencyChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![
            (EmergencyState::Normal, EmergencyState::PowerLift1),
            (EmergencyState::PowerLift1, EmergencyState::Normal),
        ]
    );
}

#[test]
fn test_overheat_demands_power_lift_two() {
    let mut h = Harness::new();
    h.start();
    let mut hot = with_pedal(3000, 400);
    hot.coolant_out_temp = h.config.overheat_coolant;
    h.step(hot);
    h.step(hot);
    h.step(hot);
    assert_eq!(h.machine.mode().emergency, EmergencyState::PowerLift2);
}

#[test]
fn test_invalid_combination_holds_previous_mode() {
    let mut h = Harness::new();
    h.start();
    let before = h.machine.mode();

    // engine reads zero but the car is moving in gear with the clutch closed
    let mut s = at_rpm(0);
    s.transmission.gear = Gear::D4;
    s.transmission.clutch = ClutchState::FullEngaged;
    s.transmission.output_shaft_speed = 2000;
    h.step(s);
    h.step(s);

    assert_eq!(h.machine.mode(), before);
    assert_eq!(h.diag.count(FaultKind::InvalidStateCombination), 1);

    assert_eq!(h.step(at_rpm(900)), RunningState::RunningIdleFree);

    // launch requested in reverse
    let mut s = at_rpm(900);
    s.transmission.gear = Gear::Reverse;
    s.driver.launch_requested = true;
    h.step(s);
    assert_eq!(h.machine.mode(), before);
    assert_eq!(h.diag.count(FaultKind::InvalidStateCombination), 2);
}
