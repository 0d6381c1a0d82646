//! Torque arbitration tests - demand, capability, downshift allowance and throttle

use akeno_core::calibration::{Axis, CalibrationSet, Table2D};
use akeno_core::config::TorqueConfig;
use akeno_core::mode::{EmergencyState, OperatingMode, PerformanceState, RunningState};
use akeno_core::snapshot::StateSnapshot;
use akeno_core::torque;
use pretty_assertions::assert_eq;

fn calibration() -> CalibrationSet {
    let mut cal = CalibrationSet::fallback();
    cal.max_downshift_torque_request = Table2D::from_fn(
        Axis::enumerated(PerformanceState::COUNT),
        Axis::new(vec![1000, 7000]).unwrap(),
        |_, _| 150,
    );
    cal
}

fn snapshot(pedal: u32) -> StateSnapshot {
    let mut s = StateSnapshot {
        crank_speed: 3000,
        intake_manifold_pressure: 800,
        ..Default::default()
    };
    s.driver.pedal = pedal;
    for bank in &mut s.banks {
        bank.pre_turbo_pressure = 1000;
    }
    s
}

fn normal() -> OperatingMode {
    OperatingMode {
        running: RunningState::RunningNormal,
        ..Default::default()
    }
}

#[test]
fn test_demand_follows_pedal() {
    let cal = calibration();
    // fallback demand is 30 % of the pedal, in Nm
    let out = torque::arbitrate(&cal, &snapshot(500), &normal(), 0, &TorqueConfig::default());

    assert_eq!(out.demand, 150);
    assert_eq!(out.torque_cmd, 1500);
    assert_eq!(out.capability, 250);
    assert!(out.engine_brake_allowed);
}

#[test]
fn test_request_limited_by_capability() {
    let cal = calibration();
    let out = torque::arbitrate(&cal, &snapshot(1000), &normal(), 0, &TorqueConfig::default());

    assert_eq!(out.demand, 300);
    assert_eq!(out.ceiling, 250);
    assert_eq!(out.torque_cmd, 2500);
    // torque map is pressure / 4
    assert_eq!(out.intake_pressure_cmd, 1000);
    assert_eq!(out.throttle_cmd, [1000, 1000]);
}

#[test]
fn test_blend_reduces_capability() {
    let cal = calibration();
    let mode = OperatingMode {
        emergency: EmergencyState::Emergency,
        ..normal()
    };
    let out = torque::arbitrate(&cal, &snapshot(1000), &mode, 100, &TorqueConfig::default());

    // 85 % of 250 Nm
    assert_eq!(out.capability, 213);
    assert_eq!(out.torque_cmd, 2130);
}

#[test]
fn test_downshift_allowance_then_revert() {
    let cal = calibration();
    let config = TorqueConfig::default();

    let mut s = snapshot(0);
    s.driver.downshift_pressed = true;
    s.driver.downshift_press_duration = 100;
    let during = torque::arbitrate(&cal, &s, &normal(), 0, &config);
    assert_eq!(during.downshift_allowance, 150);
    assert_eq!(during.torque_cmd, 1500);
    assert!(!during.engine_brake_allowed);

    s.driver.downshift_press_duration = config.downshift_window_ms + 1;
    let late = torque::arbitrate(&cal, &s, &normal(), 0, &config);
    assert_eq!(late.downshift_allowance, 0);
    assert_eq!(late.torque_cmd, 0);

    s.driver.downshift_pressed = false;
    let after = torque::arbitrate(&cal, &s, &normal(), 0, &config);
    assert_eq!(after.torque_cmd, 0);
    assert!(after.engine_brake_allowed);
}

#[test]
fn test_zero_torque_when_cut_or_stopped() {
    let cal = calibration();
    for state in [
        RunningState::Stopped,
        RunningState::RunningFuelCut,
        RunningState::RunningCompleteCut,
    ] {
        let mode = OperatingMode {
            running: state,
            ..Default::default()
        };
        let out = torque::arbitrate(&cal, &snapshot(800), &mode, 0, &TorqueConfig::default());
        assert_eq!(out.torque_cmd, 0, "{:?}", state);
        assert_eq!(out.throttle_cmd, [0, 0]);
    }
}

#[test]
fn test_engine_brake_disallowed_during_launch() {
    let cal = calibration();
    let mode = OperatingMode {
        running: RunningState::RunningLaunchLimit,
        ..Default::default()
    };
    let out = torque::arbitrate(&cal, &snapshot(800), &mode, 0, &TorqueConfig::default());
    assert!(!out.engine_brake_allowed);
}

#[test]
fn test_throttle_uses_standard_atmosphere_without_reading() {
    let cal = calibration();
    let mut s = snapshot(500);
    s.banks[1].pre_turbo_pressure = 0;

    let out = torque::arbitrate(&cal, &s, &normal(), 0, &TorqueConfig::default());
    // 150 Nm needs 600 mbar
    assert_eq!(out.intake_pressure_cmd, 600);
    assert_eq!(out.throttle_cmd[0], 600);
    assert_eq!(out.throttle_cmd[1], 592);
}

#[test]
fn test_capability_read_at_boost_ceiling() {
    let cal = calibration();
    let config = TorqueConfig::default();

    for measured in [300, 800, 2000] {
        let mut s = snapshot(1000);
        s.intake_manifold_pressure = measured;
        let out = torque::arbitrate(&cal, &s, &normal(), 0, &config);
        // fallback ceiling is 1000 mbar, torque map is pressure / 4
        assert_eq!(out.capability, 250, "measured {} mbar", measured);
    }
}
