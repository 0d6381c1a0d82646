//! Torque arbitration
//!
//! Reconciles what the driver asks for with what the engine can deliver in
//! its current mode, and with the extra torque a downshift needs to match
//! engine speed. The winning request is turned into an intake-pressure and a
//! throttle target.

use serde::{Deserialize, Serialize};

use crate::calibration::{axis_input, round_div, CalibrationSet, Table2D};
use crate::config::TorqueConfig;
use crate::mode::{OperatingMode, RunningState};
use crate::snapshot::{Bank, StateSnapshot};
use crate::BANK_COUNT;

/// Pressure assumed upstream of the turbo when the sensor reads zero (mbar)
const STANDARD_ATMOSPHERE_MBAR: u32 = 1013;

/// Result of torque arbitration for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorqueOutput {
    /// Engine torque request (1/10 Nm)
    pub torque_cmd: i32,
    /// Driver demand after the pedal-delta factor (Nm)
    pub demand: i32,
    /// Deliverable torque in the current mode (Nm)
    pub capability: i32,
    /// Upper bound applied to the request (Nm)
    pub ceiling: i32,
    /// Downshift allowance in effect (Nm), 0 when inactive
    pub downshift_allowance: i32,
    /// Drag torque may be requested from the engine
    pub engine_brake_allowed: bool,
    /// Intake manifold pressure target (mbar)
    pub intake_pressure_cmd: u32,
    /// Throttle body target per bank (1/10 %)
    pub throttle_cmd: [u32; BANK_COUNT],
}

/// Driver demand scaled by the pedal-delta factor (Nm).
pub fn driver_demand(cal: &CalibrationSet, snapshot: &StateSnapshot, mode: &OperatingMode) -> i32 {
    let rpm = axis_input(snapshot.crank_speed);
    let perf = mode.performance.index();
    let d = &snapshot.driver;

    let demand = cal
        .driver_torque_demand
        .lookup(rpm, axis_input(d.pedal), perf);
    let factor = cal
        .driver_torque_demand_delta_factor
        .lookup(rpm, d.pedal_delta, perf);
    round_div(i128::from(demand) * i128::from(factor), 1000) as i32
}

/// Torque at the boost ceiling, reduced by the torque lost to minimum-timing
/// blending (Nm).
pub fn capability(cal: &CalibrationSet, snapshot: &StateSnapshot, mode: &OperatingMode, blend: u32) -> i32 {
    let rpm = axis_input(snapshot.crank_speed);
    let ceiling_pressure = cal.turbo_max_boost.lookup(rpm, mode.emergency.index());
    let torque = cal.torque_map.lookup(rpm, ceiling_pressure);
    if blend == 0 {
        return torque;
    }

    let loss = cal
        .min_ignition_power_loss
        .lookup(rpm, ceiling_pressure)
        .clamp(0, 100);
    let blend = i128::from(blend.min(100));
    let ratio = 100 - round_div((100 - i128::from(loss)) * blend, 100);
    round_div(i128::from(torque) * ratio, 100) as i32
}

/// Smallest intake pressure at which `torque_map` yields `torque` at `rpm`,
/// interpolating between pressure breakpoints. Clamps to the axis ends.
pub fn pressure_for_torque(map: &Table2D, rpm: i32, torque: i32) -> u32 {
    let points = map.y_axis().points();
    let mut prev: Option<(i32, i32)> = None;

    for &p in points {
        let t = map.lookup(rpm, p);
        if t >= torque {
            let pressure = match prev {
                Some((p0, t0)) if t > t0 => {
                    let span = i128::from(p) - i128::from(p0);
                    let offset = round_div((i128::from(torque) - i128::from(t0)) * span, i128::from(t) - i128::from(t0));
                    (i128::from(p0) + offset) as i32
                }
                _ => p,
            };
            return pressure.max(0) as u32;
        }
        prev = Some((p, t));
    }

    points.last().copied().unwrap_or(0).max(0) as u32
}

fn zero_torque(running: RunningState) -> bool {
    running.is_stopped()
        || matches!(
            running,
            RunningState::RunningCompleteCut | RunningState::RunningFuelCut
        )
}

/// Arbitrate the torque request for this cycle.
pub fn arbitrate(
    cal: &CalibrationSet,
    snapshot: &StateSnapshot,
    mode: &OperatingMode,
    blend: u32,
    config: &TorqueConfig,
) -> TorqueOutput {
    let rpm = axis_input(snapshot.crank_speed);
    let d = &snapshot.driver;

    let demand = driver_demand(cal, snapshot, mode);
    let capability = capability(cal, snapshot, mode, blend);

    let downshift = d.downshift_pressed && d.downshift_press_duration <= config.downshift_window_ms;
    let allowance = if downshift {
        cal.max_downshift_torque_request
            .lookup(mode.performance.index(), rpm)
            .max(0)
    } else {
        0
    };

    let ceiling = capability.saturating_add(allowance);
    let request = if downshift {
        demand.max(allowance).min(ceiling)
    } else {
        demand.min(ceiling)
    };

    if zero_torque(mode.running) {
        return TorqueOutput {
            demand,
            capability,
            ceiling,
            engine_brake_allowed: true,
            ..TorqueOutput::default()
        };
    }

    let request = request.max(0);
    let intake_pressure_cmd = pressure_for_torque(&cal.torque_map, rpm, request);

    let mut throttle_cmd = [0; BANK_COUNT];
    for bank in Bank::ALL {
        let upstream = match snapshot.bank(bank).pre_turbo_pressure {
            0 => STANDARD_ATMOSPHERE_MBAR,
            p => p,
        };
        let open = u64::from(intake_pressure_cmd) * 1000 / u64::from(upstream);
        throttle_cmd[bank.index()] = open.min(1000) as u32;
    }

    TorqueOutput {
        torque_cmd: request.saturating_mul(10),
        demand,
        capability,
        ceiling,
        downshift_allowance: allowance,
        engine_brake_allowed: !downshift && !mode.running.is_launch(),
        intake_pressure_cmd,
        throttle_cmd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Axis;

    fn linear_map() -> Table2D {
        // torque = pressure / 4 at every speed
        Table2D::from_fn(
            Axis::new(vec![1000, 7000]).unwrap(),
            Axis::new(vec![200, 1000, 2200]).unwrap(),
            |_, p| p / 4,
        )
    }

    #[test]
    fn test_pressure_inverse_of_map() {
        let map = linear_map();
        assert_eq!(pressure_for_torque(&map, 3000, 250), 1000);
        assert_eq!(pressure_for_torque(&map, 3000, 400), 1600);
    }

    #[test]
    fn test_pressure_clamps_to_axis() {
        let map = linear_map();
        assert_eq!(pressure_for_torque(&map, 3000, 0), 200);
        assert_eq!(pressure_for_torque(&map, 3000, 10_000), 2200);
    }
}
