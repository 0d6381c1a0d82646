//! Ignition pipeline
//!
//! Spark advance per cylinder: base map selected by fuel grade and VTEC,
//! pulled toward the minimum-timing map by the emergency blend, minus knock
//! and tip-out retard.

use serde::{Deserialize, Serialize};

use crate::actuation::{CoilState, IgnitionState};
use crate::calibration::{axis_input, round_div, CalibrationSet};
use crate::mode::OperatingMode;
use crate::snapshot::{bank_of, StateSnapshot};
use crate::CYLINDER_COUNT;

/// Ignition command for one cylinder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CylinderIgnition {
    /// Ignition enable
    pub ignition: IgnitionState,
    /// Coil driver
    pub coil: CoilState,
    /// 1/10 ° before OT
    pub timing: i32,
    /// µs
    pub dwell_us: u32,
}

/// Result of the ignition pipeline for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnitionOutput {
    /// Indexed by physical cylinder number
    pub cylinders: [CylinderIgnition; CYLINDER_COUNT],
    /// Share of minimum timing in the blended advance (%)
    pub blend_percent: u32,
    /// Advance before any retard (1/10 °)
    pub blended_timing: i32,
    /// Retard from closing the pedal (1/10 °)
    pub tip_out_retard: i32,
}

/// Minimum-timing blend for the current mode, clamped to 0..=100 %.
pub fn blend_percent(cal: &CalibrationSet, mode: &OperatingMode) -> u32 {
    cal.min_ignition_allowed_mix
        .lookup(mode.performance.index(), mode.emergency.index())
        .clamp(0, 100) as u32
}

/// Blend `base` toward `minimum`: 0 % keeps `base`, 100 % gives `minimum`.
pub fn blend_timing(base: i32, minimum: i32, blend: u32) -> i32 {
    let delta = i128::from(base) - i128::from(minimum);
    let pulled = round_div(delta * i128::from(blend.min(100)), 100);
    (i128::from(base) - pulled) as i32
}

/// Retard for a closing pedal, bounded by the performance-mode cap.
pub fn tip_out_retard(cal: &CalibrationSet, snapshot: &StateSnapshot, mode: &OperatingMode) -> i32 {
    let closing = -i128::from(snapshot.driver.pedal_delta.min(0));
    let gain = i128::from(cal.scalars.tip_out_retard_gain);
    let raw = round_div(closing * gain, 100);
    let cap = cal
        .max_ignition_retard_compensation
        .lookup(mode.performance.index())
        .max(0);
    raw.min(i128::from(cap)) as i32
}

/// Compute ignition commands for all cylinders.
pub fn compute(cal: &CalibrationSet, snapshot: &StateSnapshot, mode: &OperatingMode) -> IgnitionOutput {
    let rpm = axis_input(snapshot.crank_speed);
    let pressure = axis_input(snapshot.intake_manifold_pressure);

    let base = cal
        .ignition_timing
        .select(snapshot.fuel_quality, snapshot.vtec)
        .lookup(rpm, pressure);
    let minimum = cal.min_ignition_timing.lookup(rpm, pressure);
    let blend = blend_percent(cal, mode);
    let blended = blend_timing(base, minimum, blend);

    let tip_out = tip_out_retard(cal, snapshot, mode);
    let max_retard = i64::from(cal.scalars.max_total_retard);
    let dwell = cal
        .ignition_spark_dwell
        .lookup(axis_input(snapshot.supply_voltage))
        .max(0) as u32;

    let mut cylinders = [CylinderIgnition::default(); CYLINDER_COUNT];
    for (cyl, out) in cylinders.iter_mut().enumerate() {
        let knock = i64::from(snapshot.bank(bank_of(cyl)).knock_retard);
        let retard = (knock + i64::from(tip_out)).min(max_retard);
        let timing = (i64::from(blended) - retard) as i32;

        if mode.running.cut_pattern(cyl).ignition {
            *out = CylinderIgnition {
                ignition: IgnitionState::On,
                coil: CoilState::On,
                timing,
                dwell_us: dwell,
            };
        } else {
            *out = CylinderIgnition {
                timing,
                ..CylinderIgnition::default()
            };
        }
    }

    IgnitionOutput {
        cylinders,
        blend_percent: blend,
        blended_timing: blended,
        tip_out_retard: tip_out,
    }
}
