//! Fuel pipeline
//!
//! Speed-density fueling: air mass from manifold pressure, temperature and
//! volumetric efficiency, fuel mass from the target lambda, injector open
//! time from the injector flow at the measured rail pressure plus the
//! voltage-dependent dead time.

use serde::{Deserialize, Serialize};

use crate::actuation::{FuelState, InjectorState};
use crate::calibration::{axis_input, round_div, CalibrationScalars, CalibrationSet};
use crate::config::FuelConfig;
use crate::mode::{OperatingMode, RunningState};
use crate::snapshot::{bank_of, Bank, StateSnapshot, VtecState};
use crate::{BANK_COUNT, CYLINDER_COUNT};

/// Specific gas constant of air (mJ/(kg·K))
const GAS_CONSTANT_AIR: u128 = 287_050;

/// 0 °C in 1/10 K
const ZERO_CELSIUS_DK: i64 = 2732;

/// Fuel command for one cylinder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CylinderFuel {
    /// Fuel enable
    pub fuel: FuelState,
    /// Injector valve
    pub injector: InjectorState,
    /// µs
    pub injector_duration_us: u32,
    /// ° before OT
    pub injection_angle: i32,
}

/// Intermediate values of one bank, kept for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankFuel {
    /// Air per cylinder per cycle (µg)
    pub air_mass_ug: u64,
    /// Fuel per cylinder per cycle after trim (µg)
    pub fuel_mass_ug: u64,
    /// Closed-loop correction (1/10 %)
    pub lambda_trim: i32,
    /// Injector open time without dead time (µs)
    pub on_time_us: u32,
}

/// Result of the fuel pipeline for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuelOutput {
    /// Indexed by physical cylinder number
    pub cylinders: [CylinderFuel; CYLINDER_COUNT],
    /// Per-bank intermediates
    pub banks: [BankFuel; BANK_COUNT],
    /// 1/100
    pub target_lambda: u32,
    /// µs
    pub dead_time_us: u32,
}

/// Air mass trapped in one cylinder (µg).
///
/// `displacement` in 1/10 cm³, `pressure` in mbar, `ve` in 1/10 %,
/// `temperature` in 1/10 °C.
pub fn air_mass_ug(displacement: u32, pressure: u32, ve: u32, temperature: i32) -> u64 {
    let kelvin = (i64::from(temperature) + ZERO_CELSIUS_DK).max(1) as u128;
    let numerator = u128::from(displacement) * u128::from(pressure) * u128::from(ve) * 100_000;
    (numerator / (GAS_CONSTANT_AIR * kelvin)) as u64
}

/// Fuel for `air_ug` of air at `lambda` (1/100) with stoichiometric AFR
/// `stoich_afr` (1/10).
pub fn fuel_mass_ug(air_ug: u64, stoich_afr: u32, lambda: u32) -> u64 {
    let afr_milli = u128::from(stoich_afr) * u128::from(lambda.max(1));
    (u128::from(air_ug) * 1000 / afr_milli.max(1)) as u64
}

/// Injector open time for `fuel_ug` at rail pressure `rail_mbar` (µs). Flow
/// scales linearly with rail pressure; a zero reading uses the reference.
pub fn on_time_us(fuel_ug: u64, scalars: &CalibrationScalars, rail_mbar: u32) -> u32 {
    let rail = if rail_mbar == 0 {
        scalars.injector_reference_pressure
    } else {
        rail_mbar
    };
    let numerator = u128::from(fuel_ug) * 60_000_000 * u128::from(scalars.injector_reference_pressure);
    let flow = u128::from(scalars.injector_size) * u128::from(scalars.fuel_density) * u128::from(rail);
    u32::try_from(numerator / flow.max(1)).unwrap_or(u32::MAX)
}

/// Longest injection the duty limit allows at `rpm` (µs).
pub fn max_duration_us(rpm: u32, max_duty: u32) -> Option<u32> {
    if rpm == 0 {
        return None;
    }
    // 720 ° take 120e6 / rpm µs; duty is in 1/10 %
    let cycle_us = 120_000_000 / u64::from(rpm);
    Some((cycle_us * u64::from(max_duty) / 1000) as u32)
}

/// Total injector duration: open time plus dead time, capped by the duty limit.
pub fn injector_duration_us(on_time_us: u32, dead_time_us: u32, cap: Option<u32>) -> u32 {
    let total = on_time_us.saturating_add(dead_time_us);
    cap.map_or(total, |cap| total.min(cap))
}

/// Closed-loop correction for one bank (1/10 %): positive adds fuel.
pub fn lambda_trim(measured: u32, target: u32, limit: u32) -> i32 {
    if measured == 0 || target == 0 {
        return 0;
    }
    let error = (i128::from(measured) - i128::from(target)) * 1000;
    let trim = round_div(error, i128::from(target));
    let limit = i128::from(limit);
    trim.clamp(-limit, limit) as i32
}

fn closed_loop_active(snapshot: &StateSnapshot, running: RunningState, config: &FuelConfig) -> bool {
    matches!(
        running,
        RunningState::RunningNormal | RunningState::RunningIdleFree | RunningState::RunningIdleDriving
    ) && snapshot.coolant_out_temp >= config.closed_loop_min_coolant
}

/// Compute fuel commands for all cylinders.
pub fn compute(
    cal: &CalibrationSet,
    snapshot: &StateSnapshot,
    mode: &OperatingMode,
    config: &FuelConfig,
) -> FuelOutput {
    let rpm = axis_input(snapshot.crank_speed);
    let pressure = axis_input(snapshot.intake_manifold_pressure);
    let coolant = snapshot.coolant_out_temp;
    let scalars = &cal.scalars;

    let target_lambda = cal.fuel_af_ratio.lookup(rpm, pressure, coolant).max(1) as u32;
    let ve_table = match snapshot.vtec {
        VtecState::Off => &cal.fuel_ve_no_vtec,
        VtecState::On => &cal.fuel_ve_vtec,
    };
    let dead_time = cal
        .fuel_injector_dead_times
        .lookup(axis_input(snapshot.supply_voltage))
        .max(0) as u32;
    let angle = cal.fuel_injector_timing.lookup(rpm, coolant);
    let cap = max_duration_us(snapshot.crank_speed, config.max_injector_duty);
    let closed_loop = closed_loop_active(snapshot, mode.running, config);

    let mut banks = [BankFuel::default(); BANK_COUNT];
    for bank in Bank::ALL {
        let inputs = snapshot.bank(bank);
        let ve = ve_table.lookup(rpm, axis_input(inputs.throttle)).max(0) as u32;
        let air = air_mass_ug(
            scalars.cylinder_displacement,
            snapshot.intake_manifold_pressure,
            ve,
            snapshot.intake_manifold_temp,
        );
        let base_fuel = fuel_mass_ug(air, scalars.stoich_afr, target_lambda);

        let trim = if closed_loop {
            lambda_trim(inputs.lambda, target_lambda, config.lambda_trim_limit)
        } else {
            0
        };
        let fuel = (i128::from(base_fuel) * (1000 + i128::from(trim)) / 1000).max(0) as u64;

        banks[bank.index()] = BankFuel {
            air_mass_ug: air,
            fuel_mass_ug: fuel,
            lambda_trim: trim,
            on_time_us: on_time_us(fuel, scalars, snapshot.fuel_rail_pressure),
        };
    }

    let mut cylinders = [CylinderFuel::default(); CYLINDER_COUNT];
    for (cyl, out) in cylinders.iter_mut().enumerate() {
        let bank = &banks[bank_of(cyl).index()];
        *out = if mode.running.cut_pattern(cyl).fuel {
            CylinderFuel {
                fuel: FuelState::On,
                injector: InjectorState::Open,
                injector_duration_us: injector_duration_us(bank.on_time_us, dead_time, cap),
                injection_angle: angle,
            }
        } else {
            CylinderFuel {
                injection_angle: angle,
                ..CylinderFuel::default()
            }
        };
    }

    FuelOutput {
        cylinders,
        banks,
        target_lambda,
        dead_time_us: dead_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_air_mass_at_ambient() {
        // 583 cc at 1000 mbar, 27 °C, full VE: roughly 0.677 g
        let air = air_mass_ug(5830, 1000, 1000, 270);
        assert!((676_000..678_000).contains(&air), "air = {}", air);
    }

    #[test]
    fn test_fuel_mass_stoichiometric() {
        assert_eq!(fuel_mass_ug(147_000, 147, 100), 10_000);
        // richer mixture needs more fuel
        assert!(fuel_mass_ug(147_000, 147, 85) > 10_000);
    }

    #[test]
    fn test_on_time_scales_with_rail_pressure() {
        let scalars = CalibrationScalars {
            injector_size: 600,
            injector_reference_pressure: 3000,
            cylinder_displacement: 5830,
            max_total_retard: 150,
            tip_out_retard_gain: 10,
            fuel_density: 750_000,
            stoich_afr: 147,
        };
        // 600 cc/min * 750 mg/cc = 7.5 µg/µs
        assert_eq!(on_time_us(15_000, &scalars, 3000), 2000);
        assert_eq!(on_time_us(15_000, &scalars, 0), 2000);
        assert_eq!(on_time_us(15_000, &scalars, 6000), 1000);
    }

    #[test]
    fn test_duration_is_on_time_plus_dead_time() {
        assert_eq!(injector_duration_us(2000, 1200, None), 3200);
        assert_eq!(injector_duration_us(2000, 1200, Some(3000)), 3000);
    }

    #[test]
    fn test_duty_cap() {
        // 6000 rpm: 20 ms per cycle, 85 % duty
        assert_eq!(max_duration_us(6000, 850), Some(17_000));
        assert_eq!(max_duration_us(0, 850), None);
    }

    #[test]
    fn test_lambda_trim_bounded() {
        assert_eq!(lambda_trim(110, 100, 150), 100);
        assert_eq!(lambda_trim(90, 100, 50), -50);
        assert_eq!(lambda_trim(0, 100, 150), 0);
    }
}
