//! Turbo boost control
//!
//! One PI loop per bank drives the wastegate toward the boost target. The
//! pop-off valve is a separate overpressure guard that does not depend on
//! the loop state.

use crate::calibration::{axis_input, CalibrationSet};
use crate::config::BoostConfig;
use crate::mode::OperatingMode;
use crate::snapshot::{Bank, StateSnapshot};
use crate::BANK_COUNT;

/// Fully open actuator (1/10 %)
pub const FULLY_OPEN: u32 = 1000;

/// Integrator bound, in the loop's internal 1/1000 scale
const INTEGRAL_MAX: i64 = FULLY_OPEN as i64 * 1000;

/// Result of the boost controller for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoostOutput {
    /// Wastegate opening per bank (1/10 %, 0 closed)
    pub wastegate: [u32; BANK_COUNT],
    /// Pop-off valve per bank (1/10 %)
    pub popoff: [u32; BANK_COUNT],
    /// Boost target per bank (mbar)
    pub target: [u32; BANK_COUNT],
    /// Maximum boost for speed and emergency tier (mbar)
    pub ceiling: u32,
}

/// Per-bank wastegate loops. Integrator state survives between cycles.
#[derive(Debug, Clone, Default)]
pub struct BoostController {
    integral: [i64; BANK_COUNT],
}

impl BoostController {
    /// Controller with both integrators at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear both integrators.
    pub fn reset(&mut self) {
        self.integral = [0; BANK_COUNT];
    }

    /// Run both loops for one cycle. `pressure_cmd` is the intake pressure
    /// requested by torque arbitration (mbar).
    pub fn update(
        &mut self,
        cal: &CalibrationSet,
        snapshot: &StateSnapshot,
        mode: &OperatingMode,
        pressure_cmd: u32,
        config: &BoostConfig,
    ) -> BoostOutput {
        let rpm = axis_input(snapshot.crank_speed);
        let ceiling = cal
            .turbo_max_boost
            .lookup(rpm, mode.emergency.index())
            .max(0) as u32;
        let target = pressure_cmd.min(ceiling);
        let popoff_threshold = ceiling.saturating_add(config.popoff_margin_mbar);

        let mut out = BoostOutput {
            ceiling,
            ..BoostOutput::default()
        };

        if !mode.running.is_running() {
            self.reset();
        }

        for bank in Bank::ALL {
            let i = bank.index();
            let measured = snapshot.bank(bank).boost_pressure;

            out.target[i] = target;
            out.popoff[i] = if measured > popoff_threshold { FULLY_OPEN } else { 0 };
            out.wastegate[i] = if mode.running.is_running() {
                self.step(i, i64::from(measured) - i64::from(target), config)
            } else {
                FULLY_OPEN
            };
        }

        out
    }

    /// One PI step on `error = measured - target`; positive error opens.
    fn step(&mut self, bank: usize, error: i64, config: &BoostConfig) -> u32 {
        let p = i64::from(config.kp_permille) * error;
        let candidate = (self.integral[bank] + i64::from(config.ki_permille) * error).clamp(0, INTEGRAL_MAX);

        let unclamped = (p + candidate) / 1000;
        let saturated_high = unclamped > i64::from(FULLY_OPEN) && error > 0;
        let saturated_low = unclamped < 0 && error < 0;
        if !(saturated_high || saturated_low) {
            self.integral[bank] = candidate;
        }

        ((p + self.integral[bank]) / 1000).clamp(0, i64::from(FULLY_OPEN)) as u32
    }
}
