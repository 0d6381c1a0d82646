//! Runtime configuration
//!
//! Thresholds and controller gains that are not part of the calibration
//! tables. Every field has a default, so a partial JSON file only needs to
//! name what it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::CYLINDER_COUNT;

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Operating-mode thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Crank speed that counts as cranking (rpm)
    pub cranking_rpm: u32,
    /// Crank speed at which the engine is considered started (rpm)
    pub start_rpm: u32,
    /// Below this a running engine has stalled (rpm)
    pub stall_rpm: u32,
    /// Pedal at or below this is closed (1/10 %)
    pub idle_pedal: u32,
    /// Above this with a closed pedal the engine is no longer idling (rpm)
    pub idle_exit_rpm: u32,
    /// Ignition cut on alternate cylinders above this (rpm)
    pub soft_limit_rpm: u32,
    /// Fuel cut on every cylinder above this (rpm)
    pub hard_limit_rpm: u32,
    /// Drop below a limit by this much before it releases (rpm)
    pub limiter_hysteresis_rpm: u32,
    /// Overrun fuel cut activates above this (rpm)
    pub decel_fuel_cut_rpm: u32,
    /// Fuel returns below this (rpm)
    pub decel_fuel_resume_rpm: u32,
    /// Ignition cut window while the upshift paddle is held (ms)
    pub shift_cut_ms: u32,
    /// Pedal that arms the launch limiter (1/10 %)
    pub launch_pedal: u32,
    /// Output shaft speed that ends a launch (rpm)
    pub launch_complete_shaft_rpm: u32,
    /// Output shaft speed below which the vehicle is stationary (rpm)
    pub stationary_shaft_rpm: u32,
    /// Stop the engine at a standstill with the brake held
    pub autostop_enabled: bool,
    /// Coolant temperature for a warm engine (1/10 °C)
    pub warm_coolant: i32,
    /// Knock level that counts as overload (1/10 %)
    pub knock_overload_level: u32,
    /// Coolant limit for POWER_LIFT_2 (1/10 °C)
    pub overheat_coolant: i32,
    /// Coolant limit for EMERGENCY (1/10 °C)
    pub critical_coolant: i32,
    /// Oil limit for POWER_LIFT_2 (1/10 °C)
    pub overheat_oil: i32,
    /// Exhaust gas limit for POWER_LIFT_2 (1/10 °C)
    pub overheat_exhaust: i32,
    /// Readings above this are implausible (rpm)
    pub max_plausible_rpm: u32,
    /// Time the demanded emergency tier must stay lower before stepping down (µs)
    pub deescalation_dwell_us: u64,
    /// Cycles a snapshot may be reused before sensor loss is declared
    pub max_stale_cycles: u32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            cranking_rpm: 150,
            start_rpm: 500,
            stall_rpm: 300,
            idle_pedal: 20,
            idle_exit_rpm: 1200,
            soft_limit_rpm: 8200,
            hard_limit_rpm: 8600,
            limiter_hysteresis_rpm: 150,
            decel_fuel_cut_rpm: 1600,
            decel_fuel_resume_rpm: 1200,
            shift_cut_ms: 80,
            launch_pedal: 500,
            launch_complete_shaft_rpm: 600,
            stationary_shaft_rpm: 10,
            autostop_enabled: false,
            warm_coolant: 700,
            knock_overload_level: 800,
            overheat_coolant: 1150,
            critical_coolant: 1250,
            overheat_oil: 1400,
            overheat_exhaust: 9800,
            max_plausible_rpm: 12000,
            deescalation_dwell_us: 2_000_000,
            max_stale_cycles: 5,
        }
    }
}

/// Fuel pipeline limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelConfig {
    /// Closed-loop correction bound (1/10 %)
    pub lambda_trim_limit: u32,
    /// Coolant temperature below which the loop stays open (1/10 °C)
    pub closed_loop_min_coolant: i32,
    /// Share of the 720 ° cycle an injector may be open (1/10 %)
    pub max_injector_duty: u32,
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self {
            lambda_trim_limit: 150,
            closed_loop_min_coolant: 600,
            max_injector_duty: 850,
        }
    }
}

/// Torque arbitration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorqueConfig {
    /// How long a held downshift paddle may raise the torque ceiling (ms)
    pub downshift_window_ms: u32,
}

impl Default for TorqueConfig {
    fn default() -> Self {
        Self {
            downshift_window_ms: 400,
        }
    }
}

/// Wastegate loop gains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    /// Proportional gain (1/1000 of 1/10 % per mbar)
    pub kp_permille: i32,
    /// Integral gain per cycle (1/1000 of 1/10 % per mbar)
    pub ki_permille: i32,
    /// Overshoot above the ceiling that opens the pop-off valve (mbar)
    pub popoff_margin_mbar: u32,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            kp_permille: 800,
            ki_permille: 50,
            popoff_margin_mbar: 150,
        }
    }
}

/// Actuation scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cylinders in firing order
    pub firing_order: [usize; CYLINDER_COUNT],
    /// Time an event must be queued ahead of its angle (µs)
    pub lead_time_us: u32,
    /// Events due within this share of the last cycle interval are handed
    /// out early (percent, at least 100)
    pub lookahead_percent: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            firing_order: [0, 3, 1, 4, 2, 5],
            lead_time_us: 200,
            lookahead_percent: 200,
        }
    }
}

/// Control cycle supervision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Time budget of one control cycle (µs)
    pub budget_us: u64,
    /// Consecutive overruns that count as sustained
    pub overrun_escalation_count: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            budget_us: 2000,
            overrun_escalation_count: 3,
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcuConfig {
    /// Operating-mode thresholds
    pub mode: ModeConfig,
    /// Fuel pipeline limits
    pub fuel: FuelConfig,
    /// Torque arbitration
    pub torque: TorqueConfig,
    /// Wastegate loop
    pub boost: BoostConfig,
    /// Actuation scheduler
    pub scheduler: SchedulerConfig,
    /// Cycle supervision
    pub cycle: CycleConfig,
}

impl EcuConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.mode;
        if m.cranking_rpm >= m.start_rpm {
            return Err(invalid("mode.cranking_rpm", "must be below start_rpm"));
        }
        if m.stall_rpm >= m.start_rpm {
            return Err(invalid("mode.stall_rpm", "must be below start_rpm"));
        }
        if m.soft_limit_rpm >= m.hard_limit_rpm {
            return Err(invalid("mode.soft_limit_rpm", "must be below hard_limit_rpm"));
        }
        if m.limiter_hysteresis_rpm >= m.soft_limit_rpm {
            return Err(invalid("mode.limiter_hysteresis_rpm", "must be below soft_limit_rpm"));
        }
        if m.decel_fuel_resume_rpm >= m.decel_fuel_cut_rpm {
            return Err(invalid(
                "mode.decel_fuel_resume_rpm",
                "must be below decel_fuel_cut_rpm",
            ));
        }
        if m.overheat_coolant >= m.critical_coolant {
            return Err(invalid("mode.overheat_coolant", "must be below critical_coolant"));
        }

        let mut seen = [false; CYLINDER_COUNT];
        for &cyl in &self.scheduler.firing_order {
            if cyl >= CYLINDER_COUNT || seen[cyl] {
                return Err(invalid(
                    "scheduler.firing_order",
                    format!("must name each of the {} cylinders once", CYLINDER_COUNT),
                ));
            }
            seen[cyl] = true;
        }

        if self.scheduler.lookahead_percent < 100 {
            return Err(invalid(
                "scheduler.lookahead_percent",
                "must cover at least one cycle interval",
            ));
        }

        if self.fuel.max_injector_duty == 0 || self.fuel.max_injector_duty > 1000 {
            return Err(invalid("fuel.max_injector_duty", "must be in 1..=1000"));
        }
        if self.cycle.budget_us == 0 {
            return Err(invalid("cycle.budget_us", "must be non-zero"));
        }
        if self.cycle.overrun_escalation_count == 0 {
            return Err(invalid("cycle.overrun_escalation_count", "must be non-zero"));
        }
        Ok(())
    }
}
