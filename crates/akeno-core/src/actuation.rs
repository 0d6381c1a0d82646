//! Actuator command types
//!
//! Everything the control cycle hands to the actuator drivers. Each on/off
//! concept has its own enum so a fuel flag can never be passed where a coil
//! state is expected.

use serde::{Deserialize, Serialize};

use crate::{BANK_COUNT, CYLINDER_COUNT};

/// Whether a cylinder is fuelled this cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuelState {
    /// No fuel
    #[default]
    Off,
    /// Fuel delivered
    On,
}

/// Injector valve position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectorState {
    /// Valve shut
    #[default]
    Closed,
    /// Valve open for the commanded duration
    Open,
}

/// Whether a cylinder fires this cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnitionState {
    /// No spark
    #[default]
    Off,
    /// Spark at the commanded timing
    On,
}

/// Coil charging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoilState {
    /// Coil idle
    #[default]
    Off,
    /// Coil charged for the commanded dwell
    On,
}

/// Commands for one cylinder. The default is fully off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CylinderCommand {
    /// Fuel enable
    pub fuel: FuelState,
    /// Injector valve
    pub injector: InjectorState,
    /// Injector open time including dead time (µs)
    pub injector_duration_us: u32,
    /// Start of injection (° before OT)
    pub injection_angle: i32,
    /// Ignition enable
    pub ignition: IgnitionState,
    /// Coil driver
    pub coil: CoilState,
    /// Spark advance (1/10 ° before OT)
    pub timing: i32,
    /// Coil charge time (µs)
    pub dwell_us: u32,
}

impl CylinderCommand {
    /// Neither fuel nor spark
    pub fn is_off(&self) -> bool {
        self.fuel == FuelState::Off
            && self.injector == InjectorState::Closed
            && self.ignition == IgnitionState::Off
            && self.coil == CoilState::Off
    }
}

/// Complete actuator output of one control cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorCommands {
    /// Indexed by physical cylinder number
    pub cylinders: [CylinderCommand; CYLINDER_COUNT],
    /// Wastegate opening per bank (1/10 %, 0 closed, 1000 open)
    pub wastegate: [u32; BANK_COUNT],
    /// Pop-off valve per bank (1/10 %)
    pub popoff: [u32; BANK_COUNT],
    /// Throttle body target per bank (1/10 %)
    pub throttle: [u32; BANK_COUNT],
    /// Intake manifold pressure target (mbar)
    pub intake_pressure: u32,
    /// Engine torque request (1/10 Nm)
    pub torque: i32,
    /// Drag torque may be requested from the engine
    pub engine_brake_allowed: bool,
    /// %
    pub coolant_pump_duty: u32,
    /// %
    pub intercooler_pump_duty: u32,
}

impl ActuatorCommands {
    /// Safe output: every cylinder off, wastegates open, throttles closed.
    pub fn shutdown() -> Self {
        Self {
            wastegate: [1000; BANK_COUNT],
            ..Self::default()
        }
    }
}

/// Receiver of the cycle's actuator output
pub trait ActuatorSink {
    /// Drive the outputs
    fn apply(&mut self, commands: &ActuatorCommands);
}

impl ActuatorSink for Vec<ActuatorCommands> {
    fn apply(&mut self, commands: &ActuatorCommands) {
        self.push(*commands);
    }
}
