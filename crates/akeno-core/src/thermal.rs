//! Coolant and intercooler pump control

use crate::calibration::CalibrationSet;
use crate::mode::{EmergencyState, OperatingMode};
use crate::snapshot::StateSnapshot;

/// Pump duty cycles (%)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpDuty {
    /// Engine coolant pump
    pub coolant: u32,
    /// Charge-air cooler water pump
    pub intercooler: u32,
}

/// Pump duties for this cycle. Both pumps run flat out in EMERGENCY.
pub fn compute(cal: &CalibrationSet, snapshot: &StateSnapshot, mode: &OperatingMode) -> PumpDuty {
    if mode.emergency == EmergencyState::Emergency {
        return PumpDuty {
            coolant: 100,
            intercooler: 100,
        };
    }

    let duty = |value: i32| value.clamp(0, 100) as u32;
    PumpDuty {
        coolant: duty(cal.coolant_pump_duty.lookup(snapshot.coolant_out_temp)),
        intercooler: duty(cal.intercooler_pump_duty.lookup(snapshot.intercooler_water_in_temp)),
    }
}
