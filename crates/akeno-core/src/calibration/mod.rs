//! Calibration Data
//!
//! Typed, validated calibration tables and scalars for the powertrain
//! pipelines, the loaders for structured and binary blobs, and the store
//! that hands one consistent set to every control cycle.

mod error;
mod image;
mod store;
mod table;

pub use error::CalibrationError;
pub use image::{IMAGE_MAGIC, IMAGE_VERSION};
pub use store::CalibrationStore;
pub use table::{Axis, RawTable, Table1D, Table2D, Table3D, FRACTION_BITS};

pub(crate) use table::round_div;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::mode::{EmergencyState, PerformanceState};
use crate::snapshot::{FuelQuality, VtecState};

/// Sensor reading as a table query. Readings beyond `i32::MAX` clamp like
/// any other out-of-range query.
pub(crate) fn axis_input(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Names of every table in a calibration set, in image order.
pub const TABLE_NAMES: [&str; 21] = [
    "ignition_spark_dwell",
    "ignition_timing_102_no_vtec",
    "ignition_timing_102_vtec",
    "ignition_timing_95_no_vtec",
    "ignition_timing_95_vtec",
    "min_ignition_timing",
    "min_ignition_allowed_mix",
    "min_ignition_power_loss",
    "turbo_max_boost",
    "fuel_injector_dead_times",
    "fuel_injector_timing",
    "fuel_af_ratio",
    "fuel_ve_no_vtec",
    "fuel_ve_vtec",
    "torque_map",
    "driver_torque_demand",
    "driver_torque_demand_delta_factor",
    "max_ignition_retard_compensation",
    "max_downshift_torque_request",
    "coolant_pump_duty",
    "intercooler_pump_duty",
];

/// Scalar calibration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationScalars {
    /// Injector flow at the reference rail pressure (cc/min)
    pub injector_size: u32,
    /// Rail pressure at which `injector_size` was measured (mbar)
    pub injector_reference_pressure: u32,
    /// Displacement of one cylinder (1/10 cm³)
    pub cylinder_displacement: u32,
    /// Upper bound of knock plus tip-out retard (1/10 °)
    pub max_total_retard: u32,
    /// Tip-out retard per unit of negative pedal delta (%)
    pub tip_out_retard_gain: u32,
    /// Fuel density (µg/cc)
    pub fuel_density: u32,
    /// Stoichiometric air-fuel ratio (1/10)
    pub stoich_afr: u32,
}

impl CalibrationScalars {
    /// Number of scalars in the binary image
    pub const COUNT: usize = 7;

    pub(crate) fn to_array(self) -> [u32; Self::COUNT] {
        [
            self.injector_size,
            self.injector_reference_pressure,
            self.cylinder_displacement,
            self.max_total_retard,
            self.tip_out_retard_gain,
            self.fuel_density,
            self.stoich_afr,
        ]
    }

    pub(crate) fn from_array(v: [u32; Self::COUNT]) -> Self {
        Self {
            injector_size: v[0],
            injector_reference_pressure: v[1],
            cylinder_displacement: v[2],
            max_total_retard: v[3],
            tip_out_retard_gain: v[4],
            fuel_density: v[5],
            stoich_afr: v[6],
        }
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        let required = [
            ("injector_size", self.injector_size),
            ("injector_reference_pressure", self.injector_reference_pressure),
            ("cylinder_displacement", self.cylinder_displacement),
            ("fuel_density", self.fuel_density),
            ("stoich_afr", self.stoich_afr),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(CalibrationError::ZeroScalar(name));
            }
        }
        Ok(())
    }
}

/// The four base ignition maps, selected by fuel quality and VTEC state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnitionTimingTables {
    /// 102 RON, VTEC disengaged
    pub octane_102_no_vtec: Table2D,
    /// 102 RON, VTEC engaged
    pub octane_102_vtec: Table2D,
    /// 95 RON, VTEC disengaged
    pub octane_95_no_vtec: Table2D,
    /// 95 RON, VTEC engaged
    pub octane_95_vtec: Table2D,
}

impl IgnitionTimingTables {
    /// Table matching the current fuel and valve train state
    pub fn select(&self, fuel: FuelQuality, vtec: VtecState) -> &Table2D {
        match (fuel, vtec) {
            (FuelQuality::Octane102, VtecState::Off) => &self.octane_102_no_vtec,
            (FuelQuality::Octane102, VtecState::On) => &self.octane_102_vtec,
            (FuelQuality::Octane95, VtecState::Off) => &self.octane_95_no_vtec,
            (FuelQuality::Octane95, VtecState::On) => &self.octane_95_vtec,
        }
    }
}

/// A complete calibration. Units are listed per table; see `TABLE_NAMES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationSet {
    /// supply voltage (mV) -> dwell (µs)
    pub ignition_spark_dwell: Table1D,
    /// speed (rpm), intake pressure (mbar) -> timing (1/10 ° before OT)
    pub ignition_timing: IgnitionTimingTables,
    /// speed (rpm), intake pressure (mbar) -> timing (1/10 ° before OT)
    pub min_ignition_timing: Table2D,
    /// performance state, emergency state -> blend (%)
    pub min_ignition_allowed_mix: Table2D,
    /// speed (rpm), intake pressure (mbar) -> torque ratio at minimum timing (%)
    pub min_ignition_power_loss: Table2D,
    /// speed (rpm), emergency state -> max manifold pressure (mbar)
    pub turbo_max_boost: Table2D,
    /// supply voltage (mV) -> dead time (µs)
    pub fuel_injector_dead_times: Table1D,
    /// speed (rpm), coolant temperature (1/10 °C) -> injection angle (° before OT)
    pub fuel_injector_timing: Table2D,
    /// speed (rpm), intake pressure (mbar), coolant temperature (1/10 °C) -> lambda (1/100)
    pub fuel_af_ratio: Table3D,
    /// speed (rpm), throttle (1/10 %) -> volumetric efficiency (1/10 %)
    pub fuel_ve_no_vtec: Table2D,
    /// speed (rpm), throttle (1/10 %) -> volumetric efficiency (1/10 %)
    pub fuel_ve_vtec: Table2D,
    /// speed (rpm), intake pressure (mbar) -> torque (Nm)
    pub torque_map: Table2D,
    /// speed (rpm), pedal (1/10 %), performance state -> torque (Nm)
    pub driver_torque_demand: Table3D,
    /// speed (rpm), pedal delta (1/10 % per 200 ms), performance state -> factor (1/10 %)
    pub driver_torque_demand_delta_factor: Table3D,
    /// performance state -> max tip-out retard (1/10 °)
    pub max_ignition_retard_compensation: Table1D,
    /// performance state, speed (rpm) -> downshift torque allowance (Nm)
    pub max_downshift_torque_request: Table2D,
    /// coolant outlet temperature (1/10 °C) -> pump duty (%)
    pub coolant_pump_duty: Table1D,
    /// intercooler water temperature (1/10 °C) -> pump duty (%)
    pub intercooler_pump_duty: Table1D,
    /// Scalar parameters
    pub scalars: CalibrationScalars,
}

const PERFORMANCE_STATES: usize = PerformanceState::COUNT;
const EMERGENCY_STATES: usize = EmergencyState::COUNT;

fn require_states(
    name: &str,
    axis: &Axis,
    state: &'static str,
    count: usize,
) -> Result<(), CalibrationError> {
    if axis.is_enumerated(count) {
        Ok(())
    } else {
        Err(CalibrationError::StateAxis {
            name: name.to_string(),
            state,
            max: count - 1,
        })
    }
}

impl CalibrationSet {
    /// Check the cross-table invariants: state-indexed axes cover exactly the
    /// defined states and required scalars are non-zero.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let perf = "performance";
        let emergency = "emergency";

        require_states(
            "min_ignition_allowed_mix",
            self.min_ignition_allowed_mix.x_axis(),
            perf,
            PERFORMANCE_STATES,
        )?;
        require_states(
            "min_ignition_allowed_mix",
            self.min_ignition_allowed_mix.y_axis(),
            emergency,
            EMERGENCY_STATES,
        )?;
        require_states(
            "turbo_max_boost",
            self.turbo_max_boost.y_axis(),
            emergency,
            EMERGENCY_STATES,
        )?;
        require_states(
            "driver_torque_demand",
            self.driver_torque_demand.z_axis(),
            perf,
            PERFORMANCE_STATES,
        )?;
        require_states(
            "driver_torque_demand_delta_factor",
            self.driver_torque_demand_delta_factor.z_axis(),
            perf,
            PERFORMANCE_STATES,
        )?;
        require_states(
            "max_ignition_retard_compensation",
            self.max_ignition_retard_compensation.x_axis(),
            perf,
            PERFORMANCE_STATES,
        )?;
        require_states(
            "max_downshift_torque_request",
            self.max_downshift_torque_request.x_axis(),
            perf,
            PERFORMANCE_STATES,
        )?;

        self.scalars.validate()
    }

    /// Built-in minimal-performance calibration.
    ///
    /// Used when the stored calibration is rejected at boot: conservative
    /// timing, no boost above atmospheric, rich mixture and a low torque
    /// ceiling.
    pub fn fallback() -> Self {
        let rpm = Axis::linear(1000, 1000, 7);
        let pressure = Axis::linear(200, 400, 5);
        let voltage = Axis::linear(8000, 2000, 5);
        let coolant = Axis::linear(-200, 400, 4);
        let percent = Axis::linear(0, 250, 5);
        let perf = Axis::enumerated(PERFORMANCE_STATES);
        let emergency = Axis::enumerated(EMERGENCY_STATES);

        let timing = Table2D::from_fn(rpm.clone(), pressure.clone(), |n, p| 50 + n / 100 - p / 40);

        Self {
            ignition_spark_dwell: Table1D::from_fn(voltage.clone(), |mv| 4500 - (mv - 8000) / 4),
            ignition_timing: IgnitionTimingTables {
                octane_102_no_vtec: timing.clone(),
                octane_102_vtec: timing.clone(),
                octane_95_no_vtec: timing.clone(),
                octane_95_vtec: timing,
            },
            min_ignition_timing: Table2D::from_fn(rpm.clone(), pressure.clone(), |_, _| 0),
            min_ignition_allowed_mix: Table2D::from_fn(perf.clone(), emergency.clone(), |_, e| {
                [0, 25, 50, 100][e.clamp(0, 3) as usize]
            }),
            min_ignition_power_loss: Table2D::from_fn(rpm.clone(), pressure.clone(), |_, _| 85),
            turbo_max_boost: Table2D::from_fn(rpm.clone(), emergency, |_, _| 1000),
            fuel_injector_dead_times: Table1D::from_fn(voltage, |mv| match mv {
                8000 => 1600,
                10000 => 1300,
                12000 => 1000,
                14000 => 850,
                _ => 700,
            }),
            fuel_injector_timing: Table2D::from_fn(rpm.clone(), coolant.clone(), |_, _| 300),
            fuel_af_ratio: Table3D::from_fn(rpm.clone(), pressure.clone(), coolant, |_, _, t| {
                if t < 0 {
                    75
                } else {
                    85
                }
            }),
            fuel_ve_no_vtec: Table2D::from_fn(rpm.clone(), percent.clone(), |_, tps| 300 + tps / 2),
            fuel_ve_vtec: Table2D::from_fn(rpm.clone(), percent.clone(), |_, tps| 300 + tps / 2),
            torque_map: Table2D::from_fn(rpm.clone(), pressure, |_, p| p / 4),
            driver_torque_demand: Table3D::from_fn(rpm.clone(), percent, perf.clone(), |_, pedal, _| {
                pedal * 300 / 1000
            }),
            driver_torque_demand_delta_factor: Table3D::from_fn(
                rpm.clone(),
                Axis::linear(-500, 250, 5),
                perf.clone(),
                |_, _, _| 1000,
            ),
            max_ignition_retard_compensation: Table1D::from_fn(perf.clone(), |_| 30),
            max_downshift_torque_request: Table2D::from_fn(perf, rpm, |_, _| 0),
            // 60/90/120 °C
            coolant_pump_duty: Table1D::from_fn(Axis::linear(600, 300, 3), |t| match t {
                600 => 30,
                900 => 60,
                _ => 100,
            }),
            // 20/40/60 °C
            intercooler_pump_duty: Table1D::from_fn(Axis::linear(200, 200, 3), |t| match t {
                200 => 20,
                400 => 60,
                _ => 100,
            }),
            scalars: CalibrationScalars {
                injector_size: 440,
                injector_reference_pressure: 3000,
                cylinder_displacement: 5830,
                max_total_retard: 150,
                tip_out_retard_gain: 10,
                fuel_density: 745_000,
                stoich_afr: 147,
            },
        }
    }

    /// Build a set from a structured document, validating every table.
    pub fn from_document(doc: CalibrationDocument) -> Result<Self, CalibrationError> {
        let CalibrationDocument { mut tables, scalars } = doc;

        if let Some(unknown) = tables.keys().find(|k| !TABLE_NAMES.contains(&k.as_str())) {
            return Err(CalibrationError::UnknownTable(unknown.clone()));
        }

        let mut take = |name: &str| -> Result<RawTable, CalibrationError> {
            tables
                .remove(name)
                .ok_or_else(|| CalibrationError::MissingTable(name.to_string()))
        };

        fn build<T: TryFrom<RawTable, Error = CalibrationError>>(
            name: &str,
            raw: RawTable,
        ) -> Result<T, CalibrationError> {
            T::try_from(raw).map_err(|e| e.in_table(name))
        }

        macro_rules! table {
            ($name:literal) => {
                build($name, take($name)?)?
            };
        }

        let set = Self {
            ignition_spark_dwell: table!("ignition_spark_dwell"),
            ignition_timing: IgnitionTimingTables {
                octane_102_no_vtec: table!("ignition_timing_102_no_vtec"),
                octane_102_vtec: table!("ignition_timing_102_vtec"),
                octane_95_no_vtec: table!("ignition_timing_95_no_vtec"),
                octane_95_vtec: table!("ignition_timing_95_vtec"),
            },
            min_ignition_timing: table!("min_ignition_timing"),
            min_ignition_allowed_mix: table!("min_ignition_allowed_mix"),
            min_ignition_power_loss: table!("min_ignition_power_loss"),
            turbo_max_boost: table!("turbo_max_boost"),
            fuel_injector_dead_times: table!("fuel_injector_dead_times"),
            fuel_injector_timing: table!("fuel_injector_timing"),
            fuel_af_ratio: table!("fuel_af_ratio"),
            fuel_ve_no_vtec: table!("fuel_ve_no_vtec"),
            fuel_ve_vtec: table!("fuel_ve_vtec"),
            torque_map: table!("torque_map"),
            driver_torque_demand: table!("driver_torque_demand"),
            driver_torque_demand_delta_factor: table!("driver_torque_demand_delta_factor"),
            max_ignition_retard_compensation: table!("max_ignition_retard_compensation"),
            max_downshift_torque_request: table!("max_downshift_torque_request"),
            coolant_pump_duty: table!("coolant_pump_duty"),
            intercooler_pump_duty: table!("intercooler_pump_duty"),
            scalars,
        };

        set.validate()?;
        Ok(set)
    }

    /// Parse and validate a JSON calibration document.
    pub fn from_json_str(json: &str) -> Result<Self, CalibrationError> {
        let doc: CalibrationDocument = serde_json::from_str(json)?;
        Self::from_document(doc)
    }

    /// Load a calibration from a file: `.json` documents or binary images.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&std::fs::read_to_string(path)?),
            _ => Self::from_document(CalibrationDocument::from_image(&std::fs::read(path)?)?),
        }
    }

    /// Convert back into the structured wire form.
    pub fn to_document(&self) -> CalibrationDocument {
        let mut tables = BTreeMap::new();
        let mut put = |name: &str, raw: RawTable| {
            tables.insert(name.to_string(), raw);
        };

        put("ignition_spark_dwell", (&self.ignition_spark_dwell).into());
        put("ignition_timing_102_no_vtec", (&self.ignition_timing.octane_102_no_vtec).into());
        put("ignition_timing_102_vtec", (&self.ignition_timing.octane_102_vtec).into());
        put("ignition_timing_95_no_vtec", (&self.ignition_timing.octane_95_no_vtec).into());
        put("ignition_timing_95_vtec", (&self.ignition_timing.octane_95_vtec).into());
        put("min_ignition_timing", (&self.min_ignition_timing).into());
        put("min_ignition_allowed_mix", (&self.min_ignition_allowed_mix).into());
        put("min_ignition_power_loss", (&self.min_ignition_power_loss).into());
        put("turbo_max_boost", (&self.turbo_max_boost).into());
        put("fuel_injector_dead_times", (&self.fuel_injector_dead_times).into());
        put("fuel_injector_timing", (&self.fuel_injector_timing).into());
        put("fuel_af_ratio", (&self.fuel_af_ratio).into());
        put("fuel_ve_no_vtec", (&self.fuel_ve_no_vtec).into());
        put("fuel_ve_vtec", (&self.fuel_ve_vtec).into());
        put("torque_map", (&self.torque_map).into());
        put("driver_torque_demand", (&self.driver_torque_demand).into());
        put(
            "driver_torque_demand_delta_factor",
            (&self.driver_torque_demand_delta_factor).into(),
        );
        put(
            "max_ignition_retard_compensation",
            (&self.max_ignition_retard_compensation).into(),
        );
        put("max_downshift_torque_request", (&self.max_downshift_torque_request).into());
        put("coolant_pump_duty", (&self.coolant_pump_duty).into());
        put("intercooler_pump_duty", (&self.intercooler_pump_duty).into());

        CalibrationDocument {
            tables,
            scalars: self.scalars,
        }
    }
}

/// Structured calibration blob: named raw tables plus scalars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationDocument {
    /// Tables keyed by name (see `TABLE_NAMES`)
    pub tables: BTreeMap<String, RawTable>,
    /// Scalar parameters
    pub scalars: CalibrationScalars,
}
