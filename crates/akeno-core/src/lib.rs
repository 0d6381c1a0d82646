//! # Akeno Core Library
//!
//! Control core of a six-cylinder, twin-turbo engine with a VTEC valve train.
//!

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Calibration tables with clamped linear interpolation (1D/2D/3D)
//! - Calibration loading from JSON documents and CRC-checked binary images
//! - The operating-mode state machine (running, emergency, performance)
//! - Ignition, fuel, torque, boost and thermal pipelines
//! - A crank-angle actuation scheduler
//! - Fault counters and diagnostic events
//!
//! ## Layout
//!
//! Cylinders are numbered 0..=5. Cylinders 0..=2 form the left bank,
//! 3..=5 the right bank; each bank has its own turbocharger.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use akeno_core::prelude::*;
//!
//! let diagnostics = Arc::new(Diagnostics::new());
//! let store = Arc::new(CalibrationStore::boot(
//!     CalibrationSet::from_file("calibration.json"),
//!     &diagnostics,
//! ));
//! let exchange = Arc::new(SnapshotExchange::new());
//! let mut ecu = ControlUnit::new(EcuConfig::default(), store, exchange.clone(), diagnostics);
//!
//! exchange.publish(StateSnapshot::default());
//! let report = ecu.run_cycle();
//! println!("{:?}", report.mode.running);
//! ```

pub mod actuation;
pub mod boost;
pub mod calibration;
pub mod config;
pub mod cycle;
pub mod demo;
pub mod diagnostics;
pub mod fuel;
pub mod ignition;
pub mod mode;
pub mod scheduler;
pub mod snapshot;
pub mod thermal;
pub mod torque;

/// Number of cylinders
pub const CYLINDER_COUNT: usize = 6;

/// Number of cylinder banks (and turbochargers)
pub const BANK_COUNT: usize = 2;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::actuation::{
        ActuatorCommands, ActuatorSink, CoilState, CylinderCommand, FuelState, IgnitionState,
        InjectorState,
    };
    pub use crate::calibration::{
        Axis, CalibrationDocument, CalibrationError, CalibrationSet, CalibrationStore, RawTable,
        Table1D, Table2D, Table3D,
    };
    pub use crate::config::{ConfigError, EcuConfig};
    pub use crate::cycle::{ControlUnit, CycleReport};
    pub use crate::demo::AcquisitionSimulator;
    pub use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, Diagnostics, FaultKind};
    pub use crate::mode::{EmergencyState, OperatingMode, PerformanceState, RunningState};
    pub use crate::scheduler::{ActuationScheduler, EventKind, FireEvent};
    pub use crate::snapshot::{Bank, SnapshotExchange, StateSnapshot};
    pub use crate::{BANK_COUNT, CYLINDER_COUNT};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
