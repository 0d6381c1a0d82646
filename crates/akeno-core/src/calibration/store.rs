//! Shared calibration handle
//!
//! The control cycle takes one `Arc` per cycle and reads only from it, so a
//! reload in the middle of a cycle cannot mix old and new tables.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use super::{CalibrationError, CalibrationSet};
use crate::diagnostics::{Diagnostics, FaultKind};

/// Holds the active calibration set.
#[derive(Debug)]
pub struct CalibrationStore {
    current: RwLock<Arc<CalibrationSet>>,
    generation: AtomicU64,
    fallback: bool,
}

impl CalibrationStore {
    /// Wrap an already loaded set, validating it first.
    pub fn new(set: CalibrationSet) -> Result<Self, CalibrationError> {
        set.validate()?;
        Ok(Self::from_valid(set, false))
    }

    fn from_valid(set: CalibrationSet, fallback: bool) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
            generation: AtomicU64::new(0),
            fallback,
        }
    }

    /// Start from the result of loading the stored calibration. A load or
    /// validation error selects the built-in fallback set and raises
    /// `MalformedCalibration`.
    pub fn boot(loaded: Result<CalibrationSet, CalibrationError>, diagnostics: &Diagnostics) -> Self {
        match loaded.and_then(|set| set.validate().map(|()| set)) {
            Ok(set) => {
                info!("calibration loaded");
                Self::from_valid(set, false)
            }
            Err(e) => {
                error!("calibration rejected, running on fallback set: {}", e);
                diagnostics.raise(FaultKind::MalformedCalibration, 0);
                Self::from_valid(CalibrationSet::fallback(), true)
            }
        }
    }

    /// The set to use for one cycle.
    pub fn current(&self) -> Arc<CalibrationSet> {
        Arc::clone(&self.current.read())
    }

    /// Whether the fallback set was selected at boot
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Number of successful reloads
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Swap in a new set. A set that fails validation is rejected, the
    /// current set stays active and `MalformedCalibration` is raised.
    pub fn reload(
        &self,
        set: CalibrationSet,
        diagnostics: &Diagnostics,
        timestamp_us: u64,
    ) -> Result<u64, CalibrationError> {
        if let Err(e) = set.validate() {
            error!("calibration reload rejected: {}", e);
            diagnostics.raise(FaultKind::MalformedCalibration, timestamp_us);
            return Err(e);
        }

        *self.current.write() = Arc::new(set);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation, "calibration reloaded");
        Ok(generation)
    }
}
