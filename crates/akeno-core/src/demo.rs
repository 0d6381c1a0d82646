//! Demo Mode - simulated acquisition for running the control core without hardware
//!
//! Produces snapshots of an engine that is cranked, catches, warms up at
//! idle and sees occasional pedal blips. Stands in for the acquisition path
//! in the demo binary and in tests.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::mode::PerformanceState;
use crate::snapshot::{BankInputs, BrakePedal, StateSnapshot};

const CRANKING_MS: u64 = 600;
const CRANKING_RPM: f64 = 250.0;
const IDLE_RPM: f64 = 850.0;
const RAMP_UP_MS: u64 = 300;
const HOLD_MS: u64 = 200;
const RAMP_DOWN_MS: u64 = 800;

/// Simulated acquisition path
pub struct AcquisitionSimulator {
    /// Last update time (µs)
    last_update_us: Option<u64>,
    /// Time of next pedal blip (ms)
    next_blip_at_ms: u64,
    /// Current blip state
    blip_state: BlipState,
    /// Current crank speed (smoothed)
    current_rpm: f64,
    /// Peak speed of the current blip
    blip_target_rpm: f64,
    /// Crank position within the cycle (1/10 °)
    crank_angle: f64,
    performance: PerformanceState,
    rng: StdRng,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlipState {
    /// Starter turning the engine
    Cranking,
    /// Engine idling normally
    Idle,
    /// Pedal opening, speed rising
    RampUp { start_ms: u64 },
    /// At peak speed, holding
    Hold { start_ms: u64 },
    /// Pedal closing, speed falling
    RampDown { start_ms: u64 },
}

impl Default for AcquisitionSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionSimulator {
    /// Create a simulator seeded from the OS
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a reproducible simulator
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut rng: StdRng) -> Self {
        let first_blip = rng.gen_range(3000..6000);
        Self {
            last_update_us: None,
            next_blip_at_ms: first_blip,
            blip_state: BlipState::Cranking,
            current_rpm: 0.0,
            blip_target_rpm: 0.0,
            crank_angle: 0.0,
            performance: PerformanceState::Norm,
            rng,
        }
    }

    /// Select the performance mode the simulated driver requests
    pub fn set_performance(&mut self, performance: PerformanceState) {
        self.performance = performance;
    }

    /// Advance the simulation to `elapsed_us` and return the snapshot at that time.
    pub fn update(&mut self, elapsed_us: u64) -> StateSnapshot {
        let delta_us = self
            .last_update_us
            .map_or(0, |last| elapsed_us.saturating_sub(last));
        self.last_update_us = Some(elapsed_us);
        let sim_ms = elapsed_us / 1000;

        self.update_blip_state(sim_ms);

        let target_rpm = self.calculate_target_rpm(sim_ms);
        let rpm_rate = if target_rpm > self.current_rpm { 8000.0 } else { 3000.0 }; // rpm/s
        let max_change = rpm_rate * (delta_us as f64 / 1_000_000.0);
        let diff = target_rpm - self.current_rpm;
        self.current_rpm += diff.clamp(-max_change, max_change);

        let t = elapsed_us as f64 / 1_000_000.0;
        let wobble = if self.blip_state == BlipState::Idle {
            20.0 * (t * 2.5).sin() + 10.0 * (t * 7.3).sin()
        } else {
            0.0
        };
        let rpm = (self.current_rpm + wobble).max(0.0);

        // 6 * rpm degrees per second, kept in tenths
        self.crank_angle = (self.crank_angle + rpm * 6.0 * delta_us as f64 / 100_000.0).rem_euclid(7200.0);

        let pedal = match self.blip_state {
            BlipState::Cranking | BlipState::Idle => 0.0,
            BlipState::RampUp { .. } | BlipState::Hold { .. } => 450.0,
            BlipState::RampDown { .. } => 0.0,
        };
        let pedal_delta = match self.blip_state {
            BlipState::RampUp { .. } => 450,
            BlipState::RampDown { start_ms } if sim_ms < start_ms + 200 => -450,
            _ => 0,
        };

        // manifold pressure rises with load, a little boost on blips
        let map = if pedal > 0.0 { 900.0 + rpm / 10.0 } else { 350.0 + 10.0 * (t * 0.9).sin() };
        let coolant = 200.0 + 700.0 * (1.0 - (-t / 120.0).exp());
        let lambda = 100.0 + 3.0 * (t * 1.5).sin() + (t * 4.7).sin();
        let knock = self.rng.gen_range(0..40);

        let bank = |phase: f64| BankInputs {
            turbo_speed: (rpm * 12.0) as u32,
            cam_position: (self.crank_angle / 2.0) as u32,
            pre_turbo_pressure: 1000,
            boost_pressure: map as u32,
            throttle: pedal as u32,
            lambda: (lambda + phase) as u32,
            post_cat_lambda: 100,
            knock_level: knock,
            exhaust_temp: [(3000.0 + rpm / 2.0) as i32; 2],
            pre_turbo_temp: 250,
            pre_intercooler_temp: 600,
            post_intercooler_temp: 350,
            ..BankInputs::default()
        };

        let mut snapshot = StateSnapshot {
            timestamp_us: elapsed_us,
            crank_speed: rpm as u32,
            crank_position: self.crank_angle as u32,
            coolant_in_temp: (coolant - 80.0) as i32,
            coolant_out_temp: coolant as i32,
            intercooler_water_in_temp: 300,
            intercooler_water_out_temp: 350,
            oil_tank_temp: (coolant * 0.9) as i32,
            oil_sump_temp: (coolant * 0.95) as i32,
            intake_manifold_temp: 300 + (50.0 * (t * 0.1).sin()) as i32,
            water_pressure: 1500,
            oil_pressure: 2000 + (rpm / 2.0) as u32,
            intake_manifold_pressure: map as u32,
            fuel_rail_pressure: 3000,
            supply_voltage: (13_800.0 + 200.0 * (t * 0.5).sin()) as u32,
            banks: [bank(0.0), bank(1.0)],
            ..StateSnapshot::default()
        };
        snapshot.driver.pedal = pedal as u32;
        snapshot.driver.pedal_delta = pedal_delta;
        snapshot.driver.brake = BrakePedal::Released;
        snapshot.driver.performance_request = self.performance;
        snapshot
    }

    /// Update the blip state machine
    fn update_blip_state(&mut self, sim_ms: u64) {
        match self.blip_state {
            BlipState::Cranking => {
                if sim_ms >= CRANKING_MS {
                    self.blip_state = BlipState::Idle;
                }
            }
            BlipState::Idle => {
                if sim_ms >= self.next_blip_at_ms {
                    self.blip_target_rpm = self.rng.gen_range(2000.0..4000.0);
                    self.blip_state = BlipState::RampUp { start_ms: sim_ms };
                }
            }
            BlipState::RampUp { start_ms } => {
                if sim_ms >= start_ms + RAMP_UP_MS {
                    self.blip_state = BlipState::Hold { start_ms: sim_ms };
                }
            }
            BlipState::Hold { start_ms } => {
                if sim_ms >= start_ms + HOLD_MS {
                    self.blip_state = BlipState::RampDown { start_ms: sim_ms };
                }
            }
            BlipState::RampDown { start_ms } => {
                if sim_ms >= start_ms + RAMP_DOWN_MS {
                    self.blip_state = BlipState::Idle;
                    self.next_blip_at_ms = sim_ms + self.rng.gen_range(3000..6000);
                }
            }
        }
    }

    /// Speed the engine is heading for in the current blip state
    fn calculate_target_rpm(&self, sim_ms: u64) -> f64 {
        match self.blip_state {
            BlipState::Cranking => CRANKING_RPM,
            BlipState::Idle => IDLE_RPM,
            BlipState::RampUp { start_ms } => {
                let progress = ((sim_ms - start_ms) as f64 / RAMP_UP_MS as f64).min(1.0);
                IDLE_RPM + (self.blip_target_rpm - IDLE_RPM) * progress
            }
            BlipState::Hold { .. } => self.blip_target_rpm,
            BlipState::RampDown { start_ms } => {
                let progress = ((sim_ms - start_ms) as f64 / RAMP_DOWN_MS as f64).min(1.0);
                self.blip_target_rpm + (IDLE_RPM - self.blip_target_rpm) * progress
            }
        }
    }
}
