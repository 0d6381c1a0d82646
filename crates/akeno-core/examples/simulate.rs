//! Control Core Simulation Tool
//!
//! Runs the control unit against the simulated acquisition path and prints
//! the mode, ignition, fueling and boost outputs as the engine starts and
//! idles.
//!
//! Usage:
//!   cargo run --example simulate -- [OPTIONS]
//!
//! Options:
//!   --calibration FILE   Calibration (.json document or binary image)
//!   --config FILE        Runtime configuration (.json)
//!   --seconds N          Simulated time (default: 10)
//!   --step-us N          Time between cycles in µs (default: 2000)
//!   --seed N             Simulator seed (default: 1)
//!   --every N            Print every Nth cycle (default: 250)
//!
//! Set RUST_LOG=debug to see state transitions.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use akeno_core::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut calibration_path: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut seconds = 10u64;
    let mut step_us = 2000u64;
    let mut seed = 1u64;
    let mut every = 250u64;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--calibration" => calibration_path = value.cloned(),
            "--config" => config_path = value.cloned(),
            "--seconds" => seconds = value.and_then(|v| v.parse().ok()).unwrap_or(seconds),
            "--step-us" => step_us = value.and_then(|v| v.parse().ok()).unwrap_or(step_us),
            "--seed" => seed = value.and_then(|v| v.parse().ok()).unwrap_or(seed),
            "--every" => every = value.and_then(|v| v.parse().ok()).unwrap_or(every),
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("Unknown option: {}", other);
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    let config = match &config_path {
        Some(path) => EcuConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => EcuConfig::default(),
    };

    let diagnostics = Arc::new(Diagnostics::new());
    let loaded = match &calibration_path {
        Some(path) => CalibrationSet::from_file(path),
        None => Ok(CalibrationSet::fallback()),
    };
    let store = Arc::new(CalibrationStore::boot(loaded, &diagnostics));
    let exchange = Arc::new(SnapshotExchange::new());
    let mut ecu = ControlUnit::new(config, store, Arc::clone(&exchange), Arc::clone(&diagnostics));
    let mut sim = AcquisitionSimulator::seeded(seed);
    let mut sink: Vec<ActuatorCommands> = Vec::new();

    println!(
        "{:>8} {:>6} {:<22} {:<10} {:>7} {:>7} {:>7} {:>6}",
        "time ms", "rpm", "running", "emergency", "timing", "inj us", "torque", "wg"
    );

    let cycles = seconds * 1_000_000 / step_us.max(1);
    for n in 0..cycles {
        exchange.publish(sim.update(n * step_us));
        let report = ecu.run_cycle_into(&mut sink);
        sink.clear();

        if n % every.max(1) == 0 {
            let cyl = &report.commands.cylinders[0];
            println!(
                "{:>8} {:>6} {:<22} {:<10} {:>7.1} {:>7} {:>7.1} {:>6.1}",
                report.timestamp_us / 1000,
                report.snapshot.crank_speed,
                format!("{:?}", report.mode.running),
                format!("{:?}", report.mode.emergency),
                f64::from(cyl.timing) / 10.0,
                cyl.injector_duration_us,
                f64::from(report.commands.torque) / 10.0,
                f64::from(report.commands.wastegate[0]) / 10.0,
            );
        }
    }

    let counters = diagnostics.counters();
    println!();
    println!("Faults: {}", serde_json::to_string_pretty(&counters)?);
    println!("Deferred events: {}", ecu.scheduler().deferred_count());
    println!("Late events: {}", ecu.scheduler().late_count());

    let shutdown = ecu.power_down();
    println!("Power down, wastegates at {:?}", shutdown.wastegate);
    Ok(())
}

fn print_help() {
    println!("Control Core Simulation Tool");
    println!();
    println!("Usage: simulate [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --calibration FILE   Calibration (.json document or binary image)");
    println!("  --config FILE        Runtime configuration (.json)");
    println!("  --seconds N          Simulated time (default: 10)");
    println!("  --step-us N          Time between cycles in µs (default: 2000)");
    println!("  --seed N             Simulator seed (default: 1)");
    println!("  --every N            Print every Nth cycle (default: 250)");
}
