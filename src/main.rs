//! Bench simulation
//!
//! Runs the controller against a first-order turbo plant with simulated
//! time and in-memory trim storage. Diagnostic records go to stdout as JSON
//! lines, logs go to stderr.
//!
//! ```text
//! boostcc [CONFIG.json] [--cycles N] [--telemetry]
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use tracing::{info, Level};

use boostcc::board::{Board, Clock, DutyOutput, PressureSource, TorqueSource};
use boostcc::config::PressureChannelCalibration;
use boostcc::diagnostics::JsonLinesPublisher;
use boostcc::duty::DutyUpdate;
use boostcc::nvm::MemoryStorage;
use boostcc::scheduler::{self, FlushWorker, RunOptions, TelemetryExporter, TELEMETRY_QUEUE_DEPTH};
use boostcc::trim_store::TrimStore;
use boostcc::tuning::TRIM_SLOT_ADDRESSES;
use boostcc::types::{RawPressureSample, RawPressureSamples, RawTorqueSample};
use boostcc::{BoostController, BoostError, ControllerConfig};

const DEFAULT_CYCLES: u64 = 1_000;
const NVM_SECTOR_SIZE: u32 = 0x1000;
const NVM_CAPACITY: u32 = 2 * NVM_SECTOR_SIZE;

/// Time constant of the manifold pressure response. \[s\]
const PLANT_TAU_S: f32 = 0.25;

/// Manifold pressure gained per percent of duty at full load. \[kPa\]
const PLANT_KPA_PER_DUTY_PCT: f32 = 1.1;

/// Runs the boost controller against a simulated turbo plant.
#[derive(Parser, Debug)]
#[command(name = "boostcc", version)]
struct Args {
    /// JSON controller configuration; defaults apply to absent fields.
    config: Option<String>,

    /// Number of control cycles to simulate.
    #[arg(long, default_value_t = DEFAULT_CYCLES)]
    cycles: u64,

    /// Write one diagnostic record per cycle to stdout as JSON lines.
    #[arg(long)]
    telemetry: bool,
}

fn load_config(path: Option<&str>) -> Result<ControllerConfig, BoostError> {
    match path {
        None => Ok(ControllerConfig::default()),
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| BoostError::config(format!("cannot read {}: {}", path, e)))?;
            ControllerConfig::from_json(&json)
        }
    }
}

/// Shared state of the simulated engine and turbo.
struct Plant {
    now_ms: u32,
    period_ms: u32,
    spring_kpa: f32,
    max_torque_nm: f32,
    pwm_period_us: u32,
    manifold_kpa: f32,
    duty_pct: f32,
    manifold_cal: PressureChannelCalibration,
    dome_cal: PressureChannelCalibration,
}

impl Plant {
    /// Driver input at the current time: (pedal 0..1, engine speed).
    fn driver(&self) -> (f32, u16) {
        match (self.now_ms / 1000) % 10 {
            0 | 1 => (0.1, 900),
            2 => (0.5, 2500),
            3..=6 => (1.0, 4000),
            7 => (0.6, 3500),
            _ => (0.2, 2000),
        }
    }

    fn step(&mut self) {
        let (pedal, _) = self.driver();
        let target = pedal * (self.spring_kpa + self.duty_pct * PLANT_KPA_PER_DUTY_PCT);
        let dt_s = self.period_ms as f32 / 1000.0;
        self.manifold_kpa += (target - self.manifold_kpa) * (dt_s / PLANT_TAU_S).min(1.0);
        self.now_ms = self.now_ms.wrapping_add(self.period_ms);
    }

    fn sample(cal: &PressureChannelCalibration, kpa: f32, now_ms: u32) -> RawPressureSample {
        let span_mv = f32::from(cal.full_scale_mv) - f32::from(cal.zero_mv);
        let mv = f32::from(cal.zero_mv) + kpa * span_mv / cal.full_scale_kpa;
        RawPressureSample {
            millivolts: num::clamp(mv, 0.0, f32::from(u16::MAX)) as u16,
            channel_ok: true,
            timestamp_ms: now_ms,
        }
    }
}

#[derive(Clone)]
struct SimHandle(Rc<RefCell<Plant>>);

impl PressureSource for SimHandle {
    fn read_pressures(&mut self) -> RawPressureSamples {
        let plant = self.0.borrow();
        let duty = plant.duty_pct / 100.0;
        RawPressureSamples {
            manifold: Plant::sample(&plant.manifold_cal, plant.manifold_kpa, plant.now_ms),
            upper_dome: Plant::sample(&plant.dome_cal, plant.manifold_kpa * duty, plant.now_ms),
            lower_dome: Plant::sample(
                &plant.dome_cal,
                plant.manifold_kpa * (1.0 - duty),
                plant.now_ms,
            ),
        }
    }
}

impl TorqueSource for SimHandle {
    fn latest_torque(&mut self) -> Option<RawTorqueSample> {
        let plant = self.0.borrow();
        let (pedal, engine_rpm) = plant.driver();
        let requested_nm = pedal * plant.max_torque_nm;
        // naturally aspirated share plus what the boost adds
        let breathing = (0.45 + plant.manifold_kpa.max(0.0) / 180.0).min(1.0);
        let delivered_nm = requested_nm.min(plant.max_torque_nm * breathing);
        Some(RawTorqueSample {
            requested_nm,
            delivered_nm,
            engine_rpm,
            timestamp_ms: plant.now_ms,
        })
    }
}

impl DutyOutput for SimHandle {
    fn apply(&mut self, update: &DutyUpdate) -> Result<(), BoostError> {
        let mut plant = self.0.borrow_mut();
        if plant.pwm_period_us > 0 && update.phase_offset_us >= plant.pwm_period_us {
            return Err(BoostError::DutyOutput(format!(
                "phase offset {} us outside period {} us",
                update.phase_offset_us, plant.pwm_period_us
            )));
        }
        plant.duty_pct = update.command.percent();
        plant.step();
        Ok(())
    }
}

impl Clock for SimHandle {
    fn now_ms(&self) -> u32 {
        self.0.borrow().now_ms
    }
}

fn main() -> Result<(), BoostError> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    config.validate()?;

    let storage = MemoryStorage::new(NVM_CAPACITY, NVM_SECTOR_SIZE);
    let mut store = TrimStore::new(storage.clone())?;
    let trims = store.load();
    info!(version = trims.version, "trim table loaded");

    let plant = SimHandle(Rc::new(RefCell::new(Plant {
        now_ms: 0,
        period_ms: config.cycle_period_ms,
        spring_kpa: config.limits.spring_pressure_kpa,
        max_torque_nm: config.sensors.max_engine_torque_nm,
        pwm_period_us: config.pwm_period_us(),
        manifold_kpa: 0.0,
        duty_pct: 0.0,
        manifold_cal: config.sensors.manifold,
        dome_cal: config.sensors.dome,
    })));

    let mut controller = BoostController::new(config, trims)?;
    let mut board = Board::new(plant.clone(), plant.clone(), plant.clone(), plant);
    let mut flush = FlushWorker::spawn(store)?;
    let mut telemetry = if args.telemetry {
        Some(TelemetryExporter::spawn(
            JsonLinesPublisher::new(std::io::stdout()),
            TELEMETRY_QUEUE_DEPTH,
        )?)
    } else {
        None
    };

    let stats = scheduler::run(
        &mut controller,
        &mut board,
        &mut flush,
        telemetry.as_mut(),
        RunOptions {
            max_cycles: Some(args.cycles),
            stop: None,
            real_time: false,
        },
    );

    if let Some(exporter) = telemetry {
        exporter.join();
    }

    let health = controller.storage_health().clone();
    info!(
        cycles = stats.cycles,
        flushes = health.flushes,
        flush_failures = health.failures,
        confidence = controller.overall_confidence(),
        "simulation finished"
    );

    if let Some(mut store) = flush.join() {
        let persisted = store.load();
        info!(
            version = persisted.version,
            slots = TRIM_SLOT_ADDRESSES.len(),
            bytes_written = storage.stats().bytes_written,
            "persisted trims"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boostcc::duty::DutyCommand;

    fn sim() -> SimHandle {
        let config = ControllerConfig::default();
        SimHandle(Rc::new(RefCell::new(Plant {
            now_ms: 0,
            period_ms: config.cycle_period_ms,
            spring_kpa: config.limits.spring_pressure_kpa,
            max_torque_nm: config.sensors.max_engine_torque_nm,
            pwm_period_us: config.pwm_period_us(),
            manifold_kpa: 0.0,
            duty_pct: 0.0,
            manifold_cal: config.sensors.manifold,
            dome_cal: config.sensors.dome,
        })))
    }

    #[test]
    fn phase_outside_carrier_rejected() {
        let mut plant = sim();
        let period_us = plant.0.borrow().pwm_period_us;
        let update = DutyUpdate {
            command: DutyCommand::from_percent(40.0),
            phase_offset_us: period_us,
        };
        assert!(matches!(plant.apply(&update), Err(BoostError::DutyOutput(_))));
        assert_eq!(plant.0.borrow().duty_pct, 0.0);
        assert_eq!(plant.now_ms(), 0);

        let update = DutyUpdate {
            phase_offset_us: period_us - 1,
            ..update
        };
        assert!(plant.apply(&update).is_ok());
        assert_eq!(plant.0.borrow().duty_pct, 40.0);
    }

    #[test]
    fn domes_never_exceed_manifold() {
        let mut plant = sim();
        {
            let mut p = plant.0.borrow_mut();
            p.manifold_kpa = 80.0;
            p.duty_pct = 70.0;
        }
        let config = ControllerConfig::default();
        let snapshot = boostcc::sensor::Normalizer::new(config.sensors)
            .normalize_pressures(&plant.read_pressures(), 0);
        assert!(snapshot.all_valid());
    }
}
