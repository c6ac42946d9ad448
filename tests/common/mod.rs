#![allow(dead_code)]

use boostcc::config::PressureChannelCalibration;
use boostcc::controller::{BoostController, ControlCycleResult, CycleInputs, FlushSink};
use boostcc::governor::GovernorState;
use boostcc::trim_table::TrimTable;
use boostcc::tuning::{CONTROL_CYCLE_PERIOD_MS, MAX_ENGINE_TORQUE_NM};
use boostcc::types::{AggressionLevel, RawPressureSample, RawPressureSamples, RawTorqueSample};
use boostcc::ControllerConfig;

pub const PERIOD_MS: u32 = CONTROL_CYCLE_PERIOD_MS;

/// Accepts and drops every table.
pub struct NullSink;

impl FlushSink for NullSink {
    fn try_submit(&mut self, _table: TrimTable) -> bool {
        true
    }
}

/// Sensor voltage for a gauge pressure on the default calibration.
pub fn millivolts(kpa: f32) -> u16 {
    let cal = PressureChannelCalibration::default();
    let span_mv = f32::from(cal.full_scale_mv) - f32::from(cal.zero_mv);
    (f32::from(cal.zero_mv) + kpa * span_mv / cal.full_scale_kpa).round() as u16
}

pub fn sample(kpa: f32, now_ms: u32) -> RawPressureSample {
    RawPressureSample {
        millivolts: millivolts(kpa),
        channel_ok: true,
        timestamp_ms: now_ms,
    }
}

pub fn pressures(manifold: f32, upper_dome: f32, lower_dome: f32, now_ms: u32) -> RawPressureSamples {
    RawPressureSamples {
        manifold: sample(manifold, now_ms),
        upper_dome: sample(upper_dome, now_ms),
        lower_dome: sample(lower_dome, now_ms),
    }
}

/// Torque sample from percentages of the default maximum engine torque.
pub fn torque(demand_pct: f32, delivered_pct: f32, engine_rpm: u16, now_ms: u32) -> RawTorqueSample {
    RawTorqueSample {
        requested_nm: demand_pct * MAX_ENGINE_TORQUE_NM / 100.0,
        delivered_nm: delivered_pct * MAX_ENGINE_TORQUE_NM / 100.0,
        engine_rpm,
        timestamp_ms: now_ms,
    }
}

/// All channels at `kpa`, fresh torque request.
pub fn steady(now_ms: u32, kpa: f32, demand_pct: f32, delivered_pct: f32) -> CycleInputs {
    CycleInputs {
        now_ms,
        pressures: pressures(kpa, kpa, kpa, now_ms),
        torque: Some(torque(demand_pct, delivered_pct, 3000, now_ms)),
    }
}

pub fn config(aggression: f32) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.limits.aggression = AggressionLevel::new(aggression).unwrap();
    config
}

pub fn controller(aggression: f32) -> BoostController {
    BoostController::new(config(aggression), TrimTable::new()).unwrap()
}

pub fn step(c: &mut BoostController, inputs: &CycleInputs) -> ControlCycleResult {
    let result = c.run_cycle(inputs);
    c.commit(&result, &mut NullSink);
    result
}

/// Runs steady low-pressure cycles until the boot cut is released.
/// Returns the time of the next cycle.
pub fn warm_up(c: &mut BoostController, demand_pct: f32, delivered_pct: f32) -> u32 {
    let mut now_ms = 0;
    for _ in 0..30 {
        step(c, &steady(now_ms, 10.0, demand_pct, delivered_pct));
        now_ms += PERIOD_MS;
    }
    assert_eq!(c.governor_state(), GovernorState::Nominal);
    now_ms
}
