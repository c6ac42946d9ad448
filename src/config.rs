//! Runtime configuration
//!
//! Every field defaults to the matching value in `tuning`. A configuration
//! only reaches the controller through `ControllerConfig::validate`.

use serde::{Deserialize, Serialize};

use crate::error::BoostError;
use crate::tuning::*;
use crate::types::{AggressionLevel, SafetyCeiling};

/// Linear transfer of one pressure sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureChannelCalibration {
    pub zero_mv: u16,
    pub full_scale_mv: u16,
    pub full_scale_kpa: f32,
    pub min_valid_mv: u16,
    pub max_valid_mv: u16,
}

impl PressureChannelCalibration {
    pub const fn with_full_scale(full_scale_kpa: f32) -> Self {
        PressureChannelCalibration {
            zero_mv: PRESSURE_SENSOR_ZERO_MV,
            full_scale_mv: PRESSURE_SENSOR_FULL_SCALE_MV,
            full_scale_kpa,
            min_valid_mv: PRESSURE_SENSOR_MIN_VALID_MV,
            max_valid_mv: PRESSURE_SENSOR_MAX_VALID_MV,
        }
    }

    /// Gauge pressure for `millivolts`. \[kPa\]
    pub fn to_kpa(&self, millivolts: u16) -> f32 {
        let span_mv = f32::from(self.full_scale_mv) - f32::from(self.zero_mv);
        (f32::from(millivolts) - f32::from(self.zero_mv)) * self.full_scale_kpa / span_mv
    }

    pub fn electrically_valid(&self, millivolts: u16) -> bool {
        millivolts >= self.min_valid_mv && millivolts <= self.max_valid_mv
    }

    fn validate(&self, name: &str) -> Result<(), BoostError> {
        if self.full_scale_mv <= self.zero_mv {
            return Err(BoostError::config(format!(
                "{} sensor full scale ({} mV) must be above zero ({} mV)",
                name, self.full_scale_mv, self.zero_mv
            )));
        }
        if !(self.full_scale_kpa > 0.0) {
            return Err(BoostError::config(format!(
                "{} sensor full scale must be positive",
                name
            )));
        }
        if self.min_valid_mv >= self.max_valid_mv {
            return Err(BoostError::config(format!(
                "{} sensor valid window is empty",
                name
            )));
        }
        Ok(())
    }
}

impl Default for PressureChannelCalibration {
    fn default() -> Self {
        PressureChannelCalibration::with_full_scale(MANIFOLD_SENSOR_FULL_SCALE_KPA)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub manifold: PressureChannelCalibration,
    pub dome: PressureChannelCalibration,
    pub plausible_min_kpa: f32,
    pub plausible_max_kpa: f32,
    pub dome_supply_tolerance_kpa: f32,
    pub sensor_timeout_ms: u32,
    pub torque_timeout_ms: u32,
    pub max_engine_torque_nm: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            manifold: PressureChannelCalibration::with_full_scale(MANIFOLD_SENSOR_FULL_SCALE_KPA),
            dome: PressureChannelCalibration::with_full_scale(DOME_SENSOR_FULL_SCALE_KPA),
            plausible_min_kpa: PLAUSIBLE_PRESSURE_MIN_KPA,
            plausible_max_kpa: PLAUSIBLE_PRESSURE_MAX_KPA,
            dome_supply_tolerance_kpa: DOME_SUPPLY_TOLERANCE_KPA,
            sensor_timeout_ms: SENSOR_TIMEOUT_MS,
            torque_timeout_ms: TORQUE_TIMEOUT_MS,
            max_engine_torque_nm: MAX_ENGINE_TORQUE_NM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    pub spring_pressure_kpa: f32,
    pub safety_ceiling: SafetyCeiling,
    pub aggression: AggressionLevel,
    pub scramble_enabled: bool,
}

impl Default for LimitConfig {
    fn default() -> Self {
        LimitConfig {
            spring_pressure_kpa: SPRING_PRESSURE_KPA,
            safety_ceiling: SafetyCeiling::DEFAULT,
            aggression: AggressionLevel::OFF,
            scramble_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub proportional_gain: f32,
    pub integral_gain: f32,
    pub integral_windup_guard: f32,
    pub assist_gain_max: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            proportional_gain: PROPORTIONAL_GAIN,
            integral_gain: INTEGRAL_GAIN,
            integral_windup_guard: INTEGRAL_WINDUP_GUARD,
            assist_gain_max: ASSIST_GAIN_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub prediction_horizon_cycles: u32,
    pub taper_band_kpa: f32,
    pub conservative_margin_kpa: f32,
    pub confident_margin_kpa: f32,
    pub recovery_hysteresis_kpa: f32,
    pub recovery_hold_ms: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            prediction_horizon_cycles: PREDICTION_HORIZON_CYCLES,
            taper_band_kpa: TAPER_BAND_KPA,
            conservative_margin_kpa: CONSERVATIVE_MARGIN_KPA,
            confident_margin_kpa: CONFIDENT_MARGIN_KPA,
            recovery_hysteresis_kpa: RECOVERY_HYSTERESIS_KPA,
            recovery_hold_ms: RECOVERY_HOLD_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub trim_bound: f32,
    pub learning_rate: f32,
    pub max_trim_rate_per_s: f32,
    pub deadband_pct: f32,
    pub low_error_pct: f32,
    pub large_deviation_pct: f32,
    pub confidence_threshold: u16,
    pub learning_decimation: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        LearningConfig {
            trim_bound: TRIM_BOUND,
            learning_rate: LEARNING_RATE,
            max_trim_rate_per_s: MAX_TRIM_RATE_PER_S,
            deadband_pct: LEARNING_DEADBAND_PCT,
            low_error_pct: LOW_ERROR_PCT,
            large_deviation_pct: LARGE_DEVIATION_PCT,
            confidence_threshold: CONFIDENCE_THRESHOLD,
            learning_decimation: LEARNING_DECIMATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DutyConfig {
    pub slew_up_min_pct_per_cycle: f32,
    pub slew_up_max_pct_per_cycle: f32,
    pub dither_amplitude_pct: f32,
    pub dither_seed: u64,
}

impl Default for DutyConfig {
    fn default() -> Self {
        DutyConfig {
            slew_up_min_pct_per_cycle: SLEW_UP_MIN_PCT_PER_CYCLE,
            slew_up_max_pct_per_cycle: SLEW_UP_MAX_PCT_PER_CYCLE,
            dither_amplitude_pct: DITHER_AMPLITUDE_PCT,
            dither_seed: DITHER_SEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_dirty_ms: u32,
    pub max_accumulated_delta: f32,
    pub retry_base_ms: u32,
    pub retry_max_ms: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            max_dirty_ms: MAX_DIRTY_MS,
            max_accumulated_delta: MAX_ACCUMULATED_DELTA,
            retry_base_ms: FLUSH_RETRY_BASE_MS,
            retry_max_ms: FLUSH_RETRY_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub cycle_period_ms: u32,
    pub pwm_frequency_hz: u32,
    pub sensors: SensorConfig,
    pub limits: LimitConfig,
    pub control: ControlConfig,
    pub governor: GovernorConfig,
    pub learning: LearningConfig,
    pub duty: DutyConfig,
    pub store: StoreConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            cycle_period_ms: CONTROL_CYCLE_PERIOD_MS,
            pwm_frequency_hz: PWM_FREQUENCY_HZ,
            sensors: SensorConfig::default(),
            limits: LimitConfig::default(),
            control: ControlConfig::default(),
            governor: GovernorConfig::default(),
            learning: LearningConfig::default(),
            duty: DutyConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

fn ensure(condition: bool, msg: impl FnOnce() -> String) -> Result<(), BoostError> {
    if condition {
        Ok(())
    } else {
        Err(BoostError::config(msg()))
    }
}

fn finite_non_negative(value: f32) -> bool {
    value.is_finite() && value >= 0.0
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self, BoostError> {
        let config: ControllerConfig = serde_json::from_str(json)
            .map_err(|e| BoostError::config(format!("malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Control cycle period. \[seconds\]
    pub fn dt_s(&self) -> f32 {
        self.cycle_period_ms as f32 / 1000.0
    }

    /// PWM carrier period. \[microseconds\]
    pub fn pwm_period_us(&self) -> u32 {
        1_000_000 / self.pwm_frequency_hz.max(1)
    }

    pub fn validate(&self) -> Result<(), BoostError> {
        ensure(self.cycle_period_ms > 0, || {
            "cycle period must be positive".into()
        })?;
        ensure(self.pwm_frequency_hz > 0, || {
            "PWM frequency must be positive".into()
        })?;

        let s = &self.sensors;
        s.manifold.validate("manifold")?;
        s.dome.validate("dome")?;
        ensure(s.plausible_min_kpa < s.plausible_max_kpa, || {
            "plausible pressure range is empty".into()
        })?;
        ensure(finite_non_negative(s.dome_supply_tolerance_kpa), || {
            format!(
                "dome supply tolerance {} kPa must be finite and non-negative",
                s.dome_supply_tolerance_kpa
            )
        })?;
        ensure(s.sensor_timeout_ms >= self.cycle_period_ms, || {
            format!(
                "sensor timeout {} ms is shorter than the cycle period",
                s.sensor_timeout_ms
            )
        })?;
        ensure(s.torque_timeout_ms >= self.cycle_period_ms, || {
            format!(
                "torque timeout {} ms is shorter than the cycle period",
                s.torque_timeout_ms
            )
        })?;
        ensure(s.max_engine_torque_nm > 0.0, || {
            "maximum engine torque must be positive".into()
        })?;

        let l = &self.limits;
        let spring_min = KPA_PER_PSI;
        let spring_max = 20.0 * KPA_PER_PSI;
        ensure(
            l.spring_pressure_kpa >= spring_min && l.spring_pressure_kpa <= spring_max,
            || {
                format!(
                    "spring pressure {} kPa is outside {:.1}-{:.1} kPa",
                    l.spring_pressure_kpa, spring_min, spring_max
                )
            },
        )?;
        let ceiling = l.safety_ceiling.kpa();
        ensure(
            ceiling >= l.spring_pressure_kpa + MINIMUM_CEILING_MARGIN_KPA,
            || {
                format!(
                    "safety ceiling {} kPa must be at least {} kPa above spring pressure",
                    ceiling, MINIMUM_CEILING_MARGIN_KPA
                )
            },
        )?;

        let c = &self.control;
        ensure(
            finite_non_negative(c.proportional_gain)
                && finite_non_negative(c.integral_gain)
                && finite_non_negative(c.assist_gain_max),
            || "control gains must be finite and non-negative".into(),
        )?;
        ensure(c.integral_windup_guard > 0.0, || {
            "windup guard must be positive".into()
        })?;

        let g = &self.governor;
        ensure(g.taper_band_kpa > 0.0, || "taper band must be positive".into())?;
        ensure(
            finite_non_negative(g.confident_margin_kpa)
                && g.confident_margin_kpa <= g.conservative_margin_kpa,
            || "confident margin must be between 0 and the conservative margin".into(),
        )?;
        ensure(
            g.conservative_margin_kpa + g.taper_band_kpa < ceiling,
            || "margin and taper band leave no operating range below the ceiling".into(),
        )?;
        ensure(finite_non_negative(g.recovery_hysteresis_kpa), || {
            "recovery hysteresis must be non-negative".into()
        })?;

        let lr = &self.learning;
        ensure(lr.trim_bound > 0.0 && lr.trim_bound < 1.0, || {
            format!("trim bound {} must be within (0, 1)", lr.trim_bound)
        })?;
        ensure(
            finite_non_negative(lr.learning_rate) && lr.max_trim_rate_per_s > 0.0,
            || "learning rates must be positive".into(),
        )?;
        ensure(
            finite_non_negative(lr.deadband_pct)
                && lr.deadband_pct <= lr.low_error_pct
                && lr.low_error_pct < lr.large_deviation_pct,
            || "learning thresholds must satisfy deadband <= low error < large deviation".into(),
        )?;
        ensure(lr.confidence_threshold <= CONFIDENCE_MAX, || {
            format!("confidence threshold cannot exceed {}", CONFIDENCE_MAX)
        })?;
        ensure(lr.learning_decimation >= 1, || {
            "learning decimation must be at least 1".into()
        })?;

        let d = &self.duty;
        ensure(
            d.slew_up_min_pct_per_cycle > 0.0
                && d.slew_up_min_pct_per_cycle <= d.slew_up_max_pct_per_cycle,
            || "slew-up range must be positive and ordered".into(),
        )?;
        ensure(
            finite_non_negative(d.dither_amplitude_pct) && d.dither_amplitude_pct <= 5.0,
            || "dither amplitude must be within 0-5 %".into(),
        )?;

        let st = &self.store;
        ensure(st.max_dirty_ms > 0 && st.max_accumulated_delta > 0.0, || {
            "flush thresholds must be positive".into()
        })?;
        ensure(
            st.retry_base_ms > 0 && st.retry_base_ms <= st.retry_max_ms,
            || "flush retry delays must be positive and ordered".into(),
        )?;

        Ok(())
    }
}
