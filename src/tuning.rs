//! Default calibration data for the boost controller
//!
//! **WARNING**
//!
//! These values seed `ControllerConfig::default()`. The PI gains, the
//! dither parameters and the learning rates have NOT been validated against
//! real hardware and must be calibrated on the target engine before use.
//! The pressure limits are deliberately conservative. Raising them without
//! expert knowledge of the turbocharger, the wastegate spring and the engine
//! risks mechanical damage.

#![allow(dead_code)]

/// Conversion factor between pounds per square inch and kilopascals.
pub const KPA_PER_PSI: f32 = 6.894_757;

// ****************************************************************************
// CYCLE TIMING
// ****************************************************************************

/// Control cycle period. \[milliseconds\]
pub const CONTROL_CYCLE_PERIOD_MS: u32 = 10;

/// Solenoid PWM carrier frequency. \[hertz\]
pub const PWM_FREQUENCY_HZ: u32 = 30;

// ****************************************************************************
// SENSORS
// ****************************************************************************

/// Sensor output at zero gauge pressure. \[millivolts\]
pub const PRESSURE_SENSOR_ZERO_MV: u16 = 500;

/// Sensor output at full scale pressure. \[millivolts\]
pub const PRESSURE_SENSOR_FULL_SCALE_MV: u16 = 4500;

/// Manifold sensor full scale, 30 psi gauge. \[kPa\]
pub const MANIFOLD_SENSOR_FULL_SCALE_KPA: f32 = 206.8;

/// Dome sensor full scale, 30 psi gauge. \[kPa\]
pub const DOME_SENSOR_FULL_SCALE_KPA: f32 = 206.8;

/// Lowest sensor output that is not an open or shorted line. \[millivolts\]
pub const PRESSURE_SENSOR_MIN_VALID_MV: u16 = 250;

/// Highest sensor output that is not an open or shorted line. \[millivolts\]
pub const PRESSURE_SENSOR_MAX_VALID_MV: u16 = 4750;

/// Lowest physically plausible gauge pressure (full vacuum). \[kPa\]
pub const PLAUSIBLE_PRESSURE_MIN_KPA: f32 = -101.3;

/// Highest physically plausible gauge pressure. \[kPa\]
pub const PLAUSIBLE_PRESSURE_MAX_KPA: f32 = 250.0;

/// How far a dome may read above the manifold pressure feeding it before
/// the pair is treated as a sensor or plumbing fault. \[kPa\]
pub const DOME_SUPPLY_TOLERANCE_KPA: f32 = 13.8;

/// Age after which a pressure sample is considered stale. \[milliseconds\]
pub const SENSOR_TIMEOUT_MS: u32 = 50;

/// Age after which a torque request is considered absent. Two control
/// cycles. \[milliseconds\]
pub const TORQUE_TIMEOUT_MS: u32 = 2 * CONTROL_CYCLE_PERIOD_MS;

/// Torque used to normalize the vehicle torque signals. \[newton metres\]
pub const MAX_ENGINE_TORQUE_NM: f32 = 570.0;

// ****************************************************************************
// PRESSURE LIMITS
// ****************************************************************************

/// Wastegate spring pressure, 5 psi. \[kPa\]
pub const SPRING_PRESSURE_KPA: f32 = 34.5;

/// Default overboost ceiling, 15 psi. \[kPa\]
pub const SAFETY_CEILING_KPA: f32 = 103.4;

/// Largest ceiling accepted from configuration, 30 psi. \[kPa\]
pub const MAXIMUM_SAFETY_CEILING_KPA: f32 = 206.8;

/// Minimum distance between spring pressure and ceiling, 1.5 psi. \[kPa\]
pub const MINIMUM_CEILING_MARGIN_KPA: f32 = 10.3;

// ****************************************************************************
// CONTROL LOOP
// ****************************************************************************

/// Proportional gain. \[% duty / % torque\]
pub const PROPORTIONAL_GAIN: f32 = 0.8;

/// Integral gain. \[% duty / (% torque * s)\]
pub const INTEGRAL_GAIN: f32 = 0.5;

/// Integral windup guard. \[% torque * s\]
pub const INTEGRAL_WINDUP_GUARD: f32 = 150.0;

/// Assist gain at aggression 1.0; scales linearly down to zero.
pub const ASSIST_GAIN_MAX: f32 = 1.5;

/// Scramble override aggression.
pub const SCRAMBLE_AGGRESSION: f32 = 1.0;

// ****************************************************************************
// OVERBOOST GOVERNOR
// ****************************************************************************

/// Number of cycles the pressure trend is extrapolated ahead.
pub const PREDICTION_HORIZON_CYCLES: u32 = 2;

/// Width of the band below the effective ceiling where the allowed level
/// is tapered, 2 psi. \[kPa\]
pub const TAPER_BAND_KPA: f32 = 13.8;

/// Ceiling margin for buckets without learned confidence, 1 psi. \[kPa\]
pub const CONSERVATIVE_MARGIN_KPA: f32 = 6.9;

/// Ceiling margin for confident buckets, 0.3 psi. \[kPa\]
pub const CONFIDENT_MARGIN_KPA: f32 = 2.1;

/// Pressure below the ceiling required to leave a hard cut, 1 psi. \[kPa\]
pub const RECOVERY_HYSTERESIS_KPA: f32 = 6.9;

/// Time the recovery condition must hold before leaving a hard
/// cut. \[milliseconds\]
pub const RECOVERY_HOLD_MS: u32 = 100;

/// Number of safety events kept for diagnostics. Oldest are dropped first.
pub const SAFETY_HISTORY_LEN: usize = 32;

// ****************************************************************************
// LEARNING
// ****************************************************************************

/// Magnitude bound of a trim entry. \[fraction of full scale\]
pub const TRIM_BOUND: f32 = 0.25;

/// Trim nudge per percent of torque gap.
pub const LEARNING_RATE: f32 = 0.002;

/// Largest trim change per second. \[fraction / s\]
pub const MAX_TRIM_RATE_PER_S: f32 = 0.05;

/// Torque gap below which no nudge is applied. \[%\]
pub const LEARNING_DEADBAND_PCT: f32 = 0.5;

/// Torque gap at or below which an observation builds confidence. \[%\]
pub const LOW_ERROR_PCT: f32 = 3.0;

/// Torque gap at or above which confidence is discarded. \[%\]
pub const LARGE_DEVIATION_PCT: f32 = 20.0;

/// Confidence count required before a bucket may use the narrow margin.
pub const CONFIDENCE_THRESHOLD: u16 = 200;

/// Saturation value of the confidence counter.
pub const CONFIDENCE_MAX: u16 = 1000;

/// Control cycles per learning update.
pub const LEARNING_DECIMATION: u32 = 1;

// ****************************************************************************
// DUTY SYNTHESIS
// ****************************************************************************

/// Slowest rise rate, used at aggression 0.0. \[% duty / cycle\]
pub const SLEW_UP_MIN_PCT_PER_CYCLE: f32 = 0.5;

/// Fastest rise rate, used at aggression 1.0. \[% duty / cycle\]
pub const SLEW_UP_MAX_PCT_PER_CYCLE: f32 = 3.0;

/// Zero-mean dither amplitude. \[% duty\]
pub const DITHER_AMPLITUDE_PCT: f32 = 0.5;

/// Seed of the dither sequence.
pub const DITHER_SEED: u64 = 0x0B00_57CC;

// ****************************************************************************
// TRIM STORE
// ****************************************************************************

/// Longest time learned trims may stay unflushed. \[milliseconds\]
pub const MAX_DIRTY_MS: u32 = 30_000;

/// Accumulated absolute trim change that forces a flush.
pub const MAX_ACCUMULATED_DELTA: f32 = 0.05;

/// First retry delay after a failed flush. \[milliseconds\]
pub const FLUSH_RETRY_BASE_MS: u32 = 500;

/// Longest retry delay after repeated flush failures. \[milliseconds\]
pub const FLUSH_RETRY_MAX_MS: u32 = 60_000;

/// Start address of each trim record slot. Each slot owns one sector.
pub const TRIM_SLOT_ADDRESSES: [u32; 2] = [0x0000_0000, 0x0000_1000];

/// Magic value at the start of a valid trim record.
pub const TRIM_RECORD_MAGIC: u32 = 0xB005_7C0D;

/// Trim record layout version.
pub const TRIM_RECORD_VERSION: u16 = 1;

// ****************************************************************************
// OPERATING BUCKETS
// ****************************************************************************

/// Upper edges of the engine speed bands. \[rpm\]
pub const RPM_BAND_EDGES: [u16; 7] = [1500, 2000, 2500, 3000, 3500, 4500, 5500];

/// Upper edges of the load bands. \[% requested torque\]
pub const LOAD_BAND_EDGES_PCT: [f32; 3] = [25.0, 50.0, 75.0];

/// Number of speed bands.
pub const RPM_BAND_COUNT: usize = RPM_BAND_EDGES.len() + 1;

/// Number of load bands.
pub const LOAD_BAND_COUNT: usize = LOAD_BAND_EDGES_PCT.len() + 1;

/// Total number of operating buckets.
pub const BUCKET_COUNT: usize = RPM_BAND_COUNT * LOAD_BAND_COUNT;
