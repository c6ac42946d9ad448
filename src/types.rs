//! Values exchanged between the controller stages and its collaborators

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BoostError;
use crate::tuning::{MAXIMUM_SAFETY_CEILING_KPA, SAFETY_CEILING_KPA};

// ****************************************************************************
// RAW INPUTS
// ****************************************************************************

/// One pressure channel as delivered by the sensor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawPressureSample {
    pub millivolts: u16,
    /// Driver-side validity (conversion completed, line not flagged).
    pub channel_ok: bool,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawPressureSamples {
    pub manifold: RawPressureSample,
    pub upper_dome: RawPressureSample,
    pub lower_dome: RawPressureSample,
}

/// Latest vehicle torque sample decoded from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawTorqueSample {
    pub requested_nm: f32,
    pub delivered_nm: f32,
    pub engine_rpm: u16,
    pub timestamp_ms: u32,
}

// ****************************************************************************
// NORMALIZED SNAPSHOT
// ****************************************************************************

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressureChannel {
    Manifold,
    UpperDome,
    LowerDome,
}

impl fmt::Display for PressureChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PressureChannel::Manifold => "manifold",
            PressureChannel::UpperDome => "upper-dome",
            PressureChannel::LowerDome => "lower-dome",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorFault {
    /// The driver reported the channel as bad.
    ChannelFault,
    /// Output voltage indicates an open or shorted line.
    ElectricalRange,
    /// Converted pressure is not physically plausible.
    PhysicalRange,
    /// Sample is older than the sensor timeout.
    Stale,
    /// Dome reads above the manifold pressure that supplies it.
    PneumaticImplausible,
}

/// Gauge pressure in kPa with its validity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureReading {
    pub kpa: f32,
    pub valid: bool,
    pub timestamp_ms: u32,
    pub fault: Option<SensorFault>,
}

impl PressureReading {
    pub const fn valid(kpa: f32, timestamp_ms: u32) -> Self {
        PressureReading {
            kpa,
            valid: true,
            timestamp_ms,
            fault: None,
        }
    }

    pub const fn invalid(fault: SensorFault, timestamp_ms: u32) -> Self {
        PressureReading {
            kpa: 0.0,
            valid: false,
            timestamp_ms,
            fault: Some(fault),
        }
    }
}

impl Default for PressureReading {
    fn default() -> Self {
        PressureReading::invalid(SensorFault::Stale, 0)
    }
}

/// Canonical pressure snapshot for one cycle.
///
/// The default snapshot has every channel invalid, so a cycle that never
/// received sensor data cannot produce assistance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub manifold: PressureReading,
    pub upper_dome: PressureReading,
    pub lower_dome: PressureReading,
}

impl SensorSnapshot {
    pub fn readings(&self) -> [(PressureChannel, &PressureReading); 3] {
        [
            (PressureChannel::Manifold, &self.manifold),
            (PressureChannel::UpperDome, &self.upper_dome),
            (PressureChannel::LowerDome, &self.lower_dome),
        ]
    }

    pub fn all_valid(&self) -> bool {
        self.readings().iter().all(|(_, r)| r.valid)
    }

    /// First invalid channel and its fault, if any.
    pub fn first_fault(&self) -> Option<(PressureChannel, SensorFault)> {
        self.readings()
            .iter()
            .find(|(_, r)| !r.valid)
            .map(|(c, r)| (*c, r.fault.unwrap_or(SensorFault::ChannelFault)))
    }

    /// Highest pressure across the valid channels.
    pub fn max_kpa(&self) -> Option<f32> {
        self.readings()
            .iter()
            .filter(|(_, r)| r.valid)
            .map(|(_, r)| r.kpa)
            .fold(None, |acc: Option<f32>, p| Some(acc.map_or(p, |a| a.max(p))))
    }
}

/// Normalized torque demand and delivery in percent of maximum engine
/// torque.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TorqueRequest {
    pub demand_pct: f32,
    pub delivered_pct: f32,
    pub engine_rpm: u16,
    pub timestamp_ms: u32,
}

impl TorqueRequest {
    /// Requested minus delivered torque. \[% points\]
    pub fn gap_pct(&self) -> f32 {
        self.demand_pct - self.delivered_pct
    }
}

/// Outcome of torque normalization. Anything other than `Fresh` is an
/// absent request and forces the fail-safe; it is never read as zero
/// demand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TorqueStatus {
    Fresh(TorqueRequest),
    Stale { age_ms: u32 },
    Implausible,
    Absent,
}

impl TorqueStatus {
    pub fn fresh(&self) -> Option<&TorqueRequest> {
        match self {
            TorqueStatus::Fresh(request) => Some(request),
            _ => None,
        }
    }
}

// ****************************************************************************
// OPERATOR SETTINGS
// ****************************************************************************

/// Single assistance knob in [0.0, 1.0].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct AggressionLevel(f32);

impl AggressionLevel {
    pub const OFF: AggressionLevel = AggressionLevel(0.0);
    pub const MAX: AggressionLevel = AggressionLevel(1.0);

    pub fn new(value: f32) -> Result<Self, BoostError> {
        if (0.0..=1.0).contains(&value) {
            Ok(AggressionLevel(value))
        } else {
            Err(BoostError::config(format!(
                "aggression must be within 0.0-1.0, got {}",
                value
            )))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl Default for AggressionLevel {
    fn default() -> Self {
        AggressionLevel::OFF
    }
}

impl TryFrom<f32> for AggressionLevel {
    type Error = BoostError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        AggressionLevel::new(value)
    }
}

impl From<AggressionLevel> for f32 {
    fn from(a: AggressionLevel) -> f32 {
        a.0
    }
}

/// Named presets are only labels for points on the aggression scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggressionPreset {
    Off,
    Daily,
    Spirited,
    Track,
}

impl From<AggressionPreset> for AggressionLevel {
    fn from(preset: AggressionPreset) -> Self {
        match preset {
            AggressionPreset::Off => AggressionLevel(0.0),
            AggressionPreset::Daily => AggressionLevel(0.3),
            AggressionPreset::Spirited => AggressionLevel(0.6),
            AggressionPreset::Track => AggressionLevel(1.0),
        }
    }
}

/// Absolute overboost limit in kPa gauge. A limit, never a target.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct SafetyCeiling(f32);

impl SafetyCeiling {
    pub const DEFAULT: SafetyCeiling = SafetyCeiling(SAFETY_CEILING_KPA);

    pub fn new(kpa: f32) -> Result<Self, BoostError> {
        if kpa.is_finite() && kpa > 0.0 && kpa <= MAXIMUM_SAFETY_CEILING_KPA {
            Ok(SafetyCeiling(kpa))
        } else {
            Err(BoostError::config(format!(
                "safety ceiling must be within 0-{} kPa, got {}",
                MAXIMUM_SAFETY_CEILING_KPA, kpa
            )))
        }
    }

    pub fn kpa(self) -> f32 {
        self.0
    }

    /// Ceiling lowered by `margin_kpa`. A negative margin cannot relax it.
    pub fn tightened(self, margin_kpa: f32) -> f32 {
        self.0 - margin_kpa.max(0.0)
    }
}

impl Default for SafetyCeiling {
    fn default() -> Self {
        SafetyCeiling::DEFAULT
    }
}

impl TryFrom<f32> for SafetyCeiling {
    type Error = BoostError;

    fn try_from(kpa: f32) -> Result<Self, Self::Error> {
        SafetyCeiling::new(kpa)
    }
}

impl From<SafetyCeiling> for f32 {
    fn from(c: SafetyCeiling) -> f32 {
        c.0
    }
}
