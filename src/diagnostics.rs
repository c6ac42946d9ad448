//! Per-cycle diagnostic records

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::controller::ControlCycleResult;
use crate::dtc::active_dtc_names;
use crate::error::BoostError;
use crate::governor::GovernorState;
use crate::types::{PressureReading, TorqueStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub timestamp_ms: u32,
    pub manifold_kpa: Option<f32>,
    pub upper_dome_kpa: Option<f32>,
    pub lower_dome_kpa: Option<f32>,
    pub torque: String,
    pub demand_pct: Option<f32>,
    pub delivered_pct: Option<f32>,
    pub desired_level: f32,
    pub torque_gap: Option<f32>,
    pub governor_state: GovernorState,
    pub allowed_level: f32,
    pub governed_level: f32,
    pub predicted_kpa: Option<f32>,
    pub effective_ceiling_kpa: f32,
    pub duty_pct: f32,
    pub phase_offset_us: u32,
    pub bucket: u8,
    pub trim: f32,
    pub trim_version: u32,
    pub dtcs: u8,
    pub active_dtcs: Vec<String>,
}

fn kpa(reading: &PressureReading) -> Option<f32> {
    if reading.valid {
        Some(reading.kpa)
    } else {
        None
    }
}

impl<'a> From<&'a ControlCycleResult> for DiagnosticRecord {
    fn from(r: &ControlCycleResult) -> Self {
        let (torque, demand_pct, delivered_pct) = match &r.torque {
            TorqueStatus::Fresh(t) => ("fresh".to_string(), Some(t.demand_pct), Some(t.delivered_pct)),
            TorqueStatus::Stale { age_ms } => (format!("stale ({} ms)", age_ms), None, None),
            TorqueStatus::Implausible => ("implausible".to_string(), None, None),
            TorqueStatus::Absent => ("absent".to_string(), None, None),
        };

        DiagnosticRecord {
            timestamp_ms: r.timestamp_ms,
            manifold_kpa: kpa(&r.snapshot.manifold),
            upper_dome_kpa: kpa(&r.snapshot.upper_dome),
            lower_dome_kpa: kpa(&r.snapshot.lower_dome),
            torque,
            demand_pct,
            delivered_pct,
            desired_level: r.control.desired_level,
            torque_gap: r.control.torque_gap,
            governor_state: r.verdict.state,
            allowed_level: r.verdict.allowed_level,
            governed_level: r.verdict.governed_level,
            predicted_kpa: r.verdict.predicted_kpa,
            effective_ceiling_kpa: r.verdict.effective_ceiling_kpa,
            duty_pct: r.duty.command.percent(),
            phase_offset_us: r.duty.phase_offset_us,
            bucket: r.bucket.index() as u8,
            trim: r.trim,
            trim_version: r.trim_version,
            dtcs: r.dtcs,
            active_dtcs: active_dtc_names(r.dtcs).map(String::from).collect(),
        }
    }
}

pub trait DiagnosticSupplier {
    fn supply_diagnostic_record(&self) -> DiagnosticRecord;
}

impl DiagnosticSupplier for ControlCycleResult {
    fn supply_diagnostic_record(&self) -> DiagnosticRecord {
        DiagnosticRecord::from(self)
    }
}

pub trait DiagnosticPublisher {
    fn publish_diagnostic_record(&mut self, record: &DiagnosticRecord) -> Result<(), BoostError>;
}

/// Writes one JSON object per line.
pub struct JsonLinesPublisher<W> {
    writer: W,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesPublisher { writer }
    }
}

impl<W: Write> DiagnosticPublisher for JsonLinesPublisher<W> {
    fn publish_diagnostic_record(&mut self, record: &DiagnosticRecord) -> Result<(), BoostError> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| BoostError::Telemetry(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| BoostError::Telemetry(e.to_string()))
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    pub records: Vec<DiagnosticRecord>,
}

impl DiagnosticPublisher for RecordingPublisher {
    fn publish_diagnostic_record(&mut self, record: &DiagnosticRecord) -> Result<(), BoostError> {
        self.records.push(record.clone());
        Ok(())
    }
}
