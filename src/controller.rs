//! Boost control cycle
//!
//! `run_cycle` produces the duty command for one tick without touching
//! storage. `commit` runs after the command has been written to the
//! solenoid driver: it feeds the learning engine and decides whether the
//! trim table should be handed to the persistence worker.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::control::{ControlOutput, ResponseProfile, TorqueFollower};
use crate::dtc::*;
use crate::duty::{DutySynthesizer, DutyUpdate};
use crate::error::BoostError;
use crate::governor::{Governor, GovernorState, GovernorVerdict};
use crate::learning::{LearnOutcome, TrimEngine};
use crate::safety_history::{SafetyDiagnostics, SafetyEvent};
use crate::sensor::Normalizer;
use crate::trim_store::{FlushOutcome, FlushPolicy, StorageHealth};
use crate::trim_table::{OperatingBucket, TrimTable};
use crate::tuning::SCRAMBLE_AGGRESSION;
use crate::types::{
    AggressionLevel, RawPressureSamples, RawTorqueSample, SafetyCeiling, SensorSnapshot,
    TorqueStatus,
};

/// Everything the cycle reads from the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CycleInputs {
    pub now_ms: u32,
    pub pressures: RawPressureSamples,
    pub torque: Option<RawTorqueSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlCycleResult {
    pub timestamp_ms: u32,
    pub snapshot: SensorSnapshot,
    pub torque: TorqueStatus,
    pub control: ControlOutput,
    pub verdict: GovernorVerdict,
    pub duty: DutyUpdate,
    pub bucket: OperatingBucket,
    pub trim: f32,
    pub trim_version: u32,
    pub dtcs: u8,
}

impl ControlCycleResult {
    pub fn fault_indicator(&self) -> bool {
        self.dtcs != 0
    }
}

/// Receives trim tables for persistence. Must never block.
pub trait FlushSink {
    /// Returns `false` when the table could not be queued.
    fn try_submit(&mut self, table: TrimTable) -> bool;
}

struct ControlState {
    scramble_active: bool,
    /// Codes that outlive a single cycle.
    latched_dtcs: u8,
    last_dtcs: u8,
    last_now_ms: u32,
    storage_health: StorageHealth,
}

pub struct BoostController {
    config: ControllerConfig,
    profile: ResponseProfile,
    normalizer: Normalizer,
    follower: TorqueFollower,
    governor: Governor,
    engine: TrimEngine,
    duty: DutySynthesizer,
    flush_policy: FlushPolicy,
    control_state: ControlState,
}

impl BoostController {
    pub fn new(config: ControllerConfig, trims: TrimTable) -> Result<Self, BoostError> {
        config.validate()?;

        let trims = match trims.first_out_of_bounds(config.learning.trim_bound) {
            None => trims,
            Some((bucket, trim)) => {
                warn!(%bucket, trim, "stored trim out of bounds, starting from defaults");
                TrimTable::new()
            }
        };

        let profile = ResponseProfile::from_aggression(
            config.limits.aggression,
            &config.control,
            &config.duty,
        );

        Ok(BoostController {
            normalizer: Normalizer::new(config.sensors.clone()),
            follower: TorqueFollower::new(&config.control),
            governor: Governor::new(
                config.governor.clone(),
                config.limits.safety_ceiling,
                config.learning.confidence_threshold,
                config.cycle_period_ms,
            ),
            engine: TrimEngine::new(config.learning.clone(), trims),
            duty: DutySynthesizer::new(config.duty.clone(), config.pwm_period_us(), &profile),
            flush_policy: FlushPolicy::new(config.store.clone(), trims.version),
            control_state: ControlState {
                scramble_active: false,
                latched_dtcs: 0,
                last_dtcs: 0,
                last_now_ms: 0,
                storage_health: StorageHealth::default(),
            },
            profile,
            config,
        })
    }

    pub fn run_cycle(&mut self, inputs: &CycleInputs) -> ControlCycleResult {
        let now_ms = inputs.now_ms;
        self.control_state.last_now_ms = now_ms;

        let snapshot = self.normalizer.normalize_pressures(&inputs.pressures, now_ms);
        let torque = self
            .normalizer
            .normalize_torque(inputs.torque.as_ref(), now_ms);

        let bucket = OperatingBucket::from_request(torque.fresh());
        let trims = self.engine.snapshot();
        let entry = trims[bucket];

        let control = self.follower.update(
            &torque,
            &self.profile,
            entry.trim,
            bucket,
            self.config.dt_s(),
        );

        let verdict = self
            .governor
            .evaluate(control.desired_level, &snapshot, entry.confidence, now_ms);
        self.follower.set_output_ceiling(verdict.allowed_level);

        let governed = if snapshot.all_valid() && torque.fresh().is_some() {
            Some(verdict.governed_level)
        } else {
            None
        };
        let duty = self.duty.synthesize(governed, verdict.state);

        let mut dtcs = self.control_state.latched_dtcs;
        if verdict.sensor_invalid {
            dtcs.set(BOOST_DTC_SENSOR_INVALID);
        }
        if torque.fresh().is_none() {
            dtcs.set(BOOST_DTC_TORQUE_REQUEST_STALE);
        }
        if verdict.overboost_predicted() {
            dtcs.set(BOOST_DTC_OVERBOOST_PREDICTED);
        }
        if verdict.overboost_measured {
            dtcs.set(BOOST_DTC_OVERBOOST_MEASURED);
        }
        self.report_dtc_changes(dtcs);

        ControlCycleResult {
            timestamp_ms: now_ms,
            snapshot,
            torque,
            control,
            verdict,
            duty,
            bucket,
            trim: entry.trim,
            trim_version: trims.version,
            dtcs,
        }
    }

    /// Learns from a cycle whose duty command has been applied.
    pub fn commit(&mut self, result: &ControlCycleResult, sink: &mut dyn FlushSink) -> LearnOutcome {
        let outcome = self.engine.observe(
            result.bucket,
            result.control.torque_gap,
            result.verdict.state,
            result.control.authority,
            self.config.dt_s(),
        );

        if let LearnOutcome::BoundViolationAttempt { bucket, requested } = outcome {
            if !self
                .control_state
                .latched_dtcs
                .check(BOOST_DTC_TRIM_BOUND_VIOLATION)
            {
                warn!(%bucket, requested, "trim nudge beyond bound rejected");
            }
            self.control_state
                .latched_dtcs
                .set(BOOST_DTC_TRIM_BOUND_VIOLATION);
        }

        let version = self.engine.snapshot().version;
        self.flush_policy
            .note_change(version, outcome.delta(), result.timestamp_ms);
        self.poll_flush(result.timestamp_ms, sink);

        outcome
    }

    /// Submits the trim table when the flush policy asks for it.
    pub fn poll_flush(&mut self, now_ms: u32, sink: &mut dyn FlushSink) {
        if !self.flush_policy.should_flush(now_ms) {
            return;
        }
        let table = self.engine.snapshot();
        if sink.try_submit(table) {
            debug!(version = table.version, "trim flush submitted");
            self.flush_policy.on_submitted(table.version, now_ms);
        } else {
            debug!(version = table.version, "flush queue full, keeping trims pending");
        }
    }

    pub fn on_flush_outcome(&mut self, outcome: &FlushOutcome, now_ms: u32) {
        self.control_state.storage_health = outcome.health.clone();
        match &outcome.result {
            Ok(()) => {
                self.flush_policy.on_success(outcome.version);
                self.control_state
                    .latched_dtcs
                    .clear(BOOST_DTC_STORAGE_FLUSH_FAILURE);
            }
            Err(e) => {
                warn!(version = outcome.version, error = %e, "trim flush failed");
                self.flush_policy.on_failure(outcome.version, now_ms);
                self.control_state
                    .latched_dtcs
                    .set(BOOST_DTC_STORAGE_FLUSH_FAILURE);
            }
        }
    }

    pub fn note_telemetry_dropped(&mut self) {
        self.control_state
            .latched_dtcs
            .set(BOOST_DTC_TELEMETRY_DROPPED);
    }

    /// Clears the latched codes that do not track a live condition.
    pub fn clear_latched_dtcs(&mut self) {
        let dtcs = &mut self.control_state.latched_dtcs;
        dtcs.clear(BOOST_DTC_TRIM_BOUND_VIOLATION);
        dtcs.clear(BOOST_DTC_TELEMETRY_DROPPED);
        info!("latched trouble codes cleared");
    }

    /// Asks for a final flush of pending trims.
    pub fn request_shutdown(&mut self) {
        info!("shutdown requested, flushing pending trims");
        self.flush_policy.request_shutdown();
    }

    pub fn has_pending_trims(&self) -> bool {
        self.flush_policy.is_dirty() || self.flush_policy.is_in_flight()
    }

    fn report_dtc_changes(&mut self, dtcs: u8) {
        let previous = self.control_state.last_dtcs;
        if dtcs == previous {
            return;
        }
        for name in active_dtc_names(dtcs & !previous) {
            warn!(dtc = name, "trouble code set");
        }
        for name in active_dtc_names(previous & !dtcs) {
            info!(dtc = name, "trouble code cleared");
        }
        self.control_state.last_dtcs = dtcs;
    }

    // ************************************************************************
    // CONFIGURATION SURFACE
    // ************************************************************************

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn profile(&self) -> &ResponseProfile {
        &self.profile
    }

    pub fn governor_state(&self) -> GovernorState {
        self.governor.state()
    }

    pub fn safety_diagnostics(&self) -> SafetyDiagnostics {
        self.governor.safety_diagnostics()
    }

    /// Recent governor interventions, oldest first.
    pub fn safety_events(&self) -> impl Iterator<Item = &SafetyEvent> {
        self.governor.safety_events()
    }

    pub fn storage_health(&self) -> &StorageHealth {
        &self.control_state.storage_health
    }

    pub fn overall_confidence(&self) -> f32 {
        self.engine.overall_confidence()
    }

    pub fn set_aggression(&mut self, aggression: f32) -> Result<(), BoostError> {
        let aggression = AggressionLevel::new(aggression)?;
        self.config.limits.aggression = aggression;
        self.update_profile();
        info!(aggression = aggression.value(), "aggression changed");
        Ok(())
    }

    pub fn set_safety_ceiling(&mut self, ceiling_kpa: f32) -> Result<(), BoostError> {
        let ceiling = SafetyCeiling::new(ceiling_kpa)?;
        let mut candidate = self.config.clone();
        candidate.limits.safety_ceiling = ceiling;
        candidate.validate()?;

        self.config = candidate;
        self.governor.set_ceiling(ceiling);
        info!(ceiling_kpa, "safety ceiling changed");
        Ok(())
    }

    /// Replaces the whole configuration. Nothing changes unless the new
    /// configuration validates.
    pub fn apply_config(&mut self, config: ControllerConfig) -> Result<(), BoostError> {
        config.validate()?;

        self.normalizer = Normalizer::new(config.sensors.clone());
        self.follower.reconfigure(&config.control);
        self.governor.reconfigure(
            config.governor.clone(),
            config.learning.confidence_threshold,
            config.cycle_period_ms,
        );
        self.governor.set_ceiling(config.limits.safety_ceiling);
        self.engine.reconfigure(config.learning.clone());
        self.duty
            .reconfigure(config.duty.clone(), config.pwm_period_us());
        self.flush_policy.reconfigure(config.store.clone());
        if !config.limits.scramble_enabled && self.control_state.scramble_active {
            self.control_state.scramble_active = false;
            info!("scramble released, disabled by configuration");
        }
        self.config = config;
        self.update_profile();
        info!("configuration applied");
        Ok(())
    }

    pub fn import_trims(&mut self, table: TrimTable) -> Result<(), BoostError> {
        let before = self.engine.snapshot();
        self.engine.import(table)?;
        self.note_table_replaced(&before);
        Ok(())
    }

    pub fn export_trims(&self) -> TrimTable {
        self.engine.snapshot()
    }

    pub fn reset_trims(&mut self) {
        let before = self.engine.snapshot();
        self.engine.reset();
        self.note_table_replaced(&before);
    }

    fn note_table_replaced(&mut self, before: &TrimTable) {
        let after = self.engine.snapshot();
        let delta: f32 = before
            .entries
            .iter()
            .zip(after.entries.iter())
            .map(|(a, b)| (a.trim - b.trim).abs())
            .sum();
        self.flush_policy
            .note_change(after.version, delta, self.control_state.last_now_ms);
    }

    /// Momentary full assistance. Ceilings still bind.
    pub fn engage_scramble(&mut self) -> Result<(), BoostError> {
        if !self.config.limits.scramble_enabled {
            return Err(BoostError::ScrambleDisabled);
        }
        if !self.control_state.scramble_active {
            self.control_state.scramble_active = true;
            self.update_profile();
            info!("scramble engaged");
        }
        Ok(())
    }

    pub fn release_scramble(&mut self) {
        if self.control_state.scramble_active {
            self.control_state.scramble_active = false;
            self.update_profile();
            info!("scramble released");
        }
    }

    pub fn scramble_active(&self) -> bool {
        self.control_state.scramble_active
    }

    fn update_profile(&mut self) {
        let aggression = if self.control_state.scramble_active {
            AggressionLevel::new(SCRAMBLE_AGGRESSION).unwrap_or(AggressionLevel::MAX)
        } else {
            self.config.limits.aggression
        };
        self.profile =
            ResponseProfile::from_aggression(aggression, &self.config.control, &self.config.duty);
        self.duty.set_profile(&self.profile);
    }
}
