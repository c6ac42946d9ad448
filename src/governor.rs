//! Overboost governor
//!
//! Sits between the control loop and the duty synthesizer and always has
//! the last word on the actuation level. Checks run in priority order:
//!
//! 1. any invalid pressure reading cuts immediately
//! 2. any measured pressure above the configured ceiling cuts immediately
//! 3. a cut is only released after pressure has stayed below the ceiling
//!    minus the recovery hysteresis for the recovery hold time
//! 4. predicted pressure approaching the effective ceiling tapers the
//!    allowed level down to zero at the effective ceiling
//!
//! Every cut and taper after boot is kept in a bounded `SafetyHistory`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GovernorConfig;
use crate::fault_condition::FaultCondition;
use crate::ms_timer::elapsed_ms;
use crate::safety_history::{SafetyDiagnostics, SafetyEvent, SafetyEventKind, SafetyHistory};
use crate::types::{SafetyCeiling, SensorSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernorState {
    Nominal,
    Tapering,
    HardCut,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GovernorVerdict {
    pub state: GovernorState,
    /// Highest level permitted this cycle. \[% duty\]
    pub allowed_level: f32,
    /// Desired level after limiting. \[% duty\]
    pub governed_level: f32,
    /// Extrapolated peak pressure, when every reading is valid. \[kPa\]
    pub predicted_kpa: Option<f32>,
    /// Configured ceiling less the active margin. \[kPa\]
    pub effective_ceiling_kpa: f32,
    pub sensor_invalid: bool,
    pub overboost_measured: bool,
}

impl GovernorVerdict {
    pub fn overboost_predicted(&self) -> bool {
        self.state == GovernorState::Tapering
    }
}

pub struct Governor {
    config: GovernorConfig,
    ceiling: SafetyCeiling,
    confidence_threshold: u16,
    cycle_period_ms: u32,
    state: GovernorState,
    previous_pressures: Option<([f32; 3], u32)>,
    taper_reference: f32,
    last_governed: f32,
    recovery: FaultCondition,
    history: SafetyHistory,
    last_now_ms: u32,
}

impl Governor {
    pub fn new(
        config: GovernorConfig,
        ceiling: SafetyCeiling,
        confidence_threshold: u16,
        cycle_period_ms: u32,
    ) -> Self {
        Governor {
            config,
            ceiling,
            confidence_threshold,
            cycle_period_ms,
            state: GovernorState::HardCut,
            previous_pressures: None,
            taper_reference: 0.0,
            last_governed: 0.0,
            recovery: FaultCondition::new(),
            history: SafetyHistory::default(),
            last_now_ms: 0,
        }
    }

    pub fn state(&self) -> GovernorState {
        self.state
    }

    pub fn ceiling(&self) -> SafetyCeiling {
        self.ceiling
    }

    pub fn safety_diagnostics(&self) -> SafetyDiagnostics {
        self.history.diagnostics()
    }

    pub fn safety_events(&self) -> impl Iterator<Item = &SafetyEvent> {
        self.history.events()
    }

    pub fn set_ceiling(&mut self, ceiling: SafetyCeiling) {
        if ceiling < self.ceiling {
            // a lowered ceiling must be re-earned from a cut
            self.enter_hard_cut(SafetyEventKind::CeilingLowered, None, self.last_now_ms);
        }
        self.ceiling = ceiling;
    }

    pub fn reconfigure(
        &mut self,
        config: GovernorConfig,
        confidence_threshold: u16,
        cycle_period_ms: u32,
    ) {
        self.config = config;
        self.confidence_threshold = confidence_threshold;
        self.cycle_period_ms = cycle_period_ms;
        self.previous_pressures = None;
    }

    /// Configured ceiling less the margin for the active bucket. Only
    /// buckets with learned confidence may use the narrow margin.
    pub fn effective_ceiling_kpa(&self, bucket_confidence: u16) -> f32 {
        let margin = if bucket_confidence >= self.confidence_threshold {
            self.config.confident_margin_kpa
        } else {
            self.config.conservative_margin_kpa
        };
        self.ceiling.tightened(margin)
    }

    pub fn evaluate(
        &mut self,
        desired_level: f32,
        snapshot: &SensorSnapshot,
        bucket_confidence: u16,
        now_ms: u32,
    ) -> GovernorVerdict {
        self.last_now_ms = now_ms;
        let effective_ceiling_kpa = self.effective_ceiling_kpa(bucket_confidence);
        let mut verdict = GovernorVerdict {
            state: GovernorState::HardCut,
            allowed_level: 0.0,
            governed_level: 0.0,
            predicted_kpa: None,
            effective_ceiling_kpa,
            sensor_invalid: false,
            overboost_measured: false,
        };

        let pressures = match Self::valid_pressures(snapshot) {
            Some(pressures) => pressures,
            None => {
                if let Some((channel, fault)) = snapshot.first_fault() {
                    if self.state != GovernorState::HardCut {
                        warn!(%channel, ?fault, "pressure reading invalid, cutting boost");
                    }
                }
                self.enter_hard_cut(SafetyEventKind::SensorInvalid, None, now_ms);
                self.previous_pressures = None;
                verdict.sensor_invalid = true;
                return self.finish(verdict);
            }
        };

        let measured_kpa = pressures.iter().cloned().fold(f32::MIN, f32::max);
        let predicted_kpa = self.predict(&pressures, now_ms);
        self.previous_pressures = Some((pressures, now_ms));
        verdict.predicted_kpa = Some(predicted_kpa);

        if measured_kpa > self.ceiling.kpa() {
            if self.state != GovernorState::HardCut {
                warn!(
                    measured_kpa,
                    ceiling_kpa = self.ceiling.kpa(),
                    "overboost measured, cutting boost"
                );
            }
            self.enter_hard_cut(SafetyEventKind::OverboostMeasured, Some(measured_kpa), now_ms);
            verdict.overboost_measured = true;
            return self.finish(verdict);
        }

        if self.state == GovernorState::HardCut {
            let recovery_kpa = self.ceiling.tightened(self.config.recovery_hysteresis_kpa);
            let recovered = self.recovery.condition_exceeded_duration(
                measured_kpa < recovery_kpa,
                self.config.recovery_hold_ms,
                now_ms,
            );
            if !recovered {
                return self.finish(verdict);
            }
            self.recovery.reset();
            self.state = GovernorState::Nominal;
            self.history.resolve(now_ms);
            info!(measured_kpa, "pressure recovered, leaving hard cut");
        }

        let taper_start_kpa = effective_ceiling_kpa - self.config.taper_band_kpa;
        if predicted_kpa >= taper_start_kpa {
            if self.state != GovernorState::Tapering {
                self.taper_reference = self.last_governed;
                self.state = GovernorState::Tapering;
                self.history
                    .record(SafetyEventKind::OverboostPredicted, Some(predicted_kpa), now_ms);
                info!(
                    predicted_kpa,
                    effective_ceiling_kpa,
                    reference = self.taper_reference,
                    "overboost predicted, tapering"
                );
            }
            let fraction = num::clamp(
                (effective_ceiling_kpa - predicted_kpa) / self.config.taper_band_kpa,
                0.0,
                1.0,
            );
            verdict.allowed_level = (self.taper_reference * fraction).min(self.last_governed);
        } else {
            if self.state == GovernorState::Tapering {
                self.history.resolve(now_ms);
                info!(predicted_kpa, "pressure trend clear, leaving taper");
            }
            self.state = GovernorState::Nominal;
            verdict.allowed_level = 100.0;
        }

        verdict.state = self.state;
        verdict.governed_level = if desired_level.is_nan() {
            0.0
        } else {
            num::clamp(desired_level, 0.0, verdict.allowed_level)
        };

        self.finish(verdict)
    }

    fn finish(&mut self, verdict: GovernorVerdict) -> GovernorVerdict {
        self.last_governed = verdict.governed_level;
        verdict
    }

    fn enter_hard_cut(&mut self, kind: SafetyEventKind, trigger_kpa: Option<f32>, now_ms: u32) {
        if self.state != GovernorState::HardCut {
            info!(?kind, "governor entering hard cut");
            self.history.record(kind, trigger_kpa, now_ms);
        }
        self.state = GovernorState::HardCut;
        self.taper_reference = 0.0;
        self.last_governed = 0.0;
        self.recovery.reset();
    }

    fn valid_pressures(snapshot: &SensorSnapshot) -> Option<[f32; 3]> {
        if snapshot.all_valid() {
            Some([
                snapshot.manifold.kpa,
                snapshot.upper_dome.kpa,
                snapshot.lower_dome.kpa,
            ])
        } else {
            None
        }
    }

    /// Peak of each channel extrapolated along its rising trend.
    fn predict(&self, pressures: &[f32; 3], now_ms: u32) -> f32 {
        let lookahead_s =
            (self.config.prediction_horizon_cycles * self.cycle_period_ms) as f32 / 1000.0;

        let previous = self.previous_pressures.and_then(|(prev, at_ms)| {
            let dt_ms = elapsed_ms(now_ms, at_ms);
            if dt_ms == 0 || dt_ms > 10 * self.cycle_period_ms {
                None
            } else {
                Some((prev, dt_ms as f32 / 1000.0))
            }
        });

        pressures
            .iter()
            .enumerate()
            .map(|(i, p)| match previous {
                Some((prev, dt_s)) => {
                    let rate = ((p - prev[i]) / dt_s).max(0.0);
                    p + rate * lookahead_s
                }
                None => *p,
            })
            .fold(f32::MIN, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PressureReading, SensorFault};

    const PERIOD: u32 = 10;

    fn governor(ceiling_kpa: f32) -> Governor {
        Governor::new(
            GovernorConfig::default(),
            SafetyCeiling::new(ceiling_kpa).unwrap(),
            200,
            PERIOD,
        )
    }

    fn snapshot(kpa: f32) -> SensorSnapshot {
        SensorSnapshot {
            manifold: PressureReading::valid(kpa, 0),
            upper_dome: PressureReading::valid(kpa, 0),
            lower_dome: PressureReading::valid(kpa, 0),
        }
    }

    /// Runs low steady pressure long enough to release the boot cut.
    fn warmed_up(ceiling_kpa: f32) -> (Governor, u32) {
        let mut g = governor(ceiling_kpa);
        let mut now = 0;
        while g.state() == GovernorState::HardCut {
            g.evaluate(50.0, &snapshot(10.0), 0, now);
            now += PERIOD;
            assert!(now < 1000);
        }
        (g, now)
    }

    #[test]
    fn boots_in_hard_cut() {
        let mut g = governor(100.0);
        let v = g.evaluate(50.0, &snapshot(10.0), 0, 0);
        assert_eq!(v.state, GovernorState::HardCut);
        assert_eq!(v.governed_level, 0.0);
    }

    #[test]
    fn recovery_requires_hold_time() {
        let mut g = governor(100.0);
        let hold = GovernorConfig::default().recovery_hold_ms;
        let mut now = 0;
        while now < hold {
            assert_eq!(g.evaluate(50.0, &snapshot(10.0), 0, now).state, GovernorState::HardCut);
            now += PERIOD;
        }
        let v = g.evaluate(50.0, &snapshot(10.0), 0, now);
        assert_eq!(v.state, GovernorState::Nominal);
        assert_eq!(v.governed_level, 50.0);
    }

    #[test]
    fn recovery_needs_hysteresis() {
        let mut g = governor(100.0);
        let near = 100.0 - GovernorConfig::default().recovery_hysteresis_kpa + 0.5;
        for i in 0..100 {
            let v = g.evaluate(50.0, &snapshot(near), 0, i * PERIOD);
            assert_eq!(v.state, GovernorState::HardCut);
        }
    }

    #[test]
    fn invalid_sensor_cuts_immediately() {
        let (mut g, now) = warmed_up(100.0);
        let mut s = snapshot(10.0);
        s.upper_dome = PressureReading::invalid(SensorFault::ElectricalRange, now);
        let v = g.evaluate(80.0, &s, 0, now);
        assert_eq!(v.state, GovernorState::HardCut);
        assert!(v.sensor_invalid);
        assert_eq!(v.governed_level, 0.0);
    }

    #[test]
    fn measured_overboost_cuts_immediately() {
        let (mut g, now) = warmed_up(100.0);
        let v = g.evaluate(80.0, &snapshot(100.5), 0, now);
        assert_eq!(v.state, GovernorState::HardCut);
        assert!(v.overboost_measured);
        assert_eq!(v.governed_level, 0.0);
    }

    #[test]
    fn nominal_clamps_desired() {
        let (mut g, now) = warmed_up(100.0);
        assert_eq!(g.evaluate(150.0, &snapshot(10.0), 0, now).governed_level, 100.0);
        assert_eq!(
            g.evaluate(-5.0, &snapshot(10.0), 0, now + PERIOD).governed_level,
            0.0
        );
        assert_eq!(
            g.evaluate(f32::NAN, &snapshot(10.0), 0, now + 2 * PERIOD)
                .governed_level,
            0.0
        );
    }

    #[test]
    fn confidence_gates_margin() {
        let g = governor(100.0);
        let config = GovernorConfig::default();
        assert_eq!(g.effective_ceiling_kpa(0), 100.0 - config.conservative_margin_kpa);
        assert_eq!(g.effective_ceiling_kpa(200), 100.0 - config.confident_margin_kpa);
        assert!(g.effective_ceiling_kpa(u16::MAX) <= 100.0);
    }

    #[test]
    fn rising_trend_tapers_before_limit() {
        let (mut g, mut now) = warmed_up(137.9);
        let mut pressure = 10.0;
        let mut last = 60.0;
        let mut tapered = false;
        while pressure < 137.9 {
            now += PERIOD;
            pressure += 4.0;
            let v = g.evaluate(60.0, &snapshot(pressure), 0, now);
            if v.state == GovernorState::Tapering {
                tapered = true;
                assert!(v.governed_level <= last);
            }
            if tapered {
                assert_ne!(v.state, GovernorState::Nominal);
            }
            last = v.governed_level;
        }
        assert!(tapered);
        assert_eq!(last, 0.0);
    }

    #[test]
    fn predicted_at_effective_ceiling_allows_nothing() {
        let (mut g, now) = warmed_up(100.0);
        let effective = g.effective_ceiling_kpa(0);
        let v = g.evaluate(80.0, &snapshot(effective), 0, now);
        assert_eq!(v.state, GovernorState::Tapering);
        assert_eq!(v.allowed_level, 0.0);
        assert_eq!(v.governed_level, 0.0);
    }

    #[test]
    fn lowered_ceiling_cuts() {
        let (mut g, now) = warmed_up(137.9);
        g.set_ceiling(SafetyCeiling::new(100.0).unwrap());
        assert_eq!(g.state(), GovernorState::HardCut);
        let event = g.safety_events().last().copied().unwrap();
        assert_eq!(event.kind, SafetyEventKind::CeilingLowered);
        assert_eq!(event.timestamp_ms, now - PERIOD);
    }

    #[test]
    fn boot_cut_is_not_recorded() {
        let (g, _) = warmed_up(100.0);
        assert_eq!(g.safety_events().count(), 0);
        assert_eq!(g.safety_diagnostics(), SafetyDiagnostics::default());
    }

    #[test]
    fn history_records_cut_and_recovery() {
        let (mut g, mut now) = warmed_up(100.0);
        let cut_at = now;
        g.evaluate(80.0, &snapshot(104.0), 0, now);
        // repeated overboost inside the same cut is one event
        now += PERIOD;
        g.evaluate(80.0, &snapshot(106.0), 0, now);
        while g.state() == GovernorState::HardCut {
            now += PERIOD;
            g.evaluate(80.0, &snapshot(10.0), 0, now);
            assert!(now < cut_at + 1000);
        }

        let d = g.safety_diagnostics();
        assert_eq!(d.hard_cuts, 1);
        assert_eq!(d.overboost_cuts, 1);
        assert_eq!(d.recoveries, 1);
        assert_eq!(d.average_recovery_ms, Some((now - cut_at) as f32));

        let events: Vec<SafetyEvent> = g.safety_events().copied().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SafetyEventKind::OverboostMeasured);
        assert_eq!(events[0].trigger_kpa, Some(104.0));
        assert_eq!(events[0].recovered_after_ms, Some(now - cut_at));
    }

    #[test]
    fn history_records_taper() {
        let (mut g, now) = warmed_up(100.0);
        let effective = g.effective_ceiling_kpa(0);
        g.evaluate(80.0, &snapshot(effective - 1.0), 0, now);
        g.evaluate(80.0, &snapshot(10.0), 0, now + PERIOD);
        assert_eq!(g.state(), GovernorState::Nominal);

        let d = g.safety_diagnostics();
        assert_eq!((d.tapers, d.hard_cuts), (1, 0));
        let event = g.safety_events().next().copied().unwrap();
        assert_eq!(event.kind, SafetyEventKind::OverboostPredicted);
        assert_eq!(event.recovered_after_ms, Some(PERIOD));
    }
}
