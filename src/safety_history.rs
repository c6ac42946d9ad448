use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::ms_timer::elapsed_ms;
use crate::tuning::SAFETY_HISTORY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEventKind {
    SensorInvalid,
    OverboostMeasured,
    OverboostPredicted,
    CeilingLowered,
}

impl SafetyEventKind {
    pub fn is_cut(self) -> bool {
        self != SafetyEventKind::OverboostPredicted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub timestamp_ms: u32,
    pub kind: SafetyEventKind,
    /// Pressure behind the event, when one was read. \[kPa\]
    pub trigger_kpa: Option<f32>,
    /// Time until the governor was back to nominal. \[milliseconds\]
    pub recovered_after_ms: Option<u32>,
}

/// Counters over the lifetime of the governor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyDiagnostics {
    pub hard_cuts: u32,
    pub overboost_cuts: u32,
    pub sensor_cuts: u32,
    pub tapers: u32,
    pub recoveries: u32,
    /// Mean hard cut duration over completed recoveries. \[milliseconds\]
    pub average_recovery_ms: Option<f32>,
    pub last_event_ms: Option<u32>,
}

/// Bounded record of governor interventions.
#[derive(Debug, Clone)]
pub struct SafetyHistory {
    events: VecDeque<SafetyEvent>,
    capacity: usize,
    diagnostics: SafetyDiagnostics,
    total_recovery_ms: u64,
    cut_started_ms: Option<u32>,
}

impl Default for SafetyHistory {
    fn default() -> Self {
        SafetyHistory::with_capacity(SAFETY_HISTORY_LEN)
    }
}

impl SafetyHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        SafetyHistory {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            diagnostics: SafetyDiagnostics::default(),
            total_recovery_ms: 0,
            cut_started_ms: None,
        }
    }

    pub fn record(&mut self, kind: SafetyEventKind, trigger_kpa: Option<f32>, now_ms: u32) {
        let d = &mut self.diagnostics;
        match kind {
            SafetyEventKind::OverboostPredicted => d.tapers = d.tapers.saturating_add(1),
            SafetyEventKind::OverboostMeasured => {
                d.overboost_cuts = d.overboost_cuts.saturating_add(1)
            }
            SafetyEventKind::SensorInvalid => d.sensor_cuts = d.sensor_cuts.saturating_add(1),
            SafetyEventKind::CeilingLowered => (),
        }
        if kind.is_cut() {
            d.hard_cuts = d.hard_cuts.saturating_add(1);
            self.cut_started_ms = Some(now_ms);
        }
        d.last_event_ms = Some(now_ms);

        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(SafetyEvent {
            timestamp_ms: now_ms,
            kind,
            trigger_kpa,
            recovered_after_ms: None,
        });
    }

    /// The governor is back to nominal. Closes every open event and, when
    /// leaving a recorded cut, counts the recovery time.
    pub fn resolve(&mut self, now_ms: u32) {
        for event in self.events.iter_mut().filter(|e| e.recovered_after_ms.is_none()) {
            event.recovered_after_ms = Some(elapsed_ms(now_ms, event.timestamp_ms));
        }

        if let Some(started_ms) = self.cut_started_ms.take() {
            let d = &mut self.diagnostics;
            d.recoveries = d.recoveries.saturating_add(1);
            self.total_recovery_ms += u64::from(elapsed_ms(now_ms, started_ms));
            d.average_recovery_ms = Some(self.total_recovery_ms as f32 / d.recoveries as f32);
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &SafetyEvent> {
        self.events.iter()
    }

    pub fn diagnostics(&self) -> SafetyDiagnostics {
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_cuts_and_recovery_time() {
        let mut h = SafetyHistory::default();
        h.record(SafetyEventKind::OverboostMeasured, Some(140.0), 1000);
        h.resolve(1150);
        h.record(SafetyEventKind::SensorInvalid, None, 2000);
        h.resolve(2250);

        let d = h.diagnostics();
        assert_eq!(d.hard_cuts, 2);
        assert_eq!(d.overboost_cuts, 1);
        assert_eq!(d.sensor_cuts, 1);
        assert_eq!(d.recoveries, 2);
        assert_eq!(d.average_recovery_ms, Some(200.0));
        assert_eq!(d.last_event_ms, Some(2000));

        let recovered: Vec<_> = h.events().map(|e| e.recovered_after_ms).collect();
        assert_eq!(recovered, vec![Some(150), Some(250)]);
    }

    #[test]
    fn taper_is_not_a_cut() {
        let mut h = SafetyHistory::default();
        h.record(SafetyEventKind::OverboostPredicted, Some(120.0), 10);
        h.resolve(40);
        let d = h.diagnostics();
        assert_eq!((d.tapers, d.hard_cuts, d.recoveries), (1, 0, 0));
        assert_eq!(d.average_recovery_ms, None);
        assert_eq!(h.events().next().unwrap().recovered_after_ms, Some(30));
    }

    #[test]
    fn oldest_events_dropped() {
        let mut h = SafetyHistory::with_capacity(4);
        for i in 0..10 {
            h.record(SafetyEventKind::CeilingLowered, None, i * 10);
        }
        let stamps: Vec<_> = h.events().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![60, 70, 80, 90]);
        assert_eq!(h.diagnostics().hard_cuts, 10);
    }
}
