//! Self-learning trim engine
//!
//! Sole mutator of the trim table. Trims move slowly towards closing the
//! torque gap and never leave the configured bound.

use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::error::BoostError;
use crate::governor::GovernorState;
use crate::trim_table::{OperatingBucket, TrimTable};
use crate::tuning::CONFIDENCE_MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnOutcome {
    /// Not a learning cycle, or conditions did not allow learning.
    Skipped,
    /// Confidence and sample counters updated, trim untouched.
    Observed,
    Nudged { delta: f32, version: u32 },
    /// The entry already sits at the bound and the nudge pointed outward.
    BoundViolationAttempt {
        bucket: OperatingBucket,
        requested: f32,
    },
}

impl LearnOutcome {
    /// Absolute trim change applied by this observation.
    pub fn delta(&self) -> f32 {
        match self {
            LearnOutcome::Nudged { delta, .. } => delta.abs(),
            _ => 0.0,
        }
    }
}

pub struct TrimEngine {
    config: LearningConfig,
    table: TrimTable,
    cycles: u32,
}

impl TrimEngine {
    pub fn new(config: LearningConfig, table: TrimTable) -> Self {
        TrimEngine {
            config,
            table,
            cycles: 0,
        }
    }

    pub fn reconfigure(&mut self, config: LearningConfig) {
        self.config = config;
        // a tighter bound pulls existing trims in
        let bound = self.config.trim_bound;
        let mut changed = false;
        for entry in self.table.entries.iter_mut() {
            let clamped = num::clamp(entry.trim, -bound, bound);
            if clamped != entry.trim {
                entry.trim = clamped;
                changed = true;
            }
        }
        if changed {
            self.table.version = self.table.version.wrapping_add(1);
        }
    }

    pub fn snapshot(&self) -> TrimTable {
        self.table
    }

    pub fn confidence(&self, bucket: OperatingBucket) -> u16 {
        self.table[bucket].confidence
    }

    pub fn observe(
        &mut self,
        bucket: OperatingBucket,
        gap: Option<f32>,
        state: GovernorState,
        authority: bool,
        dt: f32,
    ) -> LearnOutcome {
        self.cycles = self.cycles.wrapping_add(1);
        if self.cycles % self.config.learning_decimation.max(1) != 0 {
            return LearnOutcome::Skipped;
        }

        let gap = match gap {
            // only gaps the output could act on
            Some(gap) if authority && state == GovernorState::Nominal && gap.is_finite() => gap,
            _ => return LearnOutcome::Skipped,
        };

        let c = &self.config;
        let entry = &mut self.table[bucket];
        entry.samples = entry.samples.saturating_add(1);

        let magnitude = gap.abs();
        if magnitude <= c.low_error_pct {
            entry.confidence = entry.confidence.saturating_add(1).min(CONFIDENCE_MAX);
        } else if magnitude >= c.large_deviation_pct {
            if entry.confidence >= c.confidence_threshold {
                debug!(%bucket, gap, "large deviation, bucket confidence discarded");
            }
            entry.confidence = 0;
        }

        if magnitude <= c.deadband_pct {
            self.table.version = self.table.version.wrapping_add(1);
            return LearnOutcome::Observed;
        }

        let limit = c.max_trim_rate_per_s * dt * c.learning_decimation as f32;
        let nudge = num::clamp(c.learning_rate * gap, -limit, limit);
        let bound = c.trim_bound;
        let current = entry.trim;

        let outward = (current >= bound && nudge > 0.0) || (current <= -bound && nudge < 0.0);
        if outward {
            self.table.version = self.table.version.wrapping_add(1);
            return LearnOutcome::BoundViolationAttempt {
                bucket,
                requested: current + nudge,
            };
        }

        let next = num::clamp(current + nudge, -bound, bound);
        entry.trim = next;
        self.table.version = self.table.version.wrapping_add(1);

        LearnOutcome::Nudged {
            delta: next - current,
            version: self.table.version,
        }
    }

    /// Replaces the table after checking every entry against the bound.
    pub fn import(&mut self, table: TrimTable) -> Result<(), BoostError> {
        if let Some((bucket, trim)) = table.first_out_of_bounds(self.config.trim_bound) {
            warn!(%bucket, trim, "rejected trim table import");
            return Err(BoostError::TrimBoundViolation {
                bucket,
                requested: trim,
                bound: self.config.trim_bound,
            });
        }

        let version = self.table.version.max(table.version).wrapping_add(1);
        self.table = table;
        self.table.version = version;
        info!(version, "trim table imported");
        Ok(())
    }

    /// Clears all learned trims and confidence.
    pub fn reset(&mut self) {
        let version = self.table.version.wrapping_add(1);
        self.table = TrimTable::new();
        self.table.version = version;
        info!(version, "learned trims reset");
    }

    /// Fraction of buckets whose confidence reached the threshold.
    pub fn overall_confidence(&self) -> f32 {
        let confident = self
            .table
            .entries
            .iter()
            .filter(|e| e.confidence >= self.config.confidence_threshold)
            .count();
        confident as f32 / self.table.entries.len() as f32
    }
}
