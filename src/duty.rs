//! Solenoid duty synthesis
//!
//! Turns the governed level into the command handed to the PWM driver.
//! Rises are slew limited. Falls follow the governed level at once and a
//! hard cut lands on 0 % in the same cycle.
//!
//! In `Nominal` the command carries a zero-mean amplitude dither and a
//! random update phase so the solenoid does not lock into a beat with
//! other periodic loops on the vehicle.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::DutyConfig;
use crate::control::ResponseProfile;
use crate::governor::GovernorState;

/// Solenoid duty in percent, always within [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct DutyCommand(f32);

impl DutyCommand {
    pub const FAIL_SAFE: DutyCommand = DutyCommand(0.0);

    pub fn from_percent(percent: f32) -> Self {
        if percent.is_nan() {
            DutyCommand::FAIL_SAFE
        } else {
            DutyCommand(num::clamp(percent, 0.0, 100.0))
        }
    }

    pub fn percent(self) -> f32 {
        self.0
    }

    pub fn is_fail_safe(self) -> bool {
        self.0 == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DutyUpdate {
    pub command: DutyCommand,
    /// Delay of this update within the PWM period. \[microseconds\]
    pub phase_offset_us: u32,
}

impl DutyUpdate {
    pub const FAIL_SAFE: DutyUpdate = DutyUpdate {
        command: DutyCommand::FAIL_SAFE,
        phase_offset_us: 0,
    };
}

/// Second half of a dither pair still to be applied.
#[derive(Debug, Clone, Copy)]
struct PendingDither {
    offset: f32,
}

pub struct DutySynthesizer {
    config: DutyConfig,
    pwm_period_us: u32,
    slew_up_pct_per_cycle: f32,
    slewed: f32,
    pending: Option<PendingDither>,
    rng: ChaCha8Rng,
}

impl DutySynthesizer {
    pub fn new(config: DutyConfig, pwm_period_us: u32, profile: &ResponseProfile) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.dither_seed);
        DutySynthesizer {
            config,
            pwm_period_us,
            slew_up_pct_per_cycle: profile.slew_up_pct_per_cycle,
            slewed: 0.0,
            pending: None,
            rng,
        }
    }

    pub fn reconfigure(&mut self, config: DutyConfig, pwm_period_us: u32) {
        self.rng = ChaCha8Rng::seed_from_u64(config.dither_seed);
        self.config = config;
        self.pwm_period_us = pwm_period_us;
        self.pending = None;
    }

    pub fn set_profile(&mut self, profile: &ResponseProfile) {
        self.slew_up_pct_per_cycle = profile.slew_up_pct_per_cycle;
    }

    /// Slewed level before dither. \[% duty\]
    pub fn slewed_level(&self) -> f32 {
        self.slewed
    }

    pub fn synthesize(&mut self, governed: Option<f32>, state: GovernorState) -> DutyUpdate {
        let governed = match governed {
            Some(level) if level > 0.0 && state != GovernorState::HardCut => level.min(100.0),
            // upstream fault, hard cut or nothing to do: no slewing on the
            // way down
            _ => {
                self.slewed = 0.0;
                self.pending = None;
                return DutyUpdate::FAIL_SAFE;
            }
        };

        let rise = self.slewed + self.slew_up_pct_per_cycle;
        self.slewed = rise.min(governed);

        if state != GovernorState::Nominal {
            self.pending = None;
            return DutyUpdate {
                command: DutyCommand::from_percent(self.slewed),
                phase_offset_us: 0,
            };
        }

        let dithered = self.slewed + self.next_dither(governed);
        let phase_offset_us = if self.pwm_period_us > 0 {
            self.rng.gen_range(0..self.pwm_period_us)
        } else {
            0
        };

        DutyUpdate {
            command: DutyCommand::from_percent(dithered.min(governed)),
            phase_offset_us,
        }
    }

    fn next_dither(&mut self, governed: f32) -> f32 {
        let base = self.slewed;
        let headroom = base.min(100.0 - base).min(governed - base).max(0.0);

        match self.pending.take() {
            Some(pending) => {
                // bounds win if the base moved since the pair started
                num::clamp(pending.offset, -headroom, headroom)
            }
            None => {
                let amplitude = self.config.dither_amplitude_pct.min(headroom);
                if amplitude <= 0.0 {
                    return 0.0;
                }
                let offset = if self.rng.gen_bool(0.5) {
                    amplitude
                } else {
                    -amplitude
                };
                self.pending = Some(PendingDither { offset: -offset });
                offset
            }
        }
    }
}
