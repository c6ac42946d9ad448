//! Torque-following control loop
//!
//! Turns the gap between requested and delivered torque into a desired
//! actuation level. The level is left unclamped; the governor bounds it.

use serde::{Deserialize, Serialize};

use crate::config::{ControlConfig, DutyConfig};
use crate::pid::Pid;
use crate::trim_table::OperatingBucket;
use crate::types::{AggressionLevel, TorqueStatus};

/// Parameters derived from the aggression level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseProfile {
    pub aggression: f32,
    pub assist_gain: f32,
    /// Rise limit of the duty command. \[% duty / cycle\]
    pub slew_up_pct_per_cycle: f32,
}

impl ResponseProfile {
    pub fn from_aggression(
        aggression: AggressionLevel,
        control: &ControlConfig,
        duty: &DutyConfig,
    ) -> Self {
        let a = aggression.value();
        ResponseProfile {
            aggression: a,
            assist_gain: control.assist_gain_max * a,
            slew_up_pct_per_cycle: duty.slew_up_min_pct_per_cycle
                + a * (duty.slew_up_max_pct_per_cycle - duty.slew_up_min_pct_per_cycle),
        }
    }

    pub fn assists(&self) -> bool {
        self.assist_gain > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlOutput {
    /// Unclamped desired actuation level. \[% duty\]
    pub desired_level: f32,
    /// Requested minus delivered torque, when the request is fresh. \[%\]
    pub torque_gap: Option<f32>,
    pub bucket: OperatingBucket,
    /// The output could move toward closing the gap this cycle.
    pub authority: bool,
}

impl ControlOutput {
    pub const fn fail_safe(bucket: OperatingBucket) -> Self {
        ControlOutput {
            desired_level: 0.0,
            torque_gap: None,
            bucket,
            authority: false,
        }
    }
}

pub struct TorqueFollower {
    pid: Pid,
    output_ceiling: f32,
}

impl TorqueFollower {
    pub fn new(config: &ControlConfig) -> Self {
        TorqueFollower {
            pid: Pid::new(
                config.proportional_gain,
                config.integral_gain,
                config.integral_windup_guard,
            ),
            output_ceiling: 0.0,
        }
    }

    pub fn reconfigure(&mut self, config: &ControlConfig) {
        self.pid.set_gains(
            config.proportional_gain,
            config.integral_gain,
            config.integral_windup_guard,
        );
    }

    /// Highest level the governor allowed on the previous cycle.
    pub fn set_output_ceiling(&mut self, allowed_level: f32) {
        self.output_ceiling = if allowed_level.is_nan() {
            0.0
        } else {
            num::clamp(allowed_level, 0.0, 100.0)
        };
    }

    pub fn output_ceiling(&self) -> f32 {
        self.output_ceiling
    }

    pub fn integral(&self) -> f32 {
        self.pid.integral()
    }

    pub fn zeroize(&mut self) {
        self.pid.zeroize();
    }

    pub fn update(
        &mut self,
        torque: &TorqueStatus,
        profile: &ResponseProfile,
        trim: f32,
        bucket: OperatingBucket,
        dt: f32,
    ) -> ControlOutput {
        let request = match torque.fresh() {
            Some(request) => request,
            None => {
                // never assist blind
                self.pid.zeroize();
                return ControlOutput::fail_safe(bucket);
            }
        };

        let gap = request.gap_pct();

        if !profile.assists() {
            self.pid.zeroize();
            return ControlOutput {
                desired_level: 0.0,
                torque_gap: Some(gap),
                bucket,
                authority: false,
            };
        }

        let scale = profile.assist_gain * (1.0 + trim);

        // conditional integration: hold the integral while the output is
        // pinned against a limit in the direction of the error
        let provisional = scale * self.pid.peek(gap);
        let saturated = (provisional >= self.output_ceiling && gap > 0.0)
            || (provisional <= 0.0 && gap < 0.0);

        let desired_level = match self.pid.update(gap, dt, !saturated) {
            Some(control) => scale * control,
            None => 0.0,
        };

        ControlOutput {
            desired_level,
            torque_gap: Some(gap),
            bucket,
            authority: !saturated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TorqueRequest;

    fn fresh(demand: f32, delivered: f32) -> TorqueStatus {
        TorqueStatus::Fresh(TorqueRequest {
            demand_pct: demand,
            delivered_pct: delivered,
            engine_rpm: 3000,
            timestamp_ms: 0,
        })
    }

    fn profile(aggression: f32) -> ResponseProfile {
        ResponseProfile::from_aggression(
            AggressionLevel::new(aggression).unwrap(),
            &ControlConfig::default(),
            &DutyConfig::default(),
        )
    }

    #[test]
    fn profile_scales_with_aggression() {
        let off = profile(0.0);
        let full = profile(1.0);
        let duty = DutyConfig::default();
        assert_eq!(off.assist_gain, 0.0);
        assert_eq!(off.slew_up_pct_per_cycle, duty.slew_up_min_pct_per_cycle);
        assert_eq!(full.assist_gain, ControlConfig::default().assist_gain_max);
        assert_eq!(full.slew_up_pct_per_cycle, duty.slew_up_max_pct_per_cycle);
        assert!(profile(0.5).assist_gain < full.assist_gain);
    }

    #[test]
    fn positive_gap_requests_assist() {
        let mut loop_ = TorqueFollower::new(&ControlConfig::default());
        loop_.set_output_ceiling(100.0);
        let out = loop_.update(&fresh(50.0, 40.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        assert!(out.desired_level > 0.0);
        assert_eq!(out.torque_gap, Some(10.0));
    }

    #[test]
    fn zero_aggression_never_assists() {
        let mut loop_ = TorqueFollower::new(&ControlConfig::default());
        loop_.set_output_ceiling(100.0);
        for _ in 0..100 {
            let out =
                loop_.update(&fresh(50.0, 0.0), &profile(0.0), 0.25, OperatingBucket::IDLE, 0.01);
            assert_eq!(out.desired_level, 0.0);
            assert!(!out.authority);
        }
        assert_eq!(loop_.integral(), 0.0);
    }

    #[test]
    fn stale_torque_fails_safe_and_zeroizes() {
        let mut loop_ = TorqueFollower::new(&ControlConfig::default());
        loop_.set_output_ceiling(100.0);
        loop_.update(&fresh(80.0, 10.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        assert!(loop_.integral() > 0.0);

        let out = loop_.update(
            &TorqueStatus::Stale { age_ms: 30 },
            &profile(1.0),
            0.0,
            OperatingBucket::IDLE,
            0.01,
        );
        assert_eq!(out.desired_level, 0.0);
        assert_eq!(out.torque_gap, None);
        assert_eq!(loop_.integral(), 0.0);
    }

    #[test]
    fn trim_biases_output() {
        let mut plain = TorqueFollower::new(&ControlConfig::default());
        let mut trimmed = TorqueFollower::new(&ControlConfig::default());
        plain.set_output_ceiling(100.0);
        trimmed.set_output_ceiling(100.0);
        let a = plain.update(&fresh(50.0, 45.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        let b = trimmed.update(&fresh(50.0, 45.0), &profile(1.0), 0.2, OperatingBucket::IDLE, 0.01);
        assert!((b.desired_level - a.desired_level * 1.2).abs() < 1e-4);
    }

    #[test]
    fn integral_held_while_cut() {
        let mut loop_ = TorqueFollower::new(&ControlConfig::default());
        // governor allowed nothing last cycle
        loop_.set_output_ceiling(0.0);
        for _ in 0..50 {
            let out =
                loop_.update(&fresh(90.0, 10.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
            assert!(!out.authority);
        }
        assert_eq!(loop_.integral(), 0.0);

        loop_.set_output_ceiling(100.0);
        let out = loop_.update(&fresh(90.0, 85.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        assert!(out.authority);
    }

    #[test]
    fn integral_unwinds_when_not_saturated() {
        let mut loop_ = TorqueFollower::new(&ControlConfig::default());
        loop_.set_output_ceiling(100.0);
        loop_.update(&fresh(60.0, 50.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        let wound = loop_.integral();
        loop_.update(&fresh(50.0, 49.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        assert!(loop_.integral() > wound);
    }

    #[test]
    fn integral_held_at_lower_limit() {
        let mut loop_ = TorqueFollower::new(&ControlConfig::default());
        loop_.set_output_ceiling(100.0);
        loop_.update(&fresh(60.0, 50.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        let wound = loop_.integral();
        // delivered above requested drives the output below zero
        let out = loop_.update(&fresh(50.0, 70.0), &profile(1.0), 0.0, OperatingBucket::IDLE, 0.01);
        assert!(out.desired_level < 0.0);
        assert_eq!(loop_.integral(), wound);
    }
}
