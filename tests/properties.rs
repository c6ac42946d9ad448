mod common;

use proptest::prelude::*;

use boostcc::config::LearningConfig;
use boostcc::controller::CycleInputs;
use boostcc::governor::GovernorState;
use boostcc::learning::TrimEngine;
use boostcc::trim_table::{OperatingBucket, TrimTable};
use boostcc::BoostController;

use common::*;

#[derive(Debug, Clone, Copy)]
enum Fault {
    ChannelDown,
    BelowWindow(u16),
    AboveWindow(u16),
    Stale(u32),
}

fn faults() -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::ChannelDown),
        (0u16..250).prop_map(Fault::BelowWindow),
        (4751u16..=5000).prop_map(Fault::AboveWindow),
        (51u32..10_000).prop_map(Fault::Stale),
    ]
}

fn inject(inputs: &mut CycleInputs, channel: usize, fault: Fault) {
    let now_ms = inputs.now_ms;
    let sample = match channel {
        0 => &mut inputs.pressures.manifold,
        1 => &mut inputs.pressures.upper_dome,
        _ => &mut inputs.pressures.lower_dome,
    };
    match fault {
        Fault::ChannelDown => sample.channel_ok = false,
        Fault::BelowWindow(mv) | Fault::AboveWindow(mv) => sample.millivolts = mv,
        Fault::Stale(age_ms) => sample.timestamp_ms = now_ms.wrapping_sub(age_ms),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn trims_stay_within_bound(
        gaps in prop::collection::vec(-100.0f32..100.0, 1..600),
        rpm in 0u16..8000,
        load in 0.0f32..100.0,
    ) {
        let config = LearningConfig::default();
        let bound = config.trim_bound;
        let mut engine = TrimEngine::new(config, TrimTable::new());
        let bucket = OperatingBucket::from_operating_point(rpm, load);

        for gap in gaps {
            engine.observe(bucket, Some(gap), GovernorState::Nominal, true, 0.01);
            let trim = engine.snapshot()[bucket].trim;
            prop_assert!(trim.abs() <= bound, "trim {} beyond {}", trim, bound);
        }
    }

    #[test]
    fn invalid_reading_forces_zero_duty(
        aggression in 0.0f32..=1.0,
        demand in 0.0f32..=100.0,
        delivered in 0.0f32..=100.0,
        channel in 0usize..3,
        fault in faults(),
    ) {
        let mut c = controller(aggression);
        let now_ms = warm_up(&mut c, demand, delivered);

        let mut inputs = steady(now_ms, 10.0, demand, delivered);
        inject(&mut inputs, channel, fault);
        let r = step(&mut c, &inputs);
        prop_assert!(r.duty.command.is_fail_safe());
        prop_assert_eq!(r.verdict.state, GovernorState::HardCut);
    }

    #[test]
    fn at_or_above_effective_ceiling_duty_is_zero(
        demand in 0.0f32..=100.0,
        delivered in 0.0f32..=100.0,
        over in 0.1f32..100.0,
    ) {
        let config = config(1.0);
        let bound = config.learning.trim_bound;
        let mut trims = TrimTable::new();
        for entry in trims.entries.iter_mut() {
            entry.trim = bound;
        }
        let mut c = BoostController::new(config, trims).unwrap();
        let now_ms = warm_up(&mut c, demand, delivered);

        let effective = c
            .config()
            .limits
            .safety_ceiling
            .tightened(c.config().governor.confident_margin_kpa);
        let kpa = effective + over;
        let r = step(&mut c, &steady(now_ms, kpa, demand, delivered));
        prop_assert!(r.duty.command.is_fail_safe(), "duty {:?} at {} kPa", r.duty, kpa);
    }
}
