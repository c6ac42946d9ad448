//! Pressure and torque normalization
//!
//! Raw driver samples become a `SensorSnapshot` in kPa gauge and a
//! `TorqueStatus` in percent of maximum engine torque. Nothing is clamped:
//! a value that cannot be trusted is marked invalid instead.

use crate::config::{PressureChannelCalibration, SensorConfig};
use crate::ms_timer::elapsed_ms;
use crate::types::{
    PressureReading, RawPressureSample, RawPressureSamples, RawTorqueSample, SensorFault,
    SensorSnapshot, TorqueRequest, TorqueStatus,
};

pub struct Normalizer {
    config: SensorConfig,
}

impl Normalizer {
    pub fn new(config: SensorConfig) -> Self {
        Normalizer { config }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn normalize_pressures(&self, raw: &RawPressureSamples, now_ms: u32) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot {
            manifold: self.normalize_channel(&raw.manifold, &self.config.manifold, now_ms),
            upper_dome: self.normalize_channel(&raw.upper_dome, &self.config.dome, now_ms),
            lower_dome: self.normalize_channel(&raw.lower_dome, &self.config.dome, now_ms),
        };
        self.check_dome_supply(&mut snapshot);
        snapshot
    }

    /// Both domes are fed from the manifold through the solenoid, so
    /// neither can hold more than the supply.
    fn check_dome_supply(&self, snapshot: &mut SensorSnapshot) {
        if !snapshot.manifold.valid {
            return;
        }
        let limit_kpa = snapshot.manifold.kpa + self.config.dome_supply_tolerance_kpa;
        for dome in [&mut snapshot.upper_dome, &mut snapshot.lower_dome] {
            if dome.valid && dome.kpa > limit_kpa {
                *dome =
                    PressureReading::invalid(SensorFault::PneumaticImplausible, dome.timestamp_ms);
            }
        }
    }

    fn normalize_channel(
        &self,
        raw: &RawPressureSample,
        calibration: &PressureChannelCalibration,
        now_ms: u32,
    ) -> PressureReading {
        if !raw.channel_ok {
            return PressureReading::invalid(SensorFault::ChannelFault, raw.timestamp_ms);
        }

        // a timestamp from the future wraps to a huge age
        if elapsed_ms(now_ms, raw.timestamp_ms) > self.config.sensor_timeout_ms {
            return PressureReading::invalid(SensorFault::Stale, raw.timestamp_ms);
        }

        if !calibration.electrically_valid(raw.millivolts) {
            return PressureReading::invalid(SensorFault::ElectricalRange, raw.timestamp_ms);
        }

        let kpa = calibration.to_kpa(raw.millivolts);
        if !kpa.is_finite()
            || kpa < self.config.plausible_min_kpa
            || kpa > self.config.plausible_max_kpa
        {
            return PressureReading::invalid(SensorFault::PhysicalRange, raw.timestamp_ms);
        }

        PressureReading::valid(kpa, raw.timestamp_ms)
    }

    pub fn normalize_torque(&self, raw: Option<&RawTorqueSample>, now_ms: u32) -> TorqueStatus {
        let raw = match raw {
            Some(raw) => raw,
            None => return TorqueStatus::Absent,
        };

        let age_ms = elapsed_ms(now_ms, raw.timestamp_ms);
        if age_ms > self.config.torque_timeout_ms {
            return TorqueStatus::Stale { age_ms };
        }

        let demand_pct = 100.0 * raw.requested_nm / self.config.max_engine_torque_nm;
        let delivered_pct = 100.0 * raw.delivered_nm / self.config.max_engine_torque_nm;

        let plausible = |pct: f32| (0.0..=100.0).contains(&pct);
        if !plausible(demand_pct) || !plausible(delivered_pct) {
            return TorqueStatus::Implausible;
        }

        TorqueStatus::Fresh(TorqueRequest {
            demand_pct,
            delivered_pct,
            engine_rpm: raw.engine_rpm,
            timestamp_ms: raw.timestamp_ms,
        })
    }
}
