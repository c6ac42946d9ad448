//! Collaborators the controller is wired to

use crate::controller::CycleInputs;
use crate::duty::DutyUpdate;
use crate::error::BoostError;
use crate::types::{RawPressureSamples, RawTorqueSample};

pub use crate::ms_timer::Clock;

pub trait PressureSource {
    fn read_pressures(&mut self) -> RawPressureSamples;
}

pub trait TorqueSource {
    /// Most recent decoded torque sample, if any was ever received.
    fn latest_torque(&mut self) -> Option<RawTorqueSample>;
}

pub trait DutyOutput {
    fn apply(&mut self, update: &DutyUpdate) -> Result<(), BoostError>;
}

pub struct Board<P, T, D, C> {
    pub pressure: P,
    pub torque: T,
    pub duty: D,
    pub clock: C,
}

impl<P, T, D, C> Board<P, T, D, C>
where
    P: PressureSource,
    T: TorqueSource,
    D: DutyOutput,
    C: Clock,
{
    pub fn new(pressure: P, torque: T, duty: D, clock: C) -> Self {
        Board {
            pressure,
            torque,
            duty,
            clock,
        }
    }

    pub fn sample_inputs(&mut self) -> CycleInputs {
        CycleInputs {
            now_ms: self.clock.now_ms(),
            pressures: self.pressure.read_pressures(),
            torque: self.torque.latest_torque(),
        }
    }
}
