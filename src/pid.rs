/// Proportional-integral controller with a windup guard on the integral.
///
/// The caller decides per update whether the integral may accumulate,
/// which lets it halt integration while its output is saturated.
#[derive(Debug, Clone)]
pub struct Pid {
    windup_guard: f32,
    proportional_gain: f32,
    integral_gain: f32,
    int_error: f32,
    control: f32,
}

impl Pid {
    pub fn new(proportional_gain: f32, integral_gain: f32, windup_guard: f32) -> Pid {
        Pid {
            windup_guard,
            proportional_gain,
            integral_gain,
            int_error: 0.0_f32,
            control: 0.0_f32,
        }
    }

    pub fn set_gains(&mut self, proportional_gain: f32, integral_gain: f32, windup_guard: f32) {
        self.proportional_gain = proportional_gain;
        self.integral_gain = integral_gain;
        self.windup_guard = windup_guard;
        self.zeroize();
    }

    pub fn zeroize(&mut self) {
        // set integrated error and output to zero
        self.int_error = 0.0_f32;
        self.control = 0.0_f32;
    }

    /// Output the controller would produce for `error` without integrating.
    pub fn peek(&self, error: f32) -> f32 {
        self.proportional_gain * error + self.integral_gain * self.int_error
    }

    /// Returns `None` for a non-positive `dt`, leaving the state untouched.
    pub fn update(&mut self, error: f32, dt: f32, integrate: bool) -> Option<f32> {
        if !(dt > 0.0_f32) || !error.is_finite() {
            return None;
        }

        if integrate {
            // integration with windup guarding
            self.int_error = num::clamp(
                self.int_error + error * dt,
                -self.windup_guard,
                self.windup_guard,
            );
        }

        self.control = self.peek(error);

        Some(self.control)
    }

    pub fn integral(&self) -> f32 {
        self.int_error
    }

    pub fn control(&self) -> f32 {
        self.control
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_and_integral_terms() {
        let mut pid = Pid::new(2.0, 1.0, 100.0);
        assert_eq!(pid.update(10.0, 0.5, true), Some(25.0));
        assert_eq!(pid.integral(), 5.0);
        assert_eq!(pid.update(10.0, 0.5, true), Some(30.0));
    }

    #[test]
    fn windup_guard_bounds_integral() {
        let mut pid = Pid::new(0.0, 1.0, 3.0);
        for _ in 0..100 {
            pid.update(10.0, 0.1, true);
        }
        assert_eq!(pid.integral(), 3.0);
        for _ in 0..100 {
            pid.update(-10.0, 0.1, true);
        }
        assert_eq!(pid.integral(), -3.0);
    }

    #[test]
    fn held_integral_does_not_accumulate() {
        let mut pid = Pid::new(1.0, 1.0, 100.0);
        pid.update(4.0, 1.0, true);
        pid.update(4.0, 1.0, false);
        assert_eq!(pid.integral(), 4.0);
        assert_eq!(pid.control(), 8.0);
    }

    #[test]
    fn invalid_dt_rejected() {
        let mut pid = Pid::new(1.0, 1.0, 100.0);
        assert_eq!(pid.update(1.0, 0.0, true), None);
        assert_eq!(pid.update(1.0, -1.0, true), None);
        assert_eq!(pid.update(f32::NAN, 0.01, true), None);
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn zeroize_clears_state() {
        let mut pid = Pid::new(1.0, 1.0, 100.0);
        pid.update(5.0, 1.0, true);
        pid.zeroize();
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.control(), 0.0);
    }
}
