use crate::ms_timer::elapsed_ms;

/// Tracks how long a condition has been continuously active.
///
/// The governor uses this to require that a recovery condition holds for a
/// minimum duration before a hard cut is released.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultCondition {
    monitoring_active: bool,
    condition_start_time: u32,
}

impl FaultCondition {
    pub const fn new() -> Self {
        FaultCondition {
            monitoring_active: false,
            condition_start_time: 0,
        }
    }

    pub fn condition_exceeded_duration(
        &mut self,
        condition_active: bool,
        max_duration: u32,
        now_ms: u32,
    ) -> bool {
        if !condition_active {
            // condition cleared, forget the first detection time
            self.reset();
            return false;
        }

        if !self.monitoring_active {
            // first detection, start timing from here
            self.monitoring_active = true;
            self.condition_start_time = now_ms;
        }

        elapsed_ms(now_ms, self.condition_start_time) >= max_duration
    }

    pub fn reset(&mut self) {
        self.monitoring_active = false;
        self.condition_start_time = 0;
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_only_after_duration() {
        let mut fc = FaultCondition::new();
        assert!(!fc.condition_exceeded_duration(true, 100, 1000));
        assert!(!fc.condition_exceeded_duration(true, 100, 1099));
        assert!(fc.condition_exceeded_duration(true, 100, 1100));
    }

    #[test]
    fn inactive_condition_restarts_timing() {
        let mut fc = FaultCondition::new();
        assert!(!fc.condition_exceeded_duration(true, 50, 0));
        assert!(!fc.condition_exceeded_duration(false, 50, 40));
        assert!(!fc.is_monitoring());
        assert!(!fc.condition_exceeded_duration(true, 50, 60));
        assert!(fc.condition_exceeded_duration(true, 50, 110));
    }

    #[test]
    fn start_time_before_wrap() {
        let mut fc = FaultCondition::new();
        assert!(!fc.condition_exceeded_duration(true, 20, u32::MAX - 9));
        assert!(fc.condition_exceeded_duration(true, 20, 10));
    }
}
