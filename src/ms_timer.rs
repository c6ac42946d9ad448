use std::time::Instant;

/// Monotonic millisecond time source.
///
/// The counter wraps after about 49 days; every consumer compares
/// timestamps with wrapping arithmetic.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

pub struct MsTimer {
    instant: Instant,
}

impl MsTimer {
    pub fn new() -> Self {
        MsTimer {
            instant: Instant::now(),
        }
    }

    /// Return elapsed time in milliseconds since instantiation.
    pub fn ms(&self) -> u32 {
        self.instant.elapsed().as_millis() as u32
    }
}

impl Default for MsTimer {
    fn default() -> Self {
        MsTimer::new()
    }
}

impl Clock for MsTimer {
    fn now_ms(&self) -> u32 {
        self.ms()
    }
}

/// Milliseconds from `earlier` to `now`, robust to counter wrap.
pub fn elapsed_ms(now: u32, earlier: u32) -> u32 {
    now.wrapping_sub(earlier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_across_wrap() {
        assert_eq!(elapsed_ms(5, u32::MAX - 4), 10);
        assert_eq!(elapsed_ms(100, 40), 60);
    }
}
