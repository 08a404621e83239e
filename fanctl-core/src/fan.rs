//! Fan tachometer pulse counting.

use core::sync::atomic::{AtomicU16, Ordering};

/// Tachometer pulses per fan revolution.
pub const PULSES_PER_REV: u16 = 2;

/// Speed of a fan over one measurement window.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FanSpeed {
    /// Revolutions per minute.
    pub rpm: u16,
    /// Pulses counted in the window.
    pub pulses: u16,
}

/// Pulse counters of `N` fans.
///
/// [`pulse`](Self::pulse) is called from the edge interrupt while
/// [`compute`](Self::compute) runs in the foreground.
pub struct FanTach<const N: usize> {
    pulses: [AtomicU16; N],
    speed: [FanSpeed; N],
}

impl<const N: usize> Default for FanTach<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> FanTach<N> {
    /// Creates the counters.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU16 = AtomicU16::new(0);
        const IDLE: FanSpeed = FanSpeed { rpm: 0, pulses: 0 };
        Self { pulses: [ZERO; N], speed: [IDLE; N] }
    }

    /// Counts a tachometer edge.
    pub fn pulse(&self, fan: usize) {
        if let Some(count) = self.pulses.get(fan) {
            let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_add(1)));
        }
    }

    /// Closes a measurement window of `window_ms` and restarts counting.
    pub fn compute(&mut self, window_ms: u32) {
        let window_ms = window_ms.max(1);
        for (count, speed) in self.pulses.iter().zip(&mut self.speed) {
            let pulses = count.swap(0, Ordering::Relaxed);
            let revs = (pulses / PULSES_PER_REV) as u32;
            let rpm = revs * 60_000 / window_ms;
            *speed = FanSpeed { rpm: rpm.min(u16::MAX as u32) as u16, pulses };
        }
    }

    /// Speed measured in the last completed window.
    pub fn speed(&self, fan: usize) -> Option<FanSpeed> {
        self.speed.get(fan).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_pulses_make_one_revolution() {
        let mut tach = FanTach::<2>::new();
        for _ in 0..101 {
            tach.pulse(0);
        }
        tach.pulse(1);
        tach.pulse(5);

        tach.compute(2000);
        assert_eq!(tach.speed(0), Some(FanSpeed { rpm: 1500, pulses: 101 }));
        assert_eq!(tach.speed(1), Some(FanSpeed { rpm: 0, pulses: 1 }));
        assert_eq!(tach.speed(2), None);
    }

    #[test]
    fn window_restarts_counting() {
        let mut tach = FanTach::<1>::new();
        tach.pulse(0);
        tach.pulse(0);
        tach.compute(1000);
        assert_eq!(tach.speed(0).unwrap().rpm, 60);

        tach.pulse(0);
        tach.compute(1000);
        assert_eq!(tach.speed(0), Some(FanSpeed { rpm: 0, pulses: 1 }));

        tach.compute(1000);
        assert_eq!(tach.speed(0), Some(FanSpeed::default()));
    }
}
