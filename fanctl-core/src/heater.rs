//! Heater bank switched on one heater at a time.
//!
//! Staggering limits the inrush current. A recurring timer calls
//! [`HeaterBank::stagger_step`] until all heaters are on; the last step
//! raises [`Event::HEATER`] so the foreground tears the timer down.

use crate::event::{Event, EventFlags};

/// Heater configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeaterCfg {
    /// Whether heating is allowed.
    pub enabled: bool,
    /// Set point in °C.
    pub setpoint: i8,
    /// Hysteresis in °C around the set point.
    pub hysteresis: u8,
}

impl Default for HeaterCfg {
    fn default() -> Self {
        Self { enabled: true, setpoint: -4, hysteresis: 2 }
    }
}

/// Action requested by a temperature update.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaterAction {
    /// Nothing to do.
    None,
    /// Register and start the stagger timer.
    StartStagger,
    /// All heaters have been switched off.
    AllOff,
}

/// Result of a stagger step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StaggerStep {
    /// Heater to switch on.
    pub heater: Option<usize>,
    /// Whether the stagger is complete.
    pub finished: bool,
}

/// State of `N` heaters.
pub struct HeaterBank<const N: usize> {
    cfg: HeaterCfg,
    on: [bool; N],
    next: usize,
    staggering: bool,
}

impl<const N: usize> HeaterBank<N> {
    /// Creates the bank with all heaters off.
    pub const fn new(cfg: HeaterCfg) -> Self {
        Self { cfg, on: [false; N], next: 0, staggering: false }
    }

    /// Configuration.
    pub fn cfg(&self) -> HeaterCfg {
        self.cfg
    }

    /// Replaces the configuration.
    pub fn set_cfg(&mut self, cfg: HeaterCfg) {
        self.cfg = cfg;
    }

    /// Whether a heater is on.
    pub fn is_on(&self, heater: usize) -> bool {
        self.on.get(heater).copied().unwrap_or_default()
    }

    /// Whether all heaters are on.
    pub fn all_on(&self) -> bool {
        self.on.iter().all(|&on| on)
    }

    /// Whether the stagger timer is active.
    pub fn is_staggering(&self) -> bool {
        self.staggering
    }

    /// Evaluates the average temperature.
    pub fn update(&mut self, celsius: f32) -> HeaterAction {
        let setpoint = self.cfg.setpoint as f32;
        let hysteresis = self.cfg.hysteresis as f32;

        if celsius < setpoint - hysteresis {
            if self.cfg.enabled && !self.all_on() && !self.staggering {
                info!("starting heaters at {} C", celsius);
                self.staggering = true;
                return HeaterAction::StartStagger;
            }
        } else if celsius > setpoint + hysteresis && self.all_on() {
            info!("heaters off at {} C", celsius);
            self.on = [false; N];
            self.next = 0;
            return HeaterAction::AllOff;
        }

        HeaterAction::None
    }

    /// Switches the next heater on.
    ///
    /// Raises [`Event::HEATER`] once the stagger is complete or heating has
    /// been disabled meanwhile.
    pub fn stagger_step(&mut self, events: &EventFlags) -> StaggerStep {
        if !self.cfg.enabled || N == 0 {
            events.raise(Event::HEATER);
            return StaggerStep { heater: None, finished: true };
        }

        let heater = self.next;
        self.on[heater] = true;
        self.next += 1;

        let finished = self.next >= N;
        if finished {
            self.next = 0;
            events.raise(Event::HEATER);
        }

        StaggerStep { heater: Some(heater), finished }
    }

    /// Marks the stagger timer as torn down.
    pub fn stagger_done(&mut self) {
        self.staggering = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_starts_stagger_once() {
        let mut bank = HeaterBank::<3>::new(HeaterCfg::default());

        assert_eq!(bank.update(-10.0), HeaterAction::StartStagger);
        assert_eq!(bank.update(-10.0), HeaterAction::None);
        assert!(bank.is_staggering());
    }

    #[test]
    fn stagger_switches_heaters_in_order() {
        let events = EventFlags::new();
        let mut bank = HeaterBank::<3>::new(HeaterCfg::default());
        bank.update(-10.0);

        assert_eq!(bank.stagger_step(&events), StaggerStep { heater: Some(0), finished: false });
        assert_eq!(bank.stagger_step(&events), StaggerStep { heater: Some(1), finished: false });
        assert!(events.is_idle());
        assert_eq!(bank.stagger_step(&events), StaggerStep { heater: Some(2), finished: true });
        assert!(events.take(Event::HEATER));
        assert!(bank.all_on());

        bank.stagger_done();
        assert_eq!(bank.update(-10.0), HeaterAction::None);
    }

    #[test]
    fn warm_switches_all_off() {
        let events = EventFlags::new();
        let mut bank = HeaterBank::<2>::new(HeaterCfg::default());
        bank.update(-10.0);
        bank.stagger_step(&events);
        bank.stagger_step(&events);
        bank.stagger_done();

        // Within the hysteresis band nothing changes.
        assert_eq!(bank.update(-3.0), HeaterAction::None);
        assert_eq!(bank.update(-1.5), HeaterAction::AllOff);
        assert!(!bank.is_on(0));
        assert_eq!(bank.update(-10.0), HeaterAction::StartStagger);
    }

    #[test]
    fn disabled_heating_never_starts() {
        let events = EventFlags::new();
        let mut bank = HeaterBank::<2>::new(HeaterCfg { enabled: false, ..Default::default() });

        assert_eq!(bank.update(-30.0), HeaterAction::None);
        assert_eq!(bank.stagger_step(&events), StaggerStep { heater: None, finished: true });
        assert!(events.take(Event::HEATER));
    }
}
