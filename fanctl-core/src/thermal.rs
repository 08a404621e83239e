//! Fan control by temperature zones with hysteresis.

/// Number of temperature zones.
pub const ZONES: usize = 8;

/// Largest hysteresis in °C.
pub const MAX_HYSTERESIS: u8 = 10;

/// Temperature zone `(low, high]` in °C.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Zone {
    /// Exclusive lower bound.
    pub low: f32,
    /// Inclusive upper bound.
    pub high: f32,
}

impl Zone {
    const fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    /// Whether `celsius` lies within the zone.
    pub fn contains(&self, celsius: f32) -> bool {
        celsius > self.low && celsius <= self.high
    }
}

/// Zone table and fan duty cycles.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThermalCfg<const FANS: usize> {
    /// Temperature zones in ascending order.
    pub zones: [Zone; ZONES],
    /// Duty cycle in percent per fan and zone.
    pub duty: [[u8; ZONES]; FANS],
    /// Hysteresis in °C applied at zone boundaries.
    pub hysteresis: u8,
}

impl<const FANS: usize> Default for ThermalCfg<FANS> {
    fn default() -> Self {
        Self {
            zones: [
                Zone::new(-99.0, 15.0),
                Zone::new(15.0, 25.0),
                Zone::new(25.0, 30.0),
                Zone::new(30.0, 35.0),
                Zone::new(35.0, 40.0),
                Zone::new(40.0, 45.0),
                Zone::new(45.0, 50.0),
                Zone::new(50.0, 999.9),
            ],
            duty: [[20, 30, 35, 45, 50, 55, 60, 100]; FANS],
            hysteresis: 2,
        }
    }
}

impl<const FANS: usize> ThermalCfg<FANS> {
    /// Returns a usable configuration.
    ///
    /// Duty cycles are limited to 100 %, a zone whose upper bound lies below
    /// its lower bound is collapsed onto the lower bound and the hysteresis
    /// is limited to [`MAX_HYSTERESIS`].
    pub fn validate(mut self) -> Self {
        for zone in &mut self.zones {
            if zone.high < zone.low {
                zone.high = zone.low;
            }
        }
        for duty in self.duty.iter_mut().flatten() {
            *duty = (*duty).min(100);
        }
        self.hysteresis = self.hysteresis.min(MAX_HYSTERESIS);
        self
    }

    /// Index of the zone containing `celsius`.
    pub fn find_zone(&self, celsius: f32) -> Option<usize> {
        self.zones.iter().position(|zone| zone.contains(celsius))
    }
}

/// Tracks the zone of each fan.
pub struct ThermalController<const FANS: usize> {
    cfg: ThermalCfg<FANS>,
    zone: [Option<usize>; FANS],
}

impl<const FANS: usize> ThermalController<FANS> {
    /// Creates the controller; fans have no zone until their first sample.
    pub fn new(cfg: ThermalCfg<FANS>) -> Self {
        Self { cfg: cfg.validate(), zone: [None; FANS] }
    }

    /// Configuration.
    pub fn cfg(&self) -> &ThermalCfg<FANS> {
        &self.cfg
    }

    /// Replaces the configuration, keeping the current zones.
    pub fn set_cfg(&mut self, cfg: ThermalCfg<FANS>) {
        self.cfg = cfg.validate();
    }

    /// Current zone of a fan.
    pub fn zone(&self, fan: usize) -> Option<usize> {
        self.zone.get(fan).copied().flatten()
    }

    /// Duty cycle of a fan in its current zone.
    pub fn duty(&self, fan: usize) -> Option<u8> {
        Some(self.cfg.duty.get(fan)?[self.zone(fan)?])
    }

    /// Updates the zone of a fan from a temperature sample and returns its duty cycle.
    ///
    /// The first sample selects the zone containing it. Later samples move
    /// at most one zone per call and only once the temperature exceeds the
    /// zone bound by more than the hysteresis.
    pub fn update(&mut self, fan: usize, celsius: f32) -> Option<u8> {
        let current = *self.zone.get(fan)?;
        let hysteresis = self.cfg.hysteresis as f32;

        let next = match current {
            None => self.cfg.find_zone(celsius)?,
            Some(zone) => {
                let bounds = self.cfg.zones[zone];
                if celsius > bounds.high + hysteresis && zone < ZONES - 1 {
                    zone + 1
                } else if celsius < bounds.low - hysteresis && zone > 0 {
                    zone - 1
                } else {
                    zone
                }
            }
        };

        if current != Some(next) {
            debug!("fan {} moves to zone {} at {} C", fan, next, celsius);
        }
        self.zone[fan] = Some(next);
        self.duty(fan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_selects_containing_zone() {
        let mut ctl = ThermalController::<2>::new(ThermalCfg::default());

        assert_eq!(ctl.update(0, 27.0), Some(35));
        assert_eq!(ctl.zone(0), Some(2));
        assert_eq!(ctl.zone(1), None);

        // Upper bounds are inclusive.
        assert_eq!(ctl.update(1, 15.0), Some(20));
    }

    #[test]
    fn hysteresis_delays_zone_changes() {
        let mut ctl = ThermalController::<1>::new(ThermalCfg::default());
        ctl.update(0, 27.0);

        assert_eq!(ctl.update(0, 31.5), Some(35));
        assert_eq!(ctl.update(0, 32.5), Some(45));
        assert_eq!(ctl.zone(0), Some(3));

        assert_eq!(ctl.update(0, 28.5), Some(45));
        assert_eq!(ctl.update(0, 27.5), Some(35));
    }

    #[test]
    fn moves_one_zone_per_sample() {
        let mut ctl = ThermalController::<1>::new(ThermalCfg::default());
        ctl.update(0, 20.0);

        ctl.update(0, 80.0);
        assert_eq!(ctl.zone(0), Some(2));
        ctl.update(0, 80.0);
        assert_eq!(ctl.zone(0), Some(3));
    }

    #[test]
    fn stays_within_table() {
        let mut ctl = ThermalController::<1>::new(ThermalCfg::default());
        ctl.update(0, 900.0);
        assert_eq!(ctl.update(0, 2000.0), Some(100));
        assert_eq!(ctl.zone(0), Some(ZONES - 1));

        let mut ctl = ThermalController::<1>::new(ThermalCfg::default());
        ctl.update(0, -50.0);
        assert_eq!(ctl.update(0, -200.0), Some(20));
        assert_eq!(ctl.zone(0), Some(0));
    }

    #[test]
    fn sample_outside_every_zone_leaves_fan_unassigned() {
        let mut ctl = ThermalController::<1>::new(ThermalCfg::default());

        assert_eq!(ctl.update(0, -150.0), None);
        assert_eq!(ctl.zone(0), None);
        assert_eq!(ctl.update(3, 20.0), None);
    }

    #[test]
    fn validate_repairs_configuration() {
        let mut cfg = ThermalCfg::<1>::default();
        cfg.zones[3] = Zone { low: 40.0, high: 10.0 };
        cfg.duty[0][7] = 150;
        cfg.hysteresis = 40;

        let cfg = cfg.validate();
        assert_eq!(cfg.zones[3], Zone { low: 40.0, high: 40.0 });
        assert_eq!(cfg.duty[0][7], 100);
        assert_eq!(cfg.hysteresis, 10);
    }
}
