//! Configuration.

use crate::{heater::HeaterCfg, rtd::TempRange, thermal::ThermalCfg};

/// Controller configuration.
///
/// Periods are given in ticks of [`TICK_MS`](crate::TICK_MS).
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config<const FANS: usize> {
    /// Heartbeat period.
    pub heartbeat_ticks: u16,
    /// Delay between power up and the first bus transaction.
    pub bus_start_delay_ticks: u16,
    /// Length of the bus watchdog window.
    pub bus_watchdog_window_ticks: u16,
    /// Completed transactions required per watchdog window.
    pub bus_watchdog_min_completed: u16,
    /// Period between ADC conversions.
    pub adc_period_ticks: u16,
    /// Fan speed measurement window.
    pub rpm_window_ticks: u16,
    /// Delay between switching on consecutive heaters.
    pub heater_stagger_ticks: u16,
    /// Diagnostics output period.
    pub diag_period_ticks: u16,
    /// Fan control.
    pub thermal: ThermalCfg<FANS>,
    /// Heater control.
    pub heater: HeaterCfg,
    /// Plausible RTD temperatures.
    pub rtd_range: TempRange,
}

impl<const FANS: usize> Default for Config<FANS> {
    fn default() -> Self {
        Self {
            heartbeat_ticks: 500,
            bus_start_delay_ticks: 1000,
            bus_watchdog_window_ticks: 15_000,
            bus_watchdog_min_completed: 2,
            adc_period_ticks: 300,
            rpm_window_ticks: 2000,
            heater_stagger_ticks: 2000,
            diag_period_ticks: 900,
            thermal: ThermalCfg::default(),
            heater: HeaterCfg::default(),
            rtd_range: TempRange::default(),
        }
    }
}

impl<const FANS: usize> Config<FANS> {
    /// Returns a usable configuration.
    ///
    /// Zero periods become one tick and an inverted RTD range is swapped.
    pub fn validate(mut self) -> Self {
        for ticks in [
            &mut self.heartbeat_ticks,
            &mut self.bus_start_delay_ticks,
            &mut self.bus_watchdog_window_ticks,
            &mut self.adc_period_ticks,
            &mut self.rpm_window_ticks,
            &mut self.heater_stagger_ticks,
            &mut self.diag_period_ticks,
        ] {
            *ticks = (*ticks).max(1);
        }
        self.bus_watchdog_min_completed = self.bus_watchdog_min_completed.max(1);

        if self.rtd_range.max < self.rtd_range.min {
            core::mem::swap(&mut self.rtd_range.min, &mut self.rtd_range.max);
        }
        self.thermal = self.thermal.validate();

        self
    }

    /// Restores the settings adjustable from the console to their defaults.
    ///
    /// Timer periods are kept since timers are only defined at startup.
    pub fn restore_defaults(&mut self) {
        let defaults = Self::default();
        self.thermal = defaults.thermal;
        self.heater = defaults.heater;
        self.rtd_range = defaults.rtd_range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = Config::<2>::default();
        assert_eq!(cfg.validate(), cfg);
    }

    #[test]
    fn zero_periods_become_one_tick() {
        let cfg = Config::<1> {
            heartbeat_ticks: 0,
            adc_period_ticks: 0,
            bus_watchdog_min_completed: 0,
            rtd_range: TempRange { min: 80.0, max: -20.0 },
            ..Default::default()
        }
        .validate();

        assert_eq!(cfg.heartbeat_ticks, 1);
        assert_eq!(cfg.adc_period_ticks, 1);
        assert_eq!(cfg.bus_watchdog_min_completed, 1);
        assert_eq!(cfg.rtd_range, TempRange { min: -20.0, max: 80.0 });
    }

    #[test]
    fn restore_defaults_keeps_periods() {
        let mut cfg =
            Config::<2> { adc_period_ticks: 50, rtd_range: TempRange { min: 0.0, max: 1.0 }, ..Default::default() };
        cfg.thermal.hysteresis = 7;
        cfg.thermal.duty[1][3] = 99;
        cfg.heater.enabled = !cfg.heater.enabled;

        cfg.restore_defaults();

        let defaults = Config::<2>::default();
        assert_eq!(cfg.thermal, defaults.thermal);
        assert_eq!(cfg.heater, defaults.heater);
        assert_eq!(cfg.rtd_range, defaults.rtd_range);
        assert_eq!(cfg.adc_period_ticks, 50);
    }
}
