//! RTD inputs of the analog to digital converter.

use stm32f1::stm32f103::{Peripherals, ADC1};
use stm32f1xx_hal::{
    adc::Adc,
    gpio::{gpioa, Analog},
    prelude::*,
};

/// Analog inputs wired to the RTD dividers.
pub struct RtdInputs {
    ch2: gpioa::PA2<Analog>,
    ch3: gpioa::PA3<Analog>,
}

impl Default for RtdInputs {
    fn default() -> Self {
        Self::new()
    }
}

impl RtdInputs {
    /// Number of RTD channels.
    pub const CHANNELS: usize = 2;

    /// Acquires the analog pins.
    pub fn new() -> Self {
        let dp = unsafe { Peripherals::steal() };
        let mut gpioa = unsafe { dp.GPIOA.split_without_reset() };

        Self { ch2: gpioa.pa2.into_analog(&mut gpioa.crl), ch3: gpioa.pa3.into_analog(&mut gpioa.crl) }
    }

    /// Reads the specified RTD channel.
    ///
    /// Returns `None` if the conversion failed.
    pub fn read(&mut self, adc: &mut Adc<ADC1>, ch: usize) -> Option<u16> {
        let res: nb::Result<u16, ()> = match ch {
            0 => adc.read(&mut self.ch2),
            1 => adc.read(&mut self.ch3),
            _ => defmt::panic!("invalid RTD channel"),
        };
        res.ok()
    }
}
