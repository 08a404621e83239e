//! Board.

use stm32f1xx_hal::{afio, i2c};

/// Board-specific functionality.
pub trait Board {
    /// Mode for I2C 2 master bus.
    const I2C2_MODE: i2c::Mode = i2c::Mode::Standard { frequency: stm32f1xx_hal::time::Hertz::Hz(100_000) };

    /// I2C addresses of the TMP1075 sensors on I2C 2.
    const TMP1075_ADDRS: [u8; crate::SENSORS] = [0x48, 0x4a];

    /// Console baud rate.
    const CONSOLE_BAUD: u32 = 115_200;

    /// Create a new instance.
    ///
    /// Configures the status LED, heater outputs and tachometer inputs.
    fn new(afio: &mut afio::Parts) -> Self;

    /// Board model.
    fn model() -> &'static [u8];

    /// Sets the status LED to the specified state.
    fn set_status_led(&mut self, _state: bool) {}

    /// Switches a heater.
    fn set_heater(&mut self, _heater: usize, _on: bool) {}

    /// Checks whether a tachometer edge of a fan occurred and clears the pending interrupt.
    fn check_tach(&mut self, _fan: usize) -> bool {
        false
    }
}
