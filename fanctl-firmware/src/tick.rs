//! System tick source.

use cortex_m::peripheral::{syst::SystClkSource, SYST};
use fanctl_core::{
    timer::{RunMode, TickGate},
    TICK_MS,
};
use stm32f1xx_hal::rcc::Clocks;

/// SysTick configured to interrupt every [`TICK_MS`].
pub struct SysTickGate {
    syst: SYST,
}

impl SysTickGate {
    /// Configures SysTick and starts it.
    pub fn new(mut syst: SYST, clocks: &Clocks) -> Self {
        let reload = clocks.sysclk().to_Hz() / 1000 * TICK_MS - 1;

        syst.set_clock_source(SystClkSource::Core);
        syst.set_reload(reload);
        syst.clear_current();
        syst.enable_interrupt();
        syst.enable_counter();

        Self { syst }
    }
}

impl TickGate for SysTickGate {
    fn run_mode(&mut self) -> RunMode {
        if self.syst.is_counter_enabled() {
            RunMode::Running
        } else {
            RunMode::Halted
        }
    }

    fn set_run_mode(&mut self, mode: RunMode) {
        match mode {
            RunMode::Running => self.syst.enable_counter(),
            RunMode::Halted => self.syst.disable_counter(),
        }
    }
}
