//! Fan pulse-width modulation (PWM) on timer 3.

use stm32f1::stm32f103::{Peripherals, TIM3};
use stm32f1xx_hal::{
    gpio::{gpioa, Alternate, PushPull},
    rcc::Clocks,
    time::Hertz,
};

/// PWM frequency for 4-wire fans.
pub const FAN_PWM_FREQUENCY: u32 = 25_000;

/// Fan outputs on TIM3 channel 1 (PA6) and channel 2 (PA7).
pub type FanPwmPins = (gpioa::PA6<Alternate<PushPull>>, gpioa::PA7<Alternate<PushPull>>);

/// PWM outputs driving the fans.
pub struct FanPwm {
    tim: TIM3,
    _pins: FanPwmPins,
    arr: u32,
}

impl FanPwm {
    /// Enables the timer and starts both outputs at full speed.
    pub fn new(tim: TIM3, pins: FanPwmPins, clocks: &Clocks) -> Self {
        let dp = unsafe { Peripherals::steal() };
        dp.RCC.apb1enr.modify(|_, w| w.tim3en().set_bit());

        let mut this = Self { tim, _pins: pins, arr: 0 };
        this.set_frequency(clocks.pclk1_tim(), FAN_PWM_FREQUENCY);

        this.tim
            .ccmr1_output()
            .modify(|_, w| w.oc1m().pwm_mode1().oc1pe().enabled().oc2m().pwm_mode1().oc2pe().enabled());
        this.tim.ccer.modify(|_, w| w.cc1e().set_bit().cc2e().set_bit());
        this.tim.cr1.modify(|_, w| w.arpe().enabled().cen().set_bit());

        for fan in 0..crate::FANS {
            this.set_duty_percent(fan, 100);
        }
        this
    }

    fn set_frequency(&mut self, clock: Hertz, freq: u32) {
        let ticks = clock.to_Hz() / freq;
        let psc = ticks / (u16::MAX as u32 + 1);
        let arr = ticks / (psc + 1);

        self.arr = arr;

        self.tim.psc.modify(|_, w| w.psc().bits(psc as u16));
        self.tim.arr.modify(|_, w| w.arr().bits(arr as u16));
        self.tim.egr.write(|w| w.ug().update());
    }

    /// Sets the duty cycle of a fan in percent.
    pub fn set_duty_percent(&mut self, fan: usize, percent: u8) {
        let cmp = (self.arr * percent.min(100) as u32 / 100) as u16;
        match fan {
            0 => self.tim.ccr1.modify(|_, w| w.ccr().bits(cmp)),
            1 => self.tim.ccr2.modify(|_, w| w.ccr().bits(cmp)),
            _ => defmt::warn!("no PWM output for fan {}", fan),
        }
    }
}
