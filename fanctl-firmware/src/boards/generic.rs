//! Generic board based on the STM32F103C8 "blue pill".
//!
//! Status LED on PC13 (active low), heaters on PB12..PB15, PB8 and PB9,
//! fan tachometers on PA0 and PA1.

use stm32f1::stm32f103::Peripherals;
use stm32f1xx_hal::{
    afio,
    gpio::{gpioa, gpioc, Edge, ErasedPin, ExtiPin, Input, Output, PinState, PullUp, PushPull},
};

use crate::{board::Board, FANS, HEATERS};

/// Generic board.
pub struct BoardImpl {
    led: gpioc::PC13<Output<PushPull>>,
    heaters: [ErasedPin<Output<PushPull>>; HEATERS],
    tach0: gpioa::PA0<Input<PullUp>>,
    tach1: gpioa::PA1<Input<PullUp>>,
}

impl Board for BoardImpl {
    fn new(afio: &mut afio::Parts) -> BoardImpl {
        let mut dp = unsafe { Peripherals::steal() };
        let mut gpioa = unsafe { dp.GPIOA.split_without_reset() };
        let mut gpiob = unsafe { dp.GPIOB.split_without_reset() };
        let mut gpioc = unsafe { dp.GPIOC.split_without_reset() };

        let led = gpioc.pc13.into_push_pull_output_with_state(&mut gpioc.crh, PinState::High);

        let heaters = [
            gpiob.pb12.into_push_pull_output_with_state(&mut gpiob.crh, PinState::Low).erase(),
            gpiob.pb13.into_push_pull_output_with_state(&mut gpiob.crh, PinState::Low).erase(),
            gpiob.pb14.into_push_pull_output_with_state(&mut gpiob.crh, PinState::Low).erase(),
            gpiob.pb15.into_push_pull_output_with_state(&mut gpiob.crh, PinState::Low).erase(),
            gpiob.pb8.into_push_pull_output_with_state(&mut gpiob.crh, PinState::Low).erase(),
            gpiob.pb9.into_push_pull_output_with_state(&mut gpiob.crh, PinState::Low).erase(),
        ];

        let mut tach0 = gpioa.pa0.into_pull_up_input(&mut gpioa.crl);
        tach0.make_interrupt_source(afio);
        tach0.trigger_on_edge(&mut dp.EXTI, Edge::Falling);
        tach0.clear_interrupt_pending_bit();
        tach0.enable_interrupt(&mut dp.EXTI);

        let mut tach1 = gpioa.pa1.into_pull_up_input(&mut gpioa.crl);
        tach1.make_interrupt_source(afio);
        tach1.trigger_on_edge(&mut dp.EXTI, Edge::Falling);
        tach1.clear_interrupt_pending_bit();
        tach1.enable_interrupt(&mut dp.EXTI);

        Self { led, heaters, tach0, tach1 }
    }

    fn model() -> &'static [u8] {
        b"generic"
    }

    fn set_status_led(&mut self, state: bool) {
        self.led.set_state(if state { PinState::Low } else { PinState::High });
    }

    fn set_heater(&mut self, heater: usize, on: bool) {
        if let Some(pin) = self.heaters.get_mut(heater) {
            pin.set_state(if on { PinState::High } else { PinState::Low });
        }
    }

    fn check_tach(&mut self, fan: usize) -> bool {
        debug_assert!(fan < FANS);
        match fan {
            0 => {
                let pending = self.tach0.check_interrupt();
                self.tach0.clear_interrupt_pending_bit();
                pending
            }
            1 => {
                let pending = self.tach1.check_interrupt();
                self.tach1.clear_interrupt_pending_bit();
                pending
            }
            _ => false,
        }
    }
}
