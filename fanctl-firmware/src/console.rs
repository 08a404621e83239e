//! Service console on USART 1.

use core::fmt;
use embedded_hal::serial::{Read, Write};
use fanctl_core::event::{Event, EventFlags};
use heapless::Deque;
use stm32f1::stm32f103::USART1;
use stm32f1xx_hal::{
    afio::MAPR,
    gpio::{gpioa, Alternate, Floating, Input, PushPull},
    prelude::*,
    rcc::Clocks,
    serial::{self, Config, Rx, Serial, Tx},
};

/// Console pins TX (PA9) and RX (PA10).
pub type ConsolePins = (gpioa::PA9<Alternate<PushPull>>, gpioa::PA10<Input<Floating>>);

const RX_QUEUE: usize = 32;
const TX_QUEUE: usize = 512;

/// Interrupt driven console.
pub struct Console {
    tx: Tx<USART1>,
    rx: Rx<USART1>,
    rx_queue: Deque<u8, RX_QUEUE>,
    tx_queue: Deque<u8, TX_QUEUE>,
    sending: bool,
    dropped: u32,
}

impl Console {
    /// Configures USART 1 for 8N1 at `baud` and enables the receive interrupt.
    pub fn new(usart: USART1, pins: ConsolePins, mapr: &mut MAPR, baud: u32, clocks: &Clocks) -> Self {
        let serial = Serial::new(usart, pins, mapr, Config::default().baudrate(baud.bps()), clocks);
        let (tx, mut rx) = serial.split();
        rx.listen();

        Self { tx, rx, rx_queue: Deque::new(), tx_queue: Deque::new(), sending: false, dropped: 0 }
    }

    /// Handles the USART interrupt.
    ///
    /// Raises [`Event::UART_RX`] for received bytes and [`Event::UART_TX`]
    /// once the transmit queue is drained.
    pub fn on_irq(&mut self, events: &EventFlags) {
        match self.rx.read() {
            Ok(byte) => {
                if self.rx_queue.push_back(byte).is_err() {
                    self.dropped = self.dropped.wrapping_add(1);
                }
                events.raise(Event::UART_RX);
            }
            Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(serial::Error::Overrun)) => self.dropped = self.dropped.wrapping_add(1),
            Err(nb::Error::Other(_)) => defmt::trace!("console framing or parity error"),
        }

        if !self.sending {
            return;
        }
        match self.tx_queue.front() {
            Some(&byte) => {
                if self.tx.write(byte).is_ok() {
                    self.tx_queue.pop_front();
                }
            }
            None => {
                self.tx.unlisten();
                self.sending = false;
                events.raise(Event::UART_TX);
            }
        }
    }

    /// Takes a received byte.
    pub fn read(&mut self) -> Option<u8> {
        self.rx_queue.pop_front()
    }

    /// Queues bytes for transmission.
    ///
    /// Bytes not fitting into the queue are dropped.
    pub fn write_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            if self.tx_queue.push_back(byte).is_err() {
                self.dropped = self.dropped.wrapping_add(1);
            }
        }
        if !self.sending && !self.tx_queue.is_empty() {
            self.sending = true;
            self.tx.listen();
        }
    }

    /// Bytes dropped because a queue was full or the receiver overran.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}
