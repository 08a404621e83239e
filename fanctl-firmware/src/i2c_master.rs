//! Interrupt driven I2C 2 master.

use defmt::Format;
use fanctl_core::i2c::{BusIrq, Direction, I2cBus, Irq, MasterPhase, MasterState};
use stm32f1::{
    stm32f103,
    stm32f103::{
        gpioa::odr::ODR0_A::{High, Low},
        GPIOB, I2C2,
    },
};
use stm32f1xx_hal::{
    gpio::{gpiob, Alternate, OpenDrain},
    i2c::{self, I2c},
    rcc::Clocks,
};

/// I2C error.
#[derive(Clone, Copy, Format, PartialEq, Eq)]
pub enum I2cError {
    /// Bus error
    Bus,
    /// Arbitration loss
    Arbitration,
    /// SDA line stuck low during recovery.
    SdaStuckLow,
}

/// I2C 2 pins.
pub type I2c2Pins = (gpiob::PB10<Alternate<OpenDrain>>, gpiob::PB11<Alternate<OpenDrain>>);

/// I2C 2 master driven from the event and error interrupts.
pub struct I2c2Master {
    hw: Option<(I2C2, I2c2Pins)>,
    mode: i2c::Mode,
    clocks: Clocks,
    state: MasterState,
    addr: u8,
    tx_irq: bool,
    rx_irq: bool,
}

impl I2c2Master {
    /// Configures the peripheral and enables its event interrupt.
    pub fn new(i2c: I2C2, pins: I2c2Pins, mode: i2c::Mode, clocks: Clocks) -> Self {
        let mut this =
            Self { hw: None, mode, clocks, state: MasterState::new(), addr: 0, tx_irq: false, rx_irq: false };
        this.init(i2c, pins);
        this
    }

    fn init(&mut self, i2c: I2C2, pins: I2c2Pins) {
        let (i2c, pins) = I2c::i2c2(i2c, pins, self.mode, self.clocks).release();
        i2c.cr2.modify(|_, w| w.itevten().set_bit().itbufen().clear_bit().iterren().clear_bit());
        self.hw = Some((i2c, pins));
        self.state = MasterState::new();
        self.tx_irq = false;
        self.rx_irq = false;
    }

    fn regs(&self) -> Option<&I2C2> {
        self.hw.as_ref().map(|(i2c, _)| i2c)
    }

    /// Handles an event or error interrupt.
    ///
    /// Address phases are completed internally. Data and acknowledge
    /// events are returned for the transaction engine.
    pub fn event(&mut self) -> nb::Result<BusIrq, I2cError> {
        let Some(i2c) = self.hw.as_ref().map(|(i2c, _)| i2c) else { return Err(nb::Error::WouldBlock) };
        let sr1 = i2c.sr1.read();

        if sr1.berr().bit_is_set() {
            i2c.sr1.modify(|_, w| w.berr().clear_bit());
            self.state.abandon();
            return Err(nb::Error::Other(I2cError::Bus));
        }
        if sr1.arlo().bit_is_set() {
            i2c.sr1.modify(|_, w| w.arlo().clear_bit());
            self.state.abandon();
            return Err(nb::Error::Other(I2cError::Arbitration));
        }
        if sr1.af().bit_is_set() {
            i2c.sr1.modify(|_, w| w.af().clear_bit());
            self.state.abandon();
            return Ok(BusIrq::Nak);
        }

        if sr1.sb().bit_is_set() {
            let rw = match self.state.dir() {
                Direction::Write => 0,
                Direction::Read => 1,
            };
            i2c.dr.write(|w| w.dr().bits(self.addr << 1 | rw));
            self.state.start_sent();
            return Err(nb::Error::WouldBlock);
        }

        if sr1.addr().bit_is_set() {
            // A single byte read must be NAKed before ADDR is cleared.
            if self.state.stop_pending() {
                i2c.cr1.modify(|_, w| w.ack().clear_bit());
            }
            let _ = i2c.sr2.read();
            if self.state.addressed() {
                i2c.cr1.modify(|_, w| w.stop().set_bit());
            }
            return Err(nb::Error::WouldBlock);
        }

        if self.state.phase() == MasterPhase::Data {
            if self.rx_irq && sr1.rxne().bit_is_set() {
                return Ok(BusIrq::Received(i2c.dr.read().dr().bits()));
            }
            if self.tx_irq && sr1.txe().bit_is_set() {
                return Ok(BusIrq::TxEmpty);
            }
        }

        Err(nb::Error::WouldBlock)
    }

    fn update_irqs(&mut self) {
        let buf = self.tx_irq || self.rx_irq;
        if let Some(i2c) = self.regs() {
            i2c.cr2.modify(|_, w| w.itbufen().bit(buf));
        }
    }

    fn issue_start(&mut self, addr: u8, dir: Direction) {
        self.addr = addr;
        self.state.start(dir);
        if let Some(i2c) = self.regs() {
            i2c.cr1.modify(|_, w| w.ack().set_bit().start().set_bit());
        }
    }
}

impl I2cBus for I2c2Master {
    fn start(&mut self, addr: u8, dir: Direction) {
        self.issue_start(addr, dir);
    }

    fn repeat_start(&mut self, addr: u8, dir: Direction) {
        self.issue_start(addr, dir);
    }

    fn request_stop(&mut self) {
        if !self.state.request_stop() {
            return;
        }
        if let Some(i2c) = self.regs() {
            i2c.cr1.modify(|_, w| w.ack().clear_bit().stop().set_bit());
        }
    }

    fn write(&mut self, byte: u8) {
        if let Some(i2c) = self.regs() {
            i2c.dr.write(|w| w.dr().bits(byte));
        }
    }

    fn listen(&mut self, irq: Irq) {
        match irq {
            Irq::Tx => self.tx_irq = true,
            Irq::Rx => self.rx_irq = true,
            Irq::Nak => {
                if let Some(i2c) = self.regs() {
                    i2c.cr2.modify(|_, w| w.iterren().set_bit());
                }
                return;
            }
        }
        self.update_irqs();
    }

    fn unlisten(&mut self, irq: Irq) {
        match irq {
            Irq::Tx => self.tx_irq = false,
            Irq::Rx => self.rx_irq = false,
            Irq::Nak => {
                if let Some(i2c) = self.regs() {
                    i2c.cr2.modify(|_, w| w.iterren().clear_bit());
                }
                return;
            }
        }
        self.update_irqs();
    }

    fn is_busy(&mut self) -> bool {
        self.regs().map(|i2c| i2c.sr2.read().busy().bit_is_set()).unwrap_or_default()
    }

    fn reset(&mut self) {
        let Some((i2c, pins)) = self.hw.take() else { return };
        i2c.cr1.modify(|_, w| w.pe().clear_bit());

        if let Err(err) = recover(&self.clocks) {
            defmt::error!("I2C bus recovery failed: {:?}", err);
        }

        defmt::debug!("Performing I2C master reset");
        self.init(i2c, pins);
    }
}

/// Allows temporary GPIO control over the I2C 2 SCL and SDA lines.
///
/// Drop to release.
struct I2c2Gpio {
    gpiob: GPIOB,
    saved_crh: stm32f1xx_hal::pac::gpioa::crh::R,
}

impl I2c2Gpio {
    /// Takes over the I2C 2 lines as GPIO outputs.
    fn new() -> Self {
        let device = unsafe { stm32f103::Peripherals::steal() };
        let gpiob = device.GPIOB;
        let saved_crh = gpiob.crh.read();
        Self { gpiob, saved_crh }
    }

    /// Drives SCL.
    fn scl(&self, level: bool) {
        self.gpiob.odr.modify(|_, w| w.odr10().variant(if level { High } else { Low }));
        self.gpiob.crh.modify(|_, w| w.cnf10().open_drain().mode10().output());
    }

    /// Drives SDA.
    fn sda(&self, level: bool) {
        self.gpiob.odr.modify(|_, w| w.odr11().variant(if level { High } else { Low }));
        self.gpiob.crh.modify(|_, w| w.cnf11().open_drain().mode11().output());
    }

    /// Releases SDA and samples it.
    fn read_sda(&self) -> bool {
        self.gpiob.crh.modify(|_, w| w.mode11().input());

        // Let the input settle.
        for _ in 0..32 {
            self.gpiob.idr.read();
        }

        self.gpiob.idr.read().idr11().is_high()
    }
}

impl Drop for I2c2Gpio {
    fn drop(&mut self) {
        // Hand the pins back to the I2C peripheral.
        self.gpiob.crh.modify(|_, w| {
            w.cnf10()
                .variant(self.saved_crh.cnf10().variant())
                .mode10()
                .variant(self.saved_crh.mode10().variant())
                .cnf11()
                .variant(self.saved_crh.cnf11().variant())
                .mode11()
                .variant(self.saved_crh.mode11().variant())
        });
    }
}

const CLOCK_HALF_PERIOD_US: u32 = 500;

/// Clocks SCL until all targets release SDA, then generates a stop condition.
fn recover(clocks: &Clocks) -> Result<(), I2cError> {
    defmt::debug!("Recovering I2C bus");
    let half_period = clocks.sysclk().to_MHz() * CLOCK_HALF_PERIOD_US;
    let delay = || cortex_m::asm::delay(half_period);
    let gpio = I2c2Gpio::new();

    // Release both lines.
    gpio.scl(true);
    delay();
    gpio.sda(true);
    delay();

    // Cycle SCL so that a target stuck in a transfer shifts out its byte.
    for _ in 0..15 {
        gpio.scl(false);
        delay();
        gpio.scl(true);
        delay();
    }

    // Keep clocking until SDA is released.
    let mut sda_value = false;
    for _ in 0..15 {
        gpio.scl(false);
        delay();
        gpio.scl(true);
        delay();

        sda_value = gpio.read_sda();
        if sda_value {
            break;
        }
    }

    // SDA still low, a target holds the bus.
    if !sda_value {
        return Err(I2cError::SdaStuckLow);
    }

    // Stop condition.
    gpio.scl(true);
    delay();
    gpio.sda(false);
    delay();
    gpio.sda(true);
    delay();

    Ok(())
}
