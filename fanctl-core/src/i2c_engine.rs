//! Interrupt-driven I2C transaction engine.
//!
//! The engine walks a table of transactions round-robin. Bytes move inside
//! the bus interrupt via [`I2cEngine::on_irq`]; the foreground sequences the
//! table from [`I2cEngine::service`] whenever [`Event::BUS`] is raised. A
//! periodic [`I2cEngine::check_watchdog`] resets a wedged bus.

use heapless::Vec;

use crate::{
    event::{Event, EventFlags},
    i2c::{BusIrq, Direction, I2cBus, I2cStatus, Irq, Transaction, MAX_TRANSFER},
};

/// Maximum number of polls waiting for the bus to become idle.
pub const BUSY_SPIN_LIMIT: u32 = 10_000;

/// Outcome of a sequencing pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Sequenced {
    /// No transaction has been started.
    Idle,
    /// Active transaction is still transferring.
    InFlight,
    /// Entry completed and the next one was started.
    Completed(usize),
    /// Entry was not acknowledged and has been restarted.
    Retrying(usize),
    /// Entry was not acknowledged twice and has been skipped.
    Aborted(usize),
}

/// Bus statistics.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusStats {
    /// Transactions completed since startup.
    pub completed: u32,
    /// Not acknowledged attempts since startup.
    pub naks: u32,
    /// Watchdog resets since startup.
    pub resets: u32,
}

struct Active<K> {
    index: usize,
    xfer: Transaction<K>,
}

/// Sequences a table of I2C transactions over one bus.
pub struct I2cEngine<K, const N: usize> {
    table: Vec<Transaction<K>, N>,
    active: Option<Active<K>>,
    retried: bool,
    ready: [bool; N],
    window_completed: u16,
    min_completed: u16,
    stats: BusStats,
}

impl<K: Copy, const N: usize> I2cEngine<K, N> {
    /// Creates the engine.
    ///
    /// The watchdog resets the bus when fewer than `min_completed`
    /// transactions complete between two checks.
    pub fn new(table: Vec<Transaction<K>, N>, min_completed: u16) -> Self {
        Self {
            table,
            active: None,
            retried: false,
            ready: [false; N],
            window_completed: 0,
            min_completed,
            stats: BusStats::default(),
        }
    }

    /// Transaction table.
    pub fn table(&self) -> &[Transaction<K>] {
        &self.table
    }

    /// Whether a transaction is transferring.
    pub fn in_flight(&self) -> bool {
        matches!(self.active_status(), I2cStatus::Busy | I2cStatus::Transmitting | I2cStatus::Receiving)
    }

    /// Status of the active slot.
    pub fn active_status(&self) -> I2cStatus {
        self.active.as_ref().map(|active| active.xfer.status).unwrap_or_default()
    }

    /// Table index of the active slot.
    pub fn active_index(&self) -> Option<usize> {
        self.active.as_ref().map(|active| active.index)
    }

    /// Takes the lowest index of the completed entries awaiting transformation.
    ///
    /// Each entry is reported at most once per completion.
    pub fn take_ready(&mut self) -> Option<usize> {
        let index = self.ready.iter().position(|&ready| ready)?;
        self.ready[index] = false;
        Some(index)
    }

    /// Bus statistics.
    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Watchdog resets since startup.
    pub fn reset_count(&self) -> u32 {
        self.stats.resets
    }

    /// Transactions completed since the last watchdog check.
    pub fn window_completed(&self) -> u16 {
        self.window_completed
    }

    /// Starts sequencing from the first entry unless already running.
    pub fn begin(&mut self, bus: &mut impl I2cBus) {
        if self.active.is_none() {
            self.start(bus, 0);
        }
    }

    /// Starts the table entry at `index`.
    ///
    /// Must not be called while a transaction is in flight.
    pub fn start(&mut self, bus: &mut impl I2cBus, index: usize) {
        debug_assert!(!self.in_flight(), "I2C transaction started while another is in flight");

        let Some(entry) = self.table.get_mut(index) else {
            self.active = None;
            return;
        };
        entry.status = I2cStatus::Busy;

        // The table keeps the last completed data until this attempt completes.
        let mut xfer = entry.clone();
        xfer.reset_counts();
        let addr = xfer.addr();
        trace!("I2C start #{} at 0x{:02x}", index, addr);

        bus.listen(Irq::Nak);
        if xfer.tx_len_u8() == 0 && xfer.rx_len_u8() > 0 {
            xfer.status = I2cStatus::Receiving;
            bus.listen(Irq::Rx);
            bus.start(addr, Direction::Read);
            if xfer.rx_len_u8() == 1 {
                bus.request_stop();
            }
        } else {
            xfer.status = I2cStatus::Transmitting;
            bus.listen(Irq::Tx);
            bus.start(addr, Direction::Write);
        }

        self.active = Some(Active { index, xfer });
    }

    /// Handles a bus interrupt.
    ///
    /// Returns true if the foreground must be woken.
    pub fn on_irq(&mut self, bus: &mut impl I2cBus, irq: BusIrq, events: &EventFlags) -> bool {
        let Some(active) = self.active.as_mut() else { return false };
        let xfer = &mut active.xfer;

        match (irq, xfer.status) {
            (BusIrq::Received(byte), I2cStatus::Receiving) => {
                let count = xfer.rx_count as usize;
                if count < xfer.rx_len() && count < MAX_TRANSFER {
                    xfer.rx[count] = byte;
                    xfer.rx_count += 1;
                }

                match xfer.rx_len_u8().saturating_sub(xfer.rx_count) {
                    0 => {
                        bus.unlisten(Irq::Rx);
                        bus.unlisten(Irq::Nak);
                        self.complete(events);
                        true
                    }
                    1 => {
                        bus.request_stop();
                        false
                    }
                    _ => false,
                }
            }
            (BusIrq::TxEmpty, I2cStatus::Transmitting) => {
                if xfer.tx_count < xfer.tx_len_u8() {
                    bus.write(xfer.tx[xfer.tx_count as usize]);
                    xfer.tx_count += 1;
                    return false;
                }

                bus.unlisten(Irq::Tx);
                let (index, tx_count) = (active.index, xfer.tx_count);
                if let Some(entry) = self.table.get_mut(index) {
                    entry.tx_count = tx_count;
                }

                if xfer.rx_len_u8() > 0 {
                    xfer.status = I2cStatus::Receiving;
                    bus.listen(Irq::Rx);
                    bus.repeat_start(xfer.addr(), Direction::Read);
                    if xfer.rx_len_u8() == 1 {
                        bus.request_stop();
                    }
                    false
                } else {
                    bus.request_stop();
                    bus.unlisten(Irq::Nak);
                    self.complete(events);
                    true
                }
            }
            (BusIrq::Nak, I2cStatus::Busy | I2cStatus::Transmitting | I2cStatus::Receiving) => {
                xfer.status = I2cStatus::Nak;
                bus.unlisten(Irq::Tx);
                bus.unlisten(Irq::Rx);
                bus.unlisten(Irq::Nak);
                if let Some(entry) = self.table.get_mut(active.index) {
                    entry.status = I2cStatus::Nak;
                }
                events.raise(Event::BUS);
                true
            }
            _ => false,
        }
    }

    fn complete(&mut self, events: &EventFlags) {
        let Some(active) = self.active.as_mut() else { return };
        active.xfer.status = I2cStatus::Complete;

        if let Some(entry) = self.table.get_mut(active.index) {
            entry.status = I2cStatus::Complete;
            entry.tx_count = active.xfer.tx_count;
            entry.rx_count = active.xfer.rx_count;
            entry.rx = active.xfer.rx;
        }

        events.raise(Event::BUS);
    }

    /// Advances the sequencer after the active transaction finished.
    ///
    /// Called from the foreground when [`Event::BUS`] is taken. A completed
    /// entry is marked ready and [`Event::SAMPLE_READY`] is raised. A not
    /// acknowledged entry is retried once and skipped on the second failure.
    pub fn service(&mut self, bus: &mut impl I2cBus, events: &EventFlags) -> Sequenced {
        let Some((index, status)) = self.active.as_ref().map(|active| (active.index, active.xfer.status)) else {
            return Sequenced::Idle;
        };

        match status {
            I2cStatus::Complete => {
                wait_idle(bus);
                if let Some(ready) = self.ready.get_mut(index) {
                    *ready = true;
                }
                events.raise(Event::SAMPLE_READY);
                self.window_completed = self.window_completed.saturating_add(1);
                self.stats.completed = self.stats.completed.wrapping_add(1);
                self.advance(bus, index);
                Sequenced::Completed(index)
            }
            I2cStatus::Nak if !self.retried => {
                debug!("I2C #{} not acknowledged, retrying", index);
                self.stats.naks = self.stats.naks.wrapping_add(1);
                self.retried = true;
                self.start(bus, index);
                Sequenced::Retrying(index)
            }
            I2cStatus::Nak => {
                warn!("I2C #{} not acknowledged twice, skipping", index);
                self.stats.naks = self.stats.naks.wrapping_add(1);
                bus.request_stop();
                wait_idle(bus);
                self.advance(bus, index);
                Sequenced::Aborted(index)
            }
            _ => Sequenced::InFlight,
        }
    }

    fn advance(&mut self, bus: &mut impl I2cBus, index: usize) {
        self.retried = false;
        let next = if index + 1 < self.table.len() { index + 1 } else { 0 };
        self.start(bus, next);
    }

    /// Checks that the bus made progress since the last check.
    ///
    /// Resets the peripheral and restarts from the first entry if fewer
    /// transactions than configured completed. Returns whether a reset
    /// happened.
    pub fn check_watchdog(&mut self, bus: &mut impl I2cBus) -> bool {
        let completed = core::mem::take(&mut self.window_completed);
        if completed >= self.min_completed {
            return false;
        }

        warn!("I2C bus stalled after {} transactions, resetting", completed);
        self.reset_bus(bus);

        true
    }

    /// Resets the peripheral and restarts from the first entry.
    ///
    /// An interrupted entry returns to idle.
    pub fn reset_bus(&mut self, bus: &mut impl I2cBus) {
        bus.reset();
        self.stats.resets = self.stats.resets.wrapping_add(1);

        if let Some(active) = self.active.take() {
            if let Some(entry) = self.table.get_mut(active.index) {
                if !matches!(entry.status, I2cStatus::Complete | I2cStatus::Nak) {
                    entry.status = I2cStatus::Idle;
                }
            }
        }
        self.retried = false;
        self.window_completed = 0;
        self.start(bus, 0);
    }
}

/// Polls until the bus is idle, giving up after [`BUSY_SPIN_LIMIT`] polls.
fn wait_idle(bus: &mut impl I2cBus) -> bool {
    for _ in 0..BUSY_SPIN_LIMIT {
        if !bus.is_busy() {
            return true;
        }
    }

    warn!("I2C bus still busy after {} polls", BUSY_SPIN_LIMIT);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bus that acknowledges everything and is never busy.
    #[derive(Default)]
    struct QuietBus {
        resets: usize,
        stops: usize,
    }

    impl I2cBus for QuietBus {
        fn start(&mut self, _addr: u8, _dir: Direction) {}
        fn repeat_start(&mut self, _addr: u8, _dir: Direction) {}
        fn request_stop(&mut self) {
            self.stops += 1;
        }
        fn write(&mut self, _byte: u8) {}
        fn listen(&mut self, _irq: Irq) {}
        fn unlisten(&mut self, _irq: Irq) {}
        fn is_busy(&mut self) -> bool {
            false
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn engine() -> I2cEngine<u8, 4> {
        let mut table = Vec::new();
        table.push(Transaction::write_read(0x48, &[0x00], 2, 0).unwrap()).unwrap();
        table.push(Transaction::read(0x49, 1, 1).unwrap()).unwrap();
        I2cEngine::new(table, 1)
    }

    #[test]
    fn empty_table_stays_idle() {
        let mut bus = QuietBus::default();
        let events = EventFlags::new();
        let mut engine: I2cEngine<u8, 2> = I2cEngine::new(Vec::new(), 1);

        engine.begin(&mut bus);
        assert_eq!(engine.service(&mut bus, &events), Sequenced::Idle);
        assert!(!engine.on_irq(&mut bus, BusIrq::TxEmpty, &events));
    }

    #[test]
    fn direct_read_starts_receiving() {
        let mut bus = QuietBus::default();
        let mut engine = engine();

        engine.start(&mut bus, 1);

        assert_eq!(engine.active_status(), I2cStatus::Receiving);
        assert_eq!(engine.table()[1].status(), I2cStatus::Busy);
        assert_eq!(bus.stops, 1);
    }

    #[test]
    fn spurious_interrupts_are_ignored() {
        let mut bus = QuietBus::default();
        let events = EventFlags::new();
        let mut engine = engine();

        assert!(!engine.on_irq(&mut bus, BusIrq::Received(1), &events));
        engine.begin(&mut bus);
        assert!(!engine.on_irq(&mut bus, BusIrq::Received(1), &events));
        assert_eq!(engine.active_status(), I2cStatus::Transmitting);
        assert!(events.is_idle());
    }

    #[test]
    fn watchdog_clears_window_on_every_check() {
        let mut bus = QuietBus::default();
        let events = EventFlags::new();
        let mut engine = engine();
        engine.begin(&mut bus);

        engine.on_irq(&mut bus, BusIrq::TxEmpty, &events);
        engine.on_irq(&mut bus, BusIrq::TxEmpty, &events);
        engine.on_irq(&mut bus, BusIrq::Received(0x19), &events);
        engine.on_irq(&mut bus, BusIrq::Received(0x20), &events);
        assert_eq!(engine.service(&mut bus, &events), Sequenced::Completed(0));
        assert_eq!(engine.window_completed(), 1);

        assert!(!engine.check_watchdog(&mut bus));
        assert_eq!(engine.window_completed(), 0);
        assert!(engine.check_watchdog(&mut bus));
        assert_eq!(bus.resets, 1);
        assert_eq!(engine.active_index(), Some(0));
    }

    #[test]
    fn forced_reset_restarts_first_entry() {
        let mut bus = QuietBus::default();
        let events = EventFlags::new();
        let mut engine = engine();
        engine.begin(&mut bus);
        engine.on_irq(&mut bus, BusIrq::TxEmpty, &events);

        engine.reset_bus(&mut bus);

        assert_eq!(bus.resets, 1);
        assert_eq!(engine.stats().resets, 1);
        assert_eq!(engine.active_index(), Some(0));
        assert_eq!(engine.active_status(), I2cStatus::Transmitting);
        assert!(events.is_idle());
    }
}
