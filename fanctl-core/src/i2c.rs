//! I2C transaction descriptors and the bus interface.

use core::fmt;

/// Bytes per direction in a transaction.
pub const MAX_TRANSFER: usize = 8;

/// Transaction status.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cStatus {
    /// Not started.
    #[default]
    Idle,
    /// Start condition issued.
    Busy,
    /// Sending bytes to the target.
    Transmitting,
    /// Receiving bytes from the target.
    Receiving,
    /// Target did not acknowledge.
    Nak,
    /// All bytes transferred.
    Complete,
}

/// Transfer direction of an addressing phase.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Master writes.
    Write,
    /// Master reads.
    Read,
}

/// Bus interrupt source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Irq {
    /// Transmit register empty.
    Tx,
    /// Receive register not empty.
    Rx,
    /// Acknowledge failure.
    Nak,
}

/// Interrupt delivered to the transaction engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusIrq {
    /// Transmit register is empty.
    TxEmpty,
    /// A byte was received.
    Received(u8),
    /// Target did not acknowledge.
    Nak,
}

/// I2C master peripheral as used by the transaction engine.
///
/// All methods only program the peripheral and never wait.
pub trait I2cBus {
    /// Issues a start condition and the address phase.
    fn start(&mut self, addr: u8, dir: Direction);

    /// Issues a repeated start and the address phase without releasing the bus.
    fn repeat_start(&mut self, addr: u8, dir: Direction);

    /// Requests a stop condition after the current byte.
    fn request_stop(&mut self);

    /// Writes a byte to the transmit register.
    fn write(&mut self, byte: u8);

    /// Enables an interrupt source.
    fn listen(&mut self, irq: Irq);

    /// Disables an interrupt source.
    fn unlisten(&mut self, irq: Irq);

    /// Whether the bus is busy.
    fn is_busy(&mut self) -> bool;

    /// Resets the peripheral, abandoning any transfer.
    fn reset(&mut self);
}

/// Phase of a master transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MasterPhase {
    /// No transfer or the transfer was abandoned.
    #[default]
    Idle,
    /// Start condition requested.
    Starting,
    /// Address is being sent.
    Address,
    /// Address acknowledged, data bytes are moving.
    Data,
}

/// Places stop conditions of a master transfer.
///
/// A single byte read must be stopped while its address acknowledge is
/// cleared, so a stop requested during a read address phase is held until
/// [`addressed`](Self::addressed). Every other stop is issued immediately.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MasterState {
    phase: MasterPhase,
    dir: Direction,
    stop_after_addr: bool,
}

impl Default for MasterState {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterState {
    /// Idle state.
    pub const fn new() -> Self {
        Self { phase: MasterPhase::Idle, dir: Direction::Write, stop_after_addr: false }
    }

    /// Current phase.
    pub fn phase(&self) -> MasterPhase {
        self.phase
    }

    /// Direction of the latest address phase.
    pub fn dir(&self) -> Direction {
        self.dir
    }

    /// Whether a stop is held until the address is acknowledged.
    pub fn stop_pending(&self) -> bool {
        self.stop_after_addr
    }

    /// A start or repeated start was requested.
    pub fn start(&mut self, dir: Direction) {
        self.phase = MasterPhase::Starting;
        self.dir = dir;
        self.stop_after_addr = false;
    }

    /// The start condition went out and the address is being sent.
    pub fn start_sent(&mut self) {
        self.phase = MasterPhase::Address;
    }

    /// The address was acknowledged.
    ///
    /// Returns whether the held stop must be issued now.
    pub fn addressed(&mut self) -> bool {
        self.phase = MasterPhase::Data;
        core::mem::take(&mut self.stop_after_addr)
    }

    /// The transfer ended without a stop, by NAK, bus error or lost arbitration.
    pub fn abandon(&mut self) {
        self.phase = MasterPhase::Idle;
        self.stop_after_addr = false;
    }

    /// A stop was requested.
    ///
    /// Returns whether it must be issued now. The data phase lasts until the
    /// next start, since the final byte of a read arrives after the stop is
    /// requested.
    pub fn request_stop(&mut self) -> bool {
        match self.phase {
            MasterPhase::Starting | MasterPhase::Address if self.dir == Direction::Read => {
                self.stop_after_addr = true;
                return false;
            }
            MasterPhase::Data => (),
            _ => self.phase = MasterPhase::Idle,
        }

        self.stop_after_addr = false;
        true
    }
}

/// I2C error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum I2cError {
    /// Transfer exceeds the transaction buffer.
    TooLong,
}

impl fmt::Display for I2cError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLong => write!(f, "transfer exceeds {MAX_TRANSFER} bytes"),
        }
    }
}

/// One I2C exchange: optional write followed by optional read.
///
/// A read after a write uses a repeated start.
#[derive(Clone, Debug)]
pub struct Transaction<K> {
    addr: u8,
    pub(crate) status: I2cStatus,
    pub(crate) tx: [u8; MAX_TRANSFER],
    tx_len: u8,
    pub(crate) tx_count: u8,
    pub(crate) rx: [u8; MAX_TRANSFER],
    rx_len: u8,
    pub(crate) rx_count: u8,
    kind: K,
}

impl<K: Copy> Transaction<K> {
    /// Writes `tx`, then reads `rx_len` bytes.
    pub fn write_read(addr: u8, tx: &[u8], rx_len: usize, kind: K) -> Result<Self, I2cError> {
        if tx.len() > MAX_TRANSFER || rx_len > MAX_TRANSFER {
            return Err(I2cError::TooLong);
        }

        let mut this = Self {
            addr,
            status: I2cStatus::Idle,
            tx: [0; MAX_TRANSFER],
            tx_len: tx.len() as u8,
            tx_count: 0,
            rx: [0; MAX_TRANSFER],
            rx_len: rx_len as u8,
            rx_count: 0,
            kind,
        };
        this.tx[..tx.len()].copy_from_slice(tx);
        Ok(this)
    }

    /// Writes `tx`.
    pub fn write(addr: u8, tx: &[u8], kind: K) -> Result<Self, I2cError> {
        Self::write_read(addr, tx, 0, kind)
    }

    /// Reads `rx_len` bytes.
    pub fn read(addr: u8, rx_len: usize, kind: K) -> Result<Self, I2cError> {
        Self::write_read(addr, &[], rx_len, kind)
    }

    /// 7-bit target address.
    pub fn addr(&self) -> u8 {
        self.addr
    }

    /// Consumer tag.
    pub fn kind(&self) -> K {
        self.kind
    }

    /// Status of the latest attempt.
    pub fn status(&self) -> I2cStatus {
        self.status
    }

    /// Bytes to send.
    pub fn tx(&self) -> &[u8] {
        &self.tx[..self.tx_len as usize]
    }

    /// Number of bytes to receive.
    pub fn rx_len(&self) -> usize {
        self.rx_len as usize
    }

    /// Bytes sent by the latest attempt.
    pub fn tx_count(&self) -> usize {
        self.tx_count as usize
    }

    /// Bytes received by the latest attempt.
    pub fn received(&self) -> &[u8] {
        &self.rx[..self.rx_count as usize]
    }

    pub(crate) fn tx_len_u8(&self) -> u8 {
        self.tx_len
    }

    pub(crate) fn rx_len_u8(&self) -> u8 {
        self.rx_len
    }

    pub(crate) fn reset_counts(&mut self) {
        self.tx_count = 0;
        self.rx_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_reject_oversized_transfers() {
        assert_eq!(Transaction::write(0x48, &[0; MAX_TRANSFER + 1], ()).unwrap_err(), I2cError::TooLong);
        assert_eq!(Transaction::read(0x48, MAX_TRANSFER + 1, ()).unwrap_err(), I2cError::TooLong);
    }

    #[test]
    fn fresh_descriptor_is_idle() {
        let t = Transaction::write_read(0x48, &[0x00], 2, 7u8).unwrap();

        assert_eq!(t.status(), I2cStatus::Idle);
        assert_eq!(t.tx(), [0x00]);
        assert_eq!(t.rx_len(), 2);
        assert!(t.received().is_empty());
        assert_eq!(t.kind(), 7);
    }

    #[test]
    fn single_byte_read_stop_waits_for_address() {
        let mut state = MasterState::new();

        state.start(Direction::Read);
        assert!(!state.request_stop());
        state.start_sent();
        assert!(state.stop_pending());

        assert!(state.addressed());
        assert!(!state.stop_pending());
        assert_eq!(state.phase(), MasterPhase::Data);
    }

    #[test]
    fn stop_after_nak_on_read_address_is_immediate() {
        let mut state = MasterState::new();
        state.start(Direction::Write);
        state.start_sent();
        assert!(!state.addressed());

        // Repeated start for the read is not acknowledged.
        state.start(Direction::Read);
        state.start_sent();
        state.abandon();

        assert!(state.request_stop());
        assert!(!state.stop_pending());
        assert_eq!(state.phase(), MasterPhase::Idle);
    }

    #[test]
    fn stop_during_data_and_write_is_immediate() {
        let mut state = MasterState::new();
        state.start(Direction::Read);
        state.start_sent();
        state.addressed();
        assert!(state.request_stop());

        // The last byte is still delivered.
        assert_eq!(state.phase(), MasterPhase::Data);

        state.start(Direction::Write);
        assert!(state.request_stop());
        assert_eq!(state.phase(), MasterPhase::Idle);
    }

    #[test]
    fn restart_drops_held_stop() {
        let mut state = MasterState::new();
        state.start(Direction::Read);
        assert!(!state.request_stop());

        state.start(Direction::Write);
        assert!(!state.stop_pending());
    }
}
