//! Pending foreground work.
//!
//! Interrupt handlers and timer callbacks raise events; the foreground loop
//! takes them in ascending bit order and runs the matching handler.

use core::{
    fmt,
    sync::atomic::{AtomicU16, Ordering},
};

/// Number of distinct events.
pub const EVENT_BITS: u8 = 16;

/// A foreground obligation identified by its bit position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Event(u8);

impl Event {
    /// Software timers have expired.
    pub const TICKER: Self = Self(0);
    /// Periodic diagnostics report is due.
    pub const DIAGNOSTICS: Self = Self(1);
    /// Console received a byte.
    pub const UART_RX: Self = Self(4);
    /// Console transmit queue drained.
    pub const UART_TX: Self = Self(5);
    /// Active I2C transaction completed or was not acknowledged.
    pub const BUS: Self = Self(8);
    /// Completed I2C sample is ready for transformation.
    pub const SAMPLE_READY: Self = Self(9);
    /// ADC sample is due.
    pub const ADC_SAMPLE: Self = Self(12);
    /// Heater stagger finished.
    pub const HEATER: Self = Self(13);

    /// Event at the specified bit position.
    ///
    /// Panics if `bit` is not below [`EVENT_BITS`].
    pub const fn custom(bit: u8) -> Self {
        assert!(bit < EVENT_BITS, "event bit out of range");
        Self(bit)
    }

    /// Bit position.
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Bit mask.
    pub const fn mask(self) -> u16 {
        1 << self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::TICKER => "ticker",
            Self::DIAGNOSTICS => "diagnostics",
            Self::UART_RX => "uart-rx",
            Self::UART_TX => "uart-tx",
            Self::BUS => "bus",
            Self::SAMPLE_READY => "sample-ready",
            Self::ADC_SAMPLE => "adc-sample",
            Self::HEATER => "heater",
            _ => return None,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "event{}", self.0),
        }
    }
}

/// Set of pending events.
///
/// Bits are set from any context and cleared only by the foreground loop.
#[derive(Default)]
pub struct EventFlags(AtomicU16);

impl EventFlags {
    /// No pending events.
    pub const fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    /// Marks the event as pending.
    pub fn raise(&self, event: Event) {
        self.0.fetch_or(event.mask(), Ordering::AcqRel);
    }

    /// Clears the event and returns whether it was pending.
    pub fn take(&self, event: Event) -> bool {
        self.0.fetch_and(!event.mask(), Ordering::AcqRel) & event.mask() != 0
    }

    /// Whether the event is pending.
    pub fn is_pending(&self, event: Event) -> bool {
        self.pending() & event.mask() != 0
    }

    /// Bit mask of all pending events.
    pub fn pending(&self) -> u16 {
        self.0.load(Ordering::Acquire)
    }

    /// Whether no event is pending.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Handles pending events until none remain.
    ///
    /// Each pass visits the pending bits in ascending order, clearing a bit
    /// immediately before its handler runs. An event raised while a handler
    /// runs is handled in a later pass.
    ///
    /// Returns the number of handler invocations.
    pub fn dispatch(&self, mut handler: impl FnMut(Event)) -> usize {
        let mut handled = 0;
        loop {
            let pending = self.pending();
            if pending == 0 {
                return handled;
            }

            for bit in 0..EVENT_BITS {
                let event = Event(bit);
                if pending & event.mask() != 0 && self.take(event) {
                    handler(event);
                    handled += 1;
                }
            }
        }
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventFlags({:#06x})", self.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears_only_the_requested_bit() {
        let events = EventFlags::new();
        events.raise(Event::BUS);
        events.raise(Event::TICKER);

        assert!(events.take(Event::BUS));
        assert!(!events.take(Event::BUS));
        assert!(events.is_pending(Event::TICKER));
        assert_eq!(events.pending(), Event::TICKER.mask());
    }

    #[test]
    fn dispatch_runs_handlers_in_bit_order() {
        let events = EventFlags::new();
        events.raise(Event::HEATER);
        events.raise(Event::BUS);
        events.raise(Event::TICKER);

        let mut seen = Vec::new();
        let handled = events.dispatch(|event| seen.push(event));

        assert_eq!(seen, [Event::TICKER, Event::BUS, Event::HEATER]);
        assert_eq!(handled, 3);
        assert!(events.is_idle());
    }

    #[test]
    fn event_raised_during_handler_is_not_lost() {
        let events = EventFlags::new();
        events.raise(Event::BUS);

        let mut seen = Vec::new();
        events.dispatch(|event| {
            seen.push(event);
            if seen.len() == 1 {
                events.raise(Event::BUS);
                events.raise(Event::TICKER);
            }
        });

        assert_eq!(seen, [Event::BUS, Event::TICKER, Event::BUS]);
        assert!(events.is_idle());
    }

    #[test]
    fn custom_events_have_readable_names() {
        assert_eq!(format!("{}", Event::custom(3)), "event3");
        assert_eq!(format!("{}", Event::SAMPLE_READY), "sample-ready");
        assert_eq!(Event::custom(8), Event::BUS);
    }
}
