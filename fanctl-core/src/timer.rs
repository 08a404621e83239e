//! Software timers driven by a periodic tick.
//!
//! Timers are defined once into a fixed-capacity arena and then linked into
//! the registration list. The tick interrupt advances every running timer
//! and latches expired ones; the foreground services latched timers in
//! registration order.

use core::fmt;
use heapless::Vec;

use crate::event::{Event, EventFlags};

/// Handle of a software timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(u8);

impl TimerId {
    /// Heartbeat timer heading the registration list.
    ///
    /// It is always registered and running. Client operations on it fail
    /// with [`TimerError::Reserved`].
    pub const HEAD: Self = Self(0);

    /// Arena index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What happens to a timer after it has been serviced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recurrence {
    /// Disabled after servicing.
    OneShot,
    /// Restarted after servicing.
    Recurring,
}

/// Timer status.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerStatus {
    /// Not counting.
    Disabled,
    /// Counting ticks.
    Running,
    /// Expired and waiting to be serviced.
    Done,
}

/// Timer registry error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerError {
    /// Timer is already registered.
    Duplicate,
    /// Timer is not registered or unknown.
    NotFound,
    /// Timer is already running or waiting to be serviced.
    InvalidEnable,
    /// No free timer slot.
    Full,
    /// Heartbeat timer cannot be manipulated.
    Reserved,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Duplicate => "timer already registered",
            Self::NotFound => "timer not registered",
            Self::InvalidEnable => "timer already running",
            Self::Full => "no free timer slot",
            Self::Reserved => "heartbeat timer is reserved",
        })
    }
}

/// Run mode of the tick source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunMode {
    /// No ticks are generated.
    Halted,
    /// Ticks are generated.
    Running,
}

/// Controls generation of ticks.
///
/// The registry halts ticks while it mutates the list and restores the
/// previous mode afterwards.
pub trait TickGate {
    /// Current run mode.
    fn run_mode(&mut self) -> RunMode;

    /// Sets the run mode.
    fn set_run_mode(&mut self, mode: RunMode);
}

/// A bare run mode acts as a gate without hardware behind it.
impl TickGate for RunMode {
    fn run_mode(&mut self) -> RunMode {
        *self
    }

    fn set_run_mode(&mut self, mode: RunMode) {
        *self = mode;
    }
}

#[derive(Clone, Copy)]
struct Slot<T> {
    timeout: u16,
    counter: u16,
    recurrence: Recurrence,
    status: TimerStatus,
    /// Expiry that must still be serviced after a disable or deregister.
    latched: bool,
    tag: T,
    linked: bool,
    prev: Option<TimerId>,
    next: Option<TimerId>,
}

impl<T> Slot<T> {
    const fn new(timeout: u16, recurrence: Recurrence, tag: T) -> Self {
        Self {
            timeout,
            counter: 0,
            recurrence,
            status: TimerStatus::Disabled,
            latched: false,
            tag,
            linked: false,
            prev: None,
            next: None,
        }
    }
}

/// Timers that expired, in registration order, with their tags.
pub type Expired<T, const N: usize> = Vec<(TimerId, T), N>;

/// Registry of software timers.
///
/// `T` tags each timer with its owner, `N` is the number of slots including
/// the heartbeat timer.
pub struct TimerRegistry<G, T, const N: usize> {
    gate: G,
    slots: Vec<Slot<T>, N>,
    tail: TimerId,
}

impl<G, T, const N: usize> TimerRegistry<G, T, N>
where
    G: TickGate,
    T: Copy,
{
    const CAPACITY_OK: () = assert!(N >= 1 && N <= 256, "timer registry capacity must be within 1..=256");

    /// Creates the registry with the heartbeat timer running at its head.
    pub fn new(gate: G, heartbeat_ticks: u16, heartbeat: T) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;

        let mut head = Slot::new(heartbeat_ticks, Recurrence::Recurring, heartbeat);
        head.status = TimerStatus::Running;
        head.linked = true;

        let mut slots = Vec::new();
        // Capacity is at least one.
        let _ = slots.push(head);

        Self { gate, slots, tail: TimerId::HEAD }
    }

    /// Allocates a timer.
    ///
    /// The timer is neither registered nor running.
    pub fn define(&mut self, timeout: u16, recurrence: Recurrence, tag: T) -> Result<TimerId, TimerError> {
        self.slots.push(Slot::new(timeout, recurrence, tag)).map_err(|_| TimerError::Full)?;
        Ok(TimerId((self.slots.len() - 1) as u8))
    }

    /// Appends the timer to the end of the registration list.
    ///
    /// The timer starts out disabled with a cleared counter.
    pub fn register(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.check_client(id)?;
        if self.slots[id.index()].linked {
            return Err(TimerError::Duplicate);
        }

        self.with_ticks_halted(|this| {
            let tail = this.tail;
            this.slots[tail.index()].next = Some(id);

            let slot = &mut this.slots[id.index()];
            slot.prev = Some(tail);
            slot.next = None;
            slot.linked = true;
            slot.counter = 0;
            slot.status = TimerStatus::Disabled;

            this.tail = id;
        });

        trace!("timer {} registered", id.0);
        Ok(())
    }

    /// Removes the timer from the registration list.
    ///
    /// A pending expiry is still serviced once.
    pub fn deregister(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.check_client(id)?;
        if !self.slots[id.index()].linked {
            return Err(TimerError::NotFound);
        }

        self.with_ticks_halted(|this| {
            let slot = this.slots[id.index()];
            let prev = slot.prev.unwrap_or(TimerId::HEAD);

            this.slots[prev.index()].next = slot.next;
            match slot.next {
                Some(next) => this.slots[next.index()].prev = Some(prev),
                None => this.tail = prev,
            }

            let slot = &mut this.slots[id.index()];
            slot.latched |= slot.status == TimerStatus::Done;
            slot.status = TimerStatus::Disabled;
            slot.linked = false;
            slot.prev = None;
            slot.next = None;
        });

        trace!("timer {} deregistered", id.0);
        Ok(())
    }

    /// Starts or stops a registered timer and clears its counter.
    ///
    /// Starting fails if the timer is running or waiting to be serviced.
    /// Stopping an expired timer does not cancel its pending service.
    pub fn set_enabled(&mut self, id: TimerId, on: bool) -> Result<(), TimerError> {
        self.check_client(id)?;
        let slot = &self.slots[id.index()];
        if !slot.linked {
            return Err(TimerError::NotFound);
        }
        if on && slot.status != TimerStatus::Disabled {
            return Err(TimerError::InvalidEnable);
        }

        self.with_ticks_halted(|this| {
            let slot = &mut this.slots[id.index()];
            slot.latched |= !on && slot.status == TimerStatus::Done;
            slot.status = if on { TimerStatus::Running } else { TimerStatus::Disabled };
            slot.counter = 0;
        });

        Ok(())
    }

    /// Starts a registered timer.
    pub fn enable(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.set_enabled(id, true)
    }

    /// Stops a registered timer.
    pub fn disable(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.set_enabled(id, false)
    }

    /// Changes the number of ticks until expiry.
    ///
    /// Takes effect on the next tick; the counter is kept.
    pub fn set_timeout(&mut self, id: TimerId, timeout: u16) -> Result<(), TimerError> {
        if id.index() >= self.slots.len() {
            return Err(TimerError::NotFound);
        }
        self.with_ticks_halted(|this| this.slots[id.index()].timeout = timeout);
        Ok(())
    }

    /// Advances all running timers by one tick.
    ///
    /// Called from the tick interrupt. Raises [`Event::TICKER`] and returns
    /// true if a timer expired, in which case the foreground must be woken.
    pub fn tick(&mut self, events: &EventFlags) -> bool {
        let mut expired = false;

        let mut cursor = Some(TimerId::HEAD);
        while let Some(id) = cursor {
            let slot = &mut self.slots[id.index()];
            if slot.status == TimerStatus::Running {
                slot.counter = slot.counter.saturating_add(1);
                if slot.counter >= slot.timeout {
                    slot.status = TimerStatus::Done;
                    expired = true;
                }
            }
            cursor = slot.next;
        }

        if expired {
            events.raise(Event::TICKER);
        }
        expired
    }

    /// Collects the timers awaiting service.
    ///
    /// Registered timers come first in registration order, followed by
    /// timers that expired and were deregistered before being serviced.
    /// Pass each entry to [`finish`](Self::finish) after running its action.
    pub fn take_expired(&mut self) -> Expired<T, N> {
        self.with_ticks_halted(|this| {
            let mut expired = Expired::new();

            // At most one entry per slot, so pushing cannot fail.
            let mut cursor = Some(TimerId::HEAD);
            while let Some(id) = cursor {
                let slot = &this.slots[id.index()];
                if slot.status == TimerStatus::Done || slot.latched {
                    let _ = expired.push((id, slot.tag));
                }
                cursor = slot.next;
            }

            for (index, slot) in this.slots.iter().enumerate() {
                if !slot.linked && slot.latched {
                    let _ = expired.push((TimerId(index as u8), slot.tag));
                }
            }

            expired
        })
    }

    /// Completes servicing of an expired timer.
    ///
    /// A timer that is still expired restarts if recurring and is disabled
    /// otherwise. A timer its action disabled or deregistered stays disabled.
    pub fn finish(&mut self, id: TimerId) {
        self.with_ticks_halted(|this| {
            let Some(slot) = this.slots.get_mut(id.index()) else { return };
            slot.latched = false;
            if slot.status == TimerStatus::Done {
                slot.status = match slot.recurrence {
                    Recurrence::Recurring => TimerStatus::Running,
                    Recurrence::OneShot => TimerStatus::Disabled,
                };
                slot.counter = 0;
            }
        })
    }

    /// Services all expired timers.
    ///
    /// The action may manipulate the registry. Returns the bitwise OR of
    /// the words returned by the actions.
    pub fn service(&mut self, mut action: impl FnMut(&mut Self, TimerId, T) -> u16) -> u16 {
        let mut result = 0;
        for (id, tag) in self.take_expired() {
            result |= action(self, id, tag);
            self.finish(id);
        }
        result
    }

    /// Status of a timer.
    pub fn status(&self, id: TimerId) -> Option<TimerStatus> {
        self.slots.get(id.index()).map(|slot| slot.status)
    }

    /// Ticks counted since the timer was last started.
    pub fn counter(&self, id: TimerId) -> Option<u16> {
        self.slots.get(id.index()).map(|slot| slot.counter)
    }

    /// Ticks until expiry.
    pub fn timeout(&self, id: TimerId) -> Option<u16> {
        self.slots.get(id.index()).map(|slot| slot.timeout)
    }

    /// Owner tag of a timer.
    pub fn tag(&self, id: TimerId) -> Option<T> {
        self.slots.get(id.index()).map(|slot| slot.tag)
    }

    /// Whether the timer is in the registration list.
    pub fn is_registered(&self, id: TimerId) -> bool {
        self.slots.get(id.index()).is_some_and(|slot| slot.linked)
    }

    /// Registered client timers in registration order.
    pub fn registered(&self) -> Registered<'_, T> {
        Registered { slots: &self.slots, cursor: self.slots[TimerId::HEAD.index()].next }
    }

    /// Number of defined timers including the heartbeat.
    pub fn defined(&self) -> usize {
        self.slots.len()
    }

    /// Tick gate.
    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Mutable tick gate.
    pub fn gate_mut(&mut self) -> &mut G {
        &mut self.gate
    }

    fn check_client(&self, id: TimerId) -> Result<(), TimerError> {
        if id == TimerId::HEAD {
            Err(TimerError::Reserved)
        } else if id.index() >= self.slots.len() {
            Err(TimerError::NotFound)
        } else {
            Ok(())
        }
    }

    fn with_ticks_halted<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let mode = self.gate.run_mode();
        self.gate.set_run_mode(RunMode::Halted);
        let result = f(self);
        self.gate.set_run_mode(mode);
        result
    }
}

/// Iterator over registered client timers.
pub struct Registered<'a, T> {
    slots: &'a [Slot<T>],
    cursor: Option<TimerId>,
}

impl<T> Iterator for Registered<'_, T> {
    type Item = TimerId;

    fn next(&mut self) -> Option<TimerId> {
        let id = self.cursor?;
        self.cursor = self.slots[id.index()].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    enum Owner {
        Heartbeat,
        Sampler,
        Blink,
        Report,
    }

    /// Gate that records every mode change.
    #[derive(Default)]
    struct RecordingGate {
        halted: bool,
        changes: std::vec::Vec<RunMode>,
    }

    impl TickGate for RecordingGate {
        fn run_mode(&mut self) -> RunMode {
            if self.halted {
                RunMode::Halted
            } else {
                RunMode::Running
            }
        }

        fn set_run_mode(&mut self, mode: RunMode) {
            self.halted = mode == RunMode::Halted;
            self.changes.push(mode);
        }
    }

    type Registry = TimerRegistry<RunMode, Owner, 8>;

    fn registry() -> Registry {
        TimerRegistry::new(RunMode::Running, 100, Owner::Heartbeat)
    }

    fn ticks(reg: &mut Registry, n: usize) -> usize {
        let events = EventFlags::new();
        (0..n).filter(|_| reg.tick(&events)).count()
    }

    #[test]
    fn register_rejects_duplicates() {
        let mut reg = registry();
        let id = reg.define(5, Recurrence::Recurring, Owner::Sampler).unwrap();

        reg.register(id).unwrap();
        assert_eq!(reg.register(id), Err(TimerError::Duplicate));
        assert_eq!(reg.registered().collect::<std::vec::Vec<_>>(), [id]);
    }

    #[test]
    fn enable_requires_registration() {
        let mut reg = registry();
        let id = reg.define(5, Recurrence::OneShot, Owner::Sampler).unwrap();

        assert_eq!(reg.enable(id), Err(TimerError::NotFound));
        assert_eq!(reg.deregister(id), Err(TimerError::NotFound));

        reg.register(id).unwrap();
        reg.enable(id).unwrap();
        assert_eq!(reg.enable(id), Err(TimerError::InvalidEnable));
        assert_eq!(reg.status(id), Some(TimerStatus::Running));
    }

    #[test]
    fn heartbeat_is_reserved() {
        let mut reg = registry();

        assert_eq!(reg.deregister(TimerId::HEAD), Err(TimerError::Reserved));
        assert_eq!(reg.disable(TimerId::HEAD), Err(TimerError::Reserved));
        assert_eq!(reg.register(TimerId::HEAD), Err(TimerError::Reserved));
        assert!(reg.is_registered(TimerId::HEAD));
        assert_eq!(reg.status(TimerId::HEAD), Some(TimerStatus::Running));
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let mut reg: TimerRegistry<RunMode, Owner, 2> = TimerRegistry::new(RunMode::Running, 10, Owner::Heartbeat);

        reg.define(1, Recurrence::OneShot, Owner::Blink).unwrap();
        assert_eq!(reg.define(1, Recurrence::OneShot, Owner::Blink), Err(TimerError::Full));
    }

    #[test]
    fn expires_on_the_tick_reaching_the_timeout() {
        let mut reg = registry();
        let id = reg.define(5, Recurrence::OneShot, Owner::Sampler).unwrap();
        reg.register(id).unwrap();
        reg.enable(id).unwrap();

        assert_eq!(ticks(&mut reg, 4), 0);
        assert_eq!(reg.status(id), Some(TimerStatus::Running));
        assert_eq!(reg.counter(id), Some(4));

        assert_eq!(ticks(&mut reg, 1), 1);
        assert_eq!(reg.status(id), Some(TimerStatus::Done));

        // Expired timers stop counting.
        ticks(&mut reg, 3);
        assert_eq!(reg.counter(id), Some(5));
    }

    #[test]
    fn tick_raises_ticker_event() {
        let mut reg = registry();
        let id = reg.define(1, Recurrence::OneShot, Owner::Blink).unwrap();
        reg.register(id).unwrap();
        reg.enable(id).unwrap();

        let events = EventFlags::new();
        assert!(reg.tick(&events));
        assert!(events.take(Event::TICKER));
        assert!(!reg.tick(&events));
        assert!(events.is_idle());
    }

    #[test]
    fn service_applies_recurrence() {
        let mut reg = registry();
        let once = reg.define(2, Recurrence::OneShot, Owner::Blink).unwrap();
        let again = reg.define(2, Recurrence::Recurring, Owner::Sampler).unwrap();
        for id in [once, again] {
            reg.register(id).unwrap();
            reg.enable(id).unwrap();
        }
        ticks(&mut reg, 2);

        let mut serviced = std::vec::Vec::new();
        let word = reg.service(|_, id, owner| {
            serviced.push((id, owner));
            if owner == Owner::Blink {
                0x01
            } else {
                0x10
            }
        });

        assert_eq!(serviced, [(once, Owner::Blink), (again, Owner::Sampler)]);
        assert_eq!(word, 0x11);
        assert_eq!(reg.status(once), Some(TimerStatus::Disabled));
        assert_eq!(reg.status(again), Some(TimerStatus::Running));
        assert_eq!(reg.counter(again), Some(0));
    }

    #[test]
    fn heartbeat_recurs() {
        let mut reg = registry();
        ticks(&mut reg, 100);

        let mut beats = 0;
        reg.service(|_, id, owner| {
            assert_eq!((id, owner), (TimerId::HEAD, Owner::Heartbeat));
            beats += 1;
            0
        });

        assert_eq!(beats, 1);
        assert_eq!(reg.status(TimerId::HEAD), Some(TimerStatus::Running));
    }

    #[test]
    fn disabled_expiry_is_serviced_once() {
        let mut reg = registry();
        let id = reg.define(1, Recurrence::Recurring, Owner::Report).unwrap();
        reg.register(id).unwrap();
        reg.enable(id).unwrap();
        ticks(&mut reg, 1);

        reg.disable(id).unwrap();
        assert_eq!(reg.status(id), Some(TimerStatus::Disabled));

        let mut calls = 0;
        reg.service(|_, _, _| {
            calls += 1;
            0
        });
        assert_eq!(calls, 1);
        assert_eq!(reg.status(id), Some(TimerStatus::Disabled));

        reg.service(|_, _, _| {
            calls += 1;
            0
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn deregistered_expiry_is_serviced_once() {
        let mut reg = registry();
        let id = reg.define(1, Recurrence::OneShot, Owner::Report).unwrap();
        reg.register(id).unwrap();
        reg.enable(id).unwrap();
        ticks(&mut reg, 1);
        reg.deregister(id).unwrap();

        let expired = reg.take_expired();
        assert_eq!(expired.as_slice(), [(id, Owner::Report)]);
        reg.finish(id);

        assert!(reg.take_expired().is_empty());
        assert!(!reg.is_registered(id));
    }

    #[test]
    fn action_may_deregister_its_own_timer() {
        let mut reg = registry();
        let id = reg.define(3, Recurrence::Recurring, Owner::Sampler).unwrap();
        reg.register(id).unwrap();
        reg.enable(id).unwrap();
        ticks(&mut reg, 3);

        reg.service(|reg, id, _| {
            reg.deregister(id).unwrap();
            assert_eq!(reg.register(id), Ok(()));
            assert_eq!(reg.register(id), Err(TimerError::Duplicate));
            0
        });

        assert!(reg.is_registered(id));
        assert_eq!(reg.status(id), Some(TimerStatus::Disabled));
    }

    #[test]
    fn unlink_keeps_neighbours_connected() {
        let mut reg = registry();
        let ids: std::vec::Vec<_> =
            (0..4).map(|_| reg.define(1, Recurrence::OneShot, Owner::Blink).unwrap()).collect();
        for &id in &ids {
            reg.register(id).unwrap();
        }

        reg.deregister(ids[1]).unwrap();
        reg.deregister(ids[3]).unwrap();
        reg.register(ids[1]).unwrap();

        assert_eq!(reg.registered().collect::<std::vec::Vec<_>>(), [ids[0], ids[2], ids[1]]);
    }

    #[test]
    fn mutations_halt_ticks_and_restore_run_mode() {
        let mut reg: TimerRegistry<RecordingGate, Owner, 4> =
            TimerRegistry::new(RecordingGate::default(), 10, Owner::Heartbeat);
        let id = reg.define(1, Recurrence::OneShot, Owner::Blink).unwrap();

        reg.register(id).unwrap();
        reg.enable(id).unwrap();
        assert_eq!(reg.gate().changes, [RunMode::Halted, RunMode::Running, RunMode::Halted, RunMode::Running]);

        reg.gate_mut().halted = true;
        reg.gate_mut().changes.clear();
        reg.deregister(id).unwrap();
        assert_eq!(reg.gate().changes, [RunMode::Halted, RunMode::Halted]);
        assert!(reg.gate().halted);
    }

    #[test]
    fn failed_operations_do_not_touch_the_gate() {
        let mut reg: TimerRegistry<RecordingGate, Owner, 4> =
            TimerRegistry::new(RecordingGate::default(), 10, Owner::Heartbeat);
        let id = reg.define(1, Recurrence::OneShot, Owner::Blink).unwrap();

        assert_eq!(reg.enable(id), Err(TimerError::NotFound));
        assert!(reg.gate().changes.is_empty());
    }
}
