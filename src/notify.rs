//! Fan-out of taint-state change events.
//!
//! Whenever a taint-storage cell changes, the producer reports the region it
//! belongs to together with the raw byte offset and the affected size. The
//! notifier decodes that into a [`TaintAddr`] and delivers it to every
//! registered observer, in registration order. Events on regions without a
//! guest-visible address are dropped.
//!
//! Delivery is synchronous and runs on the emulator thread. An observer must
//! not mutate the byte it is being notified about from within the callback;
//! that is a programmer error, not a checked condition.

use core::fmt::{self, Debug, Formatter};

use crate::addr::{TaintAddr, TaintRegion};

/// Receiver of taint-state change events.
pub trait TaintChangeObserver {
    fn on_taint_change(&mut self, addr: TaintAddr, size: u64);
}

impl<F> TaintChangeObserver for F
where
    F: FnMut(TaintAddr, u64),
{
    fn on_taint_change(&mut self, addr: TaintAddr, size: u64) {
        self(addr, size);
    }
}

/// Ordered list of change observers. Observers are registered at
/// initialization and stay registered for the process lifetime; there is no
/// unregistration path.
///
/// Change tracking is opt-in: until [`ChangeNotifier::arm`] is called,
/// events are discarded without decoding.
#[derive(Default)]
pub struct ChangeNotifier {
    observers: Vec<Box<dyn TaintChangeObserver>>,
    armed: bool,
}

impl ChangeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn TaintChangeObserver>) {
        self.observers.push(observer);
    }

    /// Switch change tracking on. Idempotent, never switched back off.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Deliver one change event. No-op while unarmed or when the region has
    /// no guest-visible address.
    pub fn notify(&mut self, region: TaintRegion, raw_off: u64, size: u64) {
        if !self.armed {
            return;
        }
        let Some(addr) = TaintAddr::from_region_offset(region, raw_off) else {
            return;
        };
        for observer in &mut self.observers {
            observer.on_taint_change(addr, size);
        }
    }
}

impl Debug for ChangeNotifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("observers", &self.observers.len())
            .field("armed", &self.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    fn recording_notifier() -> (ChangeNotifier, Rc<RefCell<Vec<(TaintAddr, u64)>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut notifier = ChangeNotifier::new();
        notifier.register(Box::new(move |addr: TaintAddr, size: u64| {
            sink.borrow_mut().push((addr, size));
        }));
        (notifier, seen)
    }

    #[test]
    fn unarmed_drops_events() {
        let (mut notifier, seen) = recording_notifier();
        notifier.notify(TaintRegion::Ram, 0x100, 1);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn armed_decodes_and_delivers() {
        let (mut notifier, seen) = recording_notifier();
        notifier.arm();
        notifier.notify(TaintRegion::Ram, 0x100, 4);
        notifier.notify(TaintRegion::GuestRegs, 9, 1);

        let seen = seen.borrow();
        assert_eq!(seen[0], (TaintAddr::Ram(0x100), 4));
        assert_eq!(seen[1], (TaintAddr::GuestReg { num: 1, off: 1 }, 1));
    }

    #[test]
    fn internal_region_not_delivered() {
        let (mut notifier, seen) = recording_notifier();
        notifier.arm();
        notifier.notify(TaintRegion::Hd, 0x100, 1);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn observers_run_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut notifier = ChangeNotifier::new();
        for tag in 0..3 {
            let order = Rc::clone(&order);
            notifier.register(Box::new(move |_addr: TaintAddr, _size: u64| {
                order.borrow_mut().push(tag);
            }));
        }
        notifier.arm();
        notifier.notify(TaintRegion::Ram, 0, 1);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
