//! Multi-source blocking wait.
//!
//! The drive manager's reconciler needs to sleep until any of three wake
//! sources fires: interface state change, interface available, exit. An
//! [`EventSet`] is a bitmask behind one mutex/condvar pair; each source is
//! an [`EventHandle`] bound to a bit. Handles are cheap clones and safe to
//! hand to other threads (the transport backends signal them).
//!
//! Sources are manual-reset by default: a signaled bit stays set until
//! someone clears it. A source created with [`EventSet::auto_handle`] is
//! cleared by the waiter as part of waking up.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    signaled: u32,
    auto_reset: u32,
}

/// A group of wake sources sharing one waiter.
pub struct EventSet {
    inner: Arc<Inner>,
}

/// Signalling side of a single source in an [`EventSet`].
#[derive(Clone)]
pub struct EventHandle {
    inner: Arc<Inner>,
    bit: u32,
}

impl EventSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    signaled: 0,
                    auto_reset: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// A manual-reset source on `bit` (a single-bit mask).
    pub fn handle(&self, bit: u32) -> EventHandle {
        debug_assert_eq!(bit.count_ones(), 1);
        EventHandle {
            inner: self.inner.clone(),
            bit,
        }
    }

    /// An auto-reset source on `bit`: its flag is consumed by the wake.
    pub fn auto_handle(&self, bit: u32) -> EventHandle {
        debug_assert_eq!(bit.count_ones(), 1);
        let mut state = self.inner.state.lock().unwrap();
        state.auto_reset |= bit;
        drop(state);
        self.handle(bit)
    }

    /// Block until at least one source in `mask` is signaled. Returns the
    /// fired bits; auto-reset bits among them are cleared.
    pub fn wait_any(&self, mask: u32) -> u32 {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let fired = state.signaled & mask;
            if fired != 0 {
                state.signaled &= !(fired & state.auto_reset);
                return fired;
            }
            state = self.inner.cv.wait(state).unwrap();
        }
    }

    /// Like [`wait_any`](Self::wait_any) but gives up after `timeout`,
    /// returning `0`.
    pub fn wait_any_timeout(&self, mask: u32, timeout: Duration) -> u32 {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let fired = state.signaled & mask;
            if fired != 0 {
                state.signaled &= !(fired & state.auto_reset);
                return fired;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self.inner.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

impl Default for EventSet {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandle {
    pub fn signal(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.signaled |= self.bit;
        drop(state);
        self.inner.cv.notify_all();
    }

    pub fn clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.signaled &= !self.bit;
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().signaled & self.bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_fired_bit() {
        let set = EventSet::new();
        let a = set.handle(0b01);
        a.signal();
        assert_eq!(set.wait_any(0b11), 0b01);
        // Manual reset: still signaled until cleared.
        assert!(a.is_signaled());
        a.clear();
        assert!(!a.is_signaled());
    }

    #[test]
    fn auto_reset_is_consumed_by_wake() {
        let set = EventSet::new();
        let a = set.auto_handle(0b10);
        a.signal();
        assert_eq!(set.wait_any(0b10), 0b10);
        assert!(!a.is_signaled());
        assert_eq!(set.wait_any_timeout(0b10, Duration::from_millis(10)), 0);
    }

    #[test]
    fn cross_thread_signal_wakes_waiter() {
        let set = EventSet::new();
        let h = set.handle(0b100);
        let signaller = {
            let h = h.clone();
            thread::spawn(move || h.signal())
        };
        assert_eq!(set.wait_any(0b100), 0b100);
        signaller.join().unwrap();
    }
}
