// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A level-triggered, multiplexed event-wait primitive. One [`Sleeper`]
//! waits on many [`Waker`]s; a fetch returns the identifier of a waker that
//! is currently asserted, atomically clearing its assertion. This is the
//! coordination primitive the TCP worker threads multiplex their inputs on
//! (new segments, timers, user notifications, close).

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    collections::BTreeSet,
    sync::{
        Arc,
        Condvar,
        Mutex,
    },
    time::Instant,
};

//==============================================================================
// Structures
//==============================================================================

struct SleeperShared {
    asserted: Mutex<BTreeSet<usize>>,
    cond: Condvar,
}

/// A single-consumer wait point associated with a set of wakers.
pub struct Sleeper {
    shared: Arc<SleeperShared>,
}

struct WakerState {
    // Assertion received before the waker was added to a sleeper.
    pending: bool,
    bound: Option<(Arc<SleeperShared>, usize)>,
}

/// The producer half: asserting a waker wakes the sleeper it is bound to.
/// Assertions are idempotent; concurrent asserts on distinct wakers are
/// delivered independently.
#[derive(Clone)]
pub struct Waker {
    state: Arc<Mutex<WakerState>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Waker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WakerState {
                pending: false,
                bound: None,
            })),
        }
    }

    /// Marks the waker asserted.
    pub fn assert(&self) {
        let mut state = self.state.lock().unwrap();
        match &state.bound {
            Some((shared, id)) => {
                let mut asserted = shared.asserted.lock().unwrap();
                if asserted.insert(*id) {
                    shared.cond.notify_one();
                }
            },
            None => state.pending = true,
        }
    }

    /// Un-asserts the waker.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = false;
        if let Some((shared, id)) = &state.bound {
            shared.asserted.lock().unwrap().remove(id);
        }
    }
}

impl Sleeper {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SleeperShared {
                asserted: Mutex::new(BTreeSet::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Binds a waker to this sleeper under the given identifier. An
    /// assertion that raced ahead of the registration, or that was
    /// delivered to a previous sleeper but never fetched, is carried over.
    pub fn add_waker(&self, w: &Waker, id: usize) {
        let mut state = w.state.lock().unwrap();

        if let Some((old_shared, old_id)) = state.bound.take() {
            if old_shared.asserted.lock().unwrap().remove(&old_id) {
                state.pending = true;
            }
        }

        state.bound = Some((self.shared.clone(), id));
        if state.pending {
            state.pending = false;
            self.shared.asserted.lock().unwrap().insert(id);
            self.shared.cond.notify_one();
        }
    }

    /// Fetches the identifier of an asserted waker, clearing its assertion.
    /// If none is asserted and `block` is true, suspends the calling thread
    /// until one is; otherwise returns `None`.
    pub fn fetch(&self, block: bool) -> Option<usize> {
        let mut asserted = self.shared.asserted.lock().unwrap();
        loop {
            if let Some(id) = asserted.iter().next().copied() {
                asserted.remove(&id);
                return Some(id);
            }
            if !block {
                return None;
            }
            asserted = self.shared.cond.wait(asserted).unwrap();
        }
    }

    /// Like `fetch(true)`, but gives up at `deadline` and returns `None`.
    /// The worker threads drive their retransmission and close-grace timers
    /// through this: a `None` return means the earliest deadline is due.
    pub fn fetch_before(&self, deadline: Instant) -> Option<usize> {
        let mut asserted = self.shared.asserted.lock().unwrap();
        loop {
            if let Some(id) = asserted.iter().next().copied() {
                asserted.remove(&id);
                return Some(id);
            }
            let now: Instant = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.shared.cond.wait_timeout(asserted, deadline - now).unwrap();
            asserted = guard;
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{
        Sleeper,
        Waker,
    };
    use ::anyhow::Result;
    use ::std::{
        thread,
        time::{
            Duration,
            Instant,
        },
    };

    #[test]
    fn fetch_returns_asserted_waker() -> Result<()> {
        let s: Sleeper = Sleeper::new();
        let w: Waker = Waker::new();
        s.add_waker(&w, 7);

        crate::ensure_eq!(s.fetch(false), None);
        w.assert();
        crate::ensure_eq!(s.fetch(false), Some(7));
        // The fetch cleared the assertion.
        crate::ensure_eq!(s.fetch(false), None);
        Ok(())
    }

    #[test]
    fn assert_is_idempotent() -> Result<()> {
        let s: Sleeper = Sleeper::new();
        let w: Waker = Waker::new();
        s.add_waker(&w, 1);

        w.assert();
        w.assert();
        crate::ensure_eq!(s.fetch(false), Some(1));
        crate::ensure_eq!(s.fetch(false), None);
        Ok(())
    }

    #[test]
    fn assert_before_add_is_delivered() -> Result<()> {
        let s: Sleeper = Sleeper::new();
        let w: Waker = Waker::new();
        w.assert();
        s.add_waker(&w, 3);
        crate::ensure_eq!(s.fetch(false), Some(3));
        Ok(())
    }

    #[test]
    fn clear_removes_assertion() -> Result<()> {
        let s: Sleeper = Sleeper::new();
        let w: Waker = Waker::new();
        s.add_waker(&w, 2);
        w.assert();
        w.clear();
        crate::ensure_eq!(s.fetch(false), None);
        Ok(())
    }

    #[test]
    fn blocking_fetch_wakes_on_cross_thread_assert() -> Result<()> {
        let s: Sleeper = Sleeper::new();
        let w: Waker = Waker::new();
        s.add_waker(&w, 9);

        let w2: Waker = w.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            w2.assert();
        });

        crate::ensure_eq!(s.fetch(true), Some(9));
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn fetch_before_expires() -> Result<()> {
        let s: Sleeper = Sleeper::new();
        let w: Waker = Waker::new();
        s.add_waker(&w, 4);

        let deadline: Instant = Instant::now() + Duration::from_millis(20);
        crate::ensure_eq!(s.fetch_before(deadline), None);
        crate::ensure_eq!(Instant::now() >= deadline, true);
        Ok(())
    }
}
