// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A wait queue where waiters enqueue themselves to be notified when an
//! event of interest happens on an endpoint.

//==============================================================================
// Imports
//==============================================================================

use ::crossbeam_channel;
use ::std::sync::{
    atomic::{
        AtomicU64,
        Ordering,
    },
    Arc,
    RwLock,
};

//==============================================================================
// Constants
//==============================================================================

/// Events that waiters can wait on. The meaning is the same as in poll().
pub type EventMask = u16;

pub const EVENT_IN: EventMask = 0x01;
pub const EVENT_PRI: EventMask = 0x02;
pub const EVENT_OUT: EventMask = 0x04;
pub const EVENT_ERR: EventMask = 0x08;
pub const EVENT_HUP: EventMask = 0x10;
pub const EVENT_NVAL: EventMask = 0x20;

//==============================================================================
// Static Variables
//==============================================================================

/// Source of unique entry identifiers, shared by all queues.
static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

//==============================================================================
// Structures
//==============================================================================

/// The callback invoked when a waiter entry is notified. It is responsible
/// for doing whatever is needed to wake up the waiter.
///
/// The callback is supposed to perform minimal work, and cannot call any
/// method on the queue itself because the queue is locked while the
/// callback is running.
pub trait EntryCallback: Send + Sync {
    fn callback(&self);
}

/// A waiter that can be registered with a queue.
pub struct Entry {
    id: u64,
    callback: Arc<dyn EntryCallback>,
}

struct EntryState {
    id: u64,
    mask: EventMask,
    callback: Arc<dyn EntryCallback>,
}

struct QueueInner {
    list: RwLock<Vec<EntryState>>,
}

/// The wait queue. Cheap to clone; clones share the same set of entries.
#[derive(Clone)]
pub struct WaiterQueue {
    inner: Arc<QueueInner>,
}

struct ChannelCallback {
    tx: crossbeam_channel::Sender<()>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Entry {
    pub fn new(callback: Arc<dyn EntryCallback>) -> Self {
        Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            callback,
        }
    }
}

/// Creates an entry whose callback does a non-blocking push of a zero-sized
/// token onto a capacity-1 channel, and returns the receiving half.
pub fn new_channel_entry() -> (Entry, crossbeam_channel::Receiver<()>) {
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    (Entry::new(Arc::new(ChannelCallback { tx })), rx)
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                list: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Adds a waiter to the queue; the waiter will be notified when at
    /// least one of the events in `mask` happens.
    pub fn event_register(&self, e: &Entry, mask: EventMask) {
        let mut list = self.inner.list.write().unwrap();
        list.push(EntryState {
            id: e.id,
            mask,
            callback: e.callback.clone(),
        });
    }

    /// Removes the given waiter entry from the queue.
    pub fn event_unregister(&self, e: &Entry) {
        let mut list = self.inner.list.write().unwrap();
        list.retain(|state| state.id != e.id);
    }

    /// Notifies all waiters whose masks have at least one bit in common
    /// with the notification mask.
    pub fn notify(&self, mask: EventMask) {
        let list = self.inner.list.read().unwrap();
        for state in list.iter() {
            if (mask & state.mask) != 0 {
                state.callback.callback();
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl EntryCallback for ChannelCallback {
    fn callback(&self) {
        let _ = self.tx.try_send(());
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
