// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::inetstack::protocols::tcp::segment::Segment;
use ::std::{
    collections::VecDeque,
    sync::Mutex,
};

//==============================================================================
// Structures
//==============================================================================

struct Inner {
    list: VecDeque<Segment>,
    used: usize,
    limit: usize,
}

/// A concurrent FIFO of segments with a byte-count limit, fed by the
/// receive path and drained by the endpoint's worker.
pub struct SegmentQueue {
    inner: Mutex<Inner>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl SegmentQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                list: VecDeque::new(),
                used: 0,
                limit,
            }),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        self.inner.lock().unwrap().limit = limit;
    }

    /// Adds a segment, unless the byte limit would be exceeded. Producers
    /// drop silently on a false return.
    pub fn enqueue(&self, s: Segment) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let size: usize = s.data.size();
        if inner.used + size > inner.limit {
            return false;
        }
        inner.used += size;
        inner.list.push_back(s);
        true
    }

    /// Removes and returns the oldest segment.
    pub fn dequeue(&self) -> Option<Segment> {
        let mut inner = self.inner.lock().unwrap();
        let s: Segment = inner.list.pop_front()?;
        inner.used -= s.data.size();
        Some(s)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().list.is_empty()
    }
}
