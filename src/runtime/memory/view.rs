// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    fmt,
    ops::Deref,
    sync::Arc,
};

//==============================================================================
// Structures
//==============================================================================

/// A window over an immutable, reference-counted byte buffer.
///
/// Clones share the underlying storage; the window itself can only shrink.
/// `cap_length` narrows both length and capacity, so a narrowed view can
/// never be re-expanded to expose bytes outside the window.
#[derive(Clone)]
pub struct View {
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

/// An ordered sequence of views plus a cached total byte count. Carries
/// non-contiguous payloads through the stack without copying them.
#[derive(Clone, Default)]
pub struct VectorisedView {
    views: Vec<View>,
    size: usize,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl View {
    /// Creates a zero-filled view of the given size.
    pub fn new(size: usize) -> Self {
        Self::from(vec![0u8; size])
    }

    /// Creates a view over a sub-range of the same storage.
    pub(crate) fn slice(data: Arc<[u8]>, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= data.len());
        Self { data, offset, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Irreversibly reduces the visible section of the buffer to `length` bytes.
    pub fn cap_length(&mut self, length: usize) {
        assert!(length <= self.len, "cap_length beyond view length");
        self.len = length;
    }

    /// Removes the first `count` bytes from the visible section of the buffer.
    pub fn trim_front(&mut self, count: usize) {
        assert!(count <= self.len, "trim_front beyond view length");
        self.offset += count;
        self.len -= count;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }
}

impl VectorisedView {
    /// Creates a new vectorised view from already-allocated views.
    pub fn new(views: Vec<View>) -> Self {
        let size: usize = views.iter().map(|v| v.len()).sum();
        Self { views, size }
    }

    /// Creates a vectorised view over a single view.
    pub fn from_view(v: View) -> Self {
        let size: usize = v.len();
        Self { views: vec![v], size }
    }

    /// Returns the size in bytes of the entire content stored in the vectorised view.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    /// Returns the first view. Panics if the vectorised view is empty.
    pub fn first(&self) -> &View {
        self.views.first().expect("vectorised view is empty")
    }

    /// Removes the first `count` bytes of the vectorised view, shifting past
    /// view boundaries as needed.
    pub fn trim_front(&mut self, mut count: usize) {
        while count > 0 && !self.views.is_empty() {
            let first_len: usize = self.views[0].len();
            if count < first_len {
                self.size -= count;
                self.views[0].trim_front(count);
                return;
            }
            count -= first_len;
            self.remove_first();
        }
    }

    /// Caps the total length of the vectorised view to `length` bytes,
    /// dropping or narrowing trailing views.
    pub fn cap_length(&mut self, length: usize) {
        if length >= self.size {
            return;
        }
        let mut remaining: usize = length;
        let mut keep: usize = 0;
        for v in self.views.iter_mut() {
            if remaining == 0 {
                break;
            }
            if v.len() > remaining {
                v.cap_length(remaining);
            }
            remaining -= v.len();
            keep += 1;
        }
        self.views.truncate(keep);
        self.size = length;
    }

    /// Removes the first view of the vectorised view.
    pub fn remove_first(&mut self) {
        if self.views.is_empty() {
            return;
        }
        self.size -= self.views[0].len();
        self.views.remove(0);
    }

    /// Returns a single view containing a copy of the content of the
    /// vectorised view.
    pub fn to_view(&self) -> View {
        let mut buf: Vec<u8> = Vec::with_capacity(self.size);
        for v in &self.views {
            buf.extend_from_slice(v.as_slice());
        }
        View::from(buf)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl From<Vec<u8>> for View {
    fn from(buf: Vec<u8>) -> Self {
        let len: usize = buf.len();
        Self {
            data: Arc::from(buf.into_boxed_slice()),
            offset: 0,
            len,
        }
    }
}

impl Deref for View {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for View {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for View {}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View({:?})", self.as_slice())
    }
}

impl fmt::Debug for VectorisedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VectorisedView(size={}, views={})", self.size, self.views.len())
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{
        VectorisedView,
        View,
    };
    use ::anyhow::Result;

    #[test]
    fn view_trim_and_cap() -> Result<()> {
        let mut v: View = View::from(vec![1, 2, 3, 4, 5]);
        v.trim_front(2);
        crate::ensure_eq!(v.as_slice(), &[3, 4, 5]);
        v.cap_length(2);
        crate::ensure_eq!(v.as_slice(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn view_clone_shares_storage() -> Result<()> {
        let v: View = View::from(vec![9, 8, 7]);
        let mut w: View = v.clone();
        w.trim_front(1);
        crate::ensure_eq!(v.as_slice(), &[9, 8, 7]);
        crate::ensure_eq!(w.as_slice(), &[8, 7]);
        Ok(())
    }

    #[test]
    fn vectorised_trim_crosses_view_boundaries() -> Result<()> {
        let views: Vec<View> = vec![View::from(vec![1, 2]), View::from(vec![3, 4, 5])];
        let mut vv: VectorisedView = VectorisedView::new(views);
        crate::ensure_eq!(vv.size(), 5);

        vv.trim_front(3);
        crate::ensure_eq!(vv.size(), 2);
        crate::ensure_eq!(vv.first().as_slice(), &[4, 5]);

        vv.remove_first();
        crate::ensure_eq!(vv.size(), 0);
        Ok(())
    }

    #[test]
    fn vectorised_to_view_is_contiguous() -> Result<()> {
        let views: Vec<View> = vec![View::from(vec![1]), View::from(vec![2, 3])];
        let vv: VectorisedView = VectorisedView::new(views);
        crate::ensure_eq!(vv.to_view().as_slice(), &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn vectorised_cap_length() -> Result<()> {
        let views: Vec<View> = vec![View::from(vec![1, 2]), View::from(vec![3, 4, 5])];
        let mut vv: VectorisedView = VectorisedView::new(views);
        vv.cap_length(3);
        crate::ensure_eq!(vv.size(), 3);
        crate::ensure_eq!(vv.to_view().as_slice(), &[1, 2, 3]);
        Ok(())
    }
}
