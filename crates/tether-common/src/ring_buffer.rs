//! Fixed-capacity FIFO of 64-bit words.
//!
//! The buffer never allocates: it binds to storage supplied at construction
//! (a borrowed slice, an array, or a boxed slice allocated once up front).
//! One storage slot is always left unused so that `head == tail` means empty
//! and never full, giving a usable capacity of `storage.len() - 1`.
//!
//! The buffer is not internally synchronized. Callers sharing an instance
//! across threads must serialize access themselves.

/// Ring buffer of `u64` values over caller-supplied storage.
#[derive(Debug, Clone)]
pub struct RingBufferU64<S> {
    buf: S,
    head: usize,
    tail: usize,
}

impl<S> RingBufferU64<S>
where
    S: AsRef<[u64]> + AsMut<[u64]>,
{
    /// Bind a new, empty buffer to `storage`.
    ///
    /// Storage of length 0 or 1 yields a buffer with capacity 0.
    pub fn new(storage: S) -> Self {
        Self {
            buf: storage,
            head: 0,
            tail: 0,
        }
    }

    /// Rebind to new storage and reset to empty, returning the old storage.
    pub fn init(&mut self, storage: S) -> S {
        self.head = 0;
        self.tail = 0;
        std::mem::replace(&mut self.buf, storage)
    }

    /// Release the backing storage.
    pub fn into_inner(self) -> S {
        self.buf
    }

    #[inline]
    fn buf_size(&self) -> usize {
        self.buf.as_ref().len()
    }

    #[inline]
    fn offset_incr(&self, offset: usize) -> usize {
        let next = offset + 1;
        if next >= self.buf_size() {
            0
        } else {
            next
        }
    }

    /// Discard all queued values.
    pub fn clear(&mut self) {
        if self.tail >= self.buf_size() || self.head >= self.buf_size() {
            self.head = 0;
            self.tail = 0;
        } else {
            self.tail = self.head;
        }
    }

    /// Number of queued values.
    #[must_use]
    pub fn size(&self) -> usize {
        let buf_size = self.buf_size();
        if buf_size == 0 {
            return 0;
        }
        let sz = self.head + buf_size - self.tail;
        if sz >= buf_size {
            sz - buf_size
        } else {
            sz
        }
    }

    /// Check if no values are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Maximum number of values the buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf_size().saturating_sub(1)
    }

    /// Number of values that can be added before the buffer is full.
    #[must_use]
    pub fn empty_size(&self) -> usize {
        self.capacity() - self.size()
    }

    /// Append a value. Returns `false` without modification when full.
    #[must_use = "push fails when the buffer is full"]
    pub fn push(&mut self, value: u64) -> bool {
        if self.buf_size() < 2 {
            return false;
        }
        let head = self.head;
        let next_head = self.offset_incr(head);
        if next_head == self.tail {
            return false;
        }
        self.buf.as_mut()[head] = value;
        self.head = next_head;
        true
    }

    /// Remove and return the oldest value.
    pub fn pop(&mut self) -> Option<u64> {
        let tail = self.tail;
        if self.head == tail {
            return None;
        }
        let value = self.buf.as_ref()[tail];
        self.tail = self.offset_incr(tail);
        Some(value)
    }

    /// Return the oldest value without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf.as_ref()[self.tail])
        }
    }

    /// Append all of `items`, or nothing if they do not fit.
    #[must_use = "add fails when the items do not fit"]
    pub fn add(&mut self, items: &[u64]) -> bool {
        let count = items.len();
        if count > self.empty_size() {
            return false;
        }
        if count == 0 {
            return true;
        }
        let buf_size = self.buf_size();
        let head = self.head;
        let first = count.min(buf_size - head);
        let buf = self.buf.as_mut();
        buf[head..head + first].copy_from_slice(&items[..first]);
        let rest = count - first;
        if rest > 0 {
            buf[..rest].copy_from_slice(&items[first..]);
            self.head = rest;
        } else if head + first == buf_size {
            self.head = 0;
        } else {
            self.head = head + first;
        }
        true
    }

    /// Drop the `count` oldest values.
    ///
    /// Requesting more than [`size`](Self::size) values empties the buffer
    /// and returns `false`.
    pub fn discard(&mut self, count: usize) -> bool {
        if count > self.size() {
            self.tail = self.head;
            return false;
        }
        let mut tail = self.tail + count;
        if tail >= self.buf_size() {
            tail -= self.buf_size();
        }
        self.tail = tail;
        true
    }

    /// Iterate over queued values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let buf = self.buf.as_ref();
        let tail = self.tail;
        (0..self.size()).map(move |i| buf[(tail + i) % buf.len()])
    }
}
