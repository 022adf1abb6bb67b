//! Bump allocator over a fixed byte arena with stack-like watermarks.
//!
//! Mirrors the session/request/transient watermark stack from the system
//! this engine is modeled on: a session snapshot taken at `first`, a
//! request snapshot taken at `start`, and short-lived reservations inside
//! individual handlers (e.g. the vary blob in `lookup`) that must be
//! published or discarded before the handler returns.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

#[derive(Debug)]
pub struct Workspace {
    buf: Vec<u8>,
    used: usize,
}

impl Workspace {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            used: 0,
        }
    }

    pub fn snapshot(&self) -> Mark {
        Mark(self.used)
    }

    /// Rewind to a previously taken mark, discarding everything allocated
    /// since. Used both for `done`'s session-watermark reset and for
    /// discarding a reservation that turned out unneeded.
    pub fn reset(&mut self, mark: Mark) {
        debug_assert!(mark.0 <= self.used, "workspace mark out of order");
        self.used = mark.0;
    }

    pub fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        if self.used + len > self.buf.len() {
            return None;
        }
        let start = self.used;
        self.used += len;
        Some(&mut self.buf[start..self.used])
    }

    /// Publish a reservation: keep exactly `len` bytes of a prior `reserve`
    /// (the rest, if any, is released back).
    pub fn release_p(&mut self, mark: Mark, len: usize) {
        self.used = mark.0 + len;
    }

    /// Discard a reservation entirely.
    pub fn release(&mut self, mark: Mark) {
        self.used = mark.0;
    }

    pub fn alloc(&mut self, len: usize) -> Option<Mark> {
        let mark = self.snapshot();
        self.reserve(len)?;
        Some(mark)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[cfg(debug_assertions)]
    pub fn assert_valid(&self) {
        assert!(self.used <= self.buf.len(), "workspace overrun");
    }
}
