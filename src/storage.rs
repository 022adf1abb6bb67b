//! In-memory, byte-budgeted storage allocator. Stands in for the backing
//! store named as an external collaborator in spec §6 — `new_object`
//! honors the "fall back to TRANSIENT_STORAGE, then give up" contract
//! `fetchbody` relies on.

use std::sync::atomic::{AtomicUsize, Ordering};

pub const TRANSIENT_STORAGE: &str = "transient";
pub const MAIN_STORAGE: &str = "main";

#[derive(Debug)]
pub struct Object {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub gzipped: bool,
    pub esi_blob: Option<Vec<u8>>,
    pub status: u16,
    pub last_modified: u64,
}

pub struct Storage {
    budget: usize,
    used: AtomicUsize,
}

impl Storage {
    pub fn new(byte_budget: usize) -> Self {
        Self {
            budget: byte_budget,
            used: AtomicUsize::new(0),
        }
    }

    /// Attempt to allocate `byte_budget` bytes from `hint`'s pool
    /// (`MAIN_STORAGE` or `TRANSIENT_STORAGE` both draw from the same
    /// arena here; a real deployment would size these independently).
    pub fn new_object(
        &self,
        hint: &str,
        byte_budget: usize,
        headers: Vec<(String, String)>,
    ) -> Option<ObjectHandle> {
        let _ = hint;
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + byte_budget > self.budget {
                return None;
            }
            match self.used.compare_exchange_weak(
                used,
                used + byte_budget,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => used = cur,
            }
        }
        Some(ObjectHandle {
            reserved: byte_budget,
            object: Object {
                headers,
                body: Vec::new(),
                gzipped: false,
                esi_blob: None,
                status: 200,
                last_modified: 0,
            },
        })
    }

    pub fn release(&self, handle: &ObjectHandle) {
        self.used.fetch_sub(handle.reserved, Ordering::SeqCst);
    }
}

/// Owns a storage reservation plus the object it backs. Dropping it
/// without an explicit release would leak budget in a real arena; the
/// cache layer calls `Storage::release` on eviction/drop paths.
pub struct ObjectHandle {
    reserved: usize,
    pub object: Object,
}

impl ObjectHandle {
    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_budget() {
        let storage = Storage::new(100);
        let a = storage.new_object(MAIN_STORAGE, 60, vec![]);
        assert!(a.is_some());
        let b = storage.new_object(MAIN_STORAGE, 60, vec![]);
        assert!(b.is_none(), "second allocation should exceed budget");
    }

    #[test]
    fn release_frees_budget_for_reuse() {
        let storage = Storage::new(100);
        let a = storage.new_object(MAIN_STORAGE, 60, vec![]).unwrap();
        storage.release(&a);
        let b = storage.new_object(MAIN_STORAGE, 60, vec![]);
        assert!(b.is_some());
    }
}
