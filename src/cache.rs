//! Hash/LRU table and busy-object waiting list — the external "hash
//! layer" collaborator of spec §6, plus the objcore flags (`OC_F_BUSY`,
//! `OC_F_PASS`) and waiting-list contract described in §4.2 `lookup` and
//! §5's ordering guarantees. Grounded in the teacher's connection table
//! (`Server.connections: HashMap<Token, HttpConnection>`) generalized
//! from a single map of live connections to a map of cached objects plus
//! a per-object list of parked connections.

use crate::storage::ObjectHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Digest = [u8; 32];

pub const OC_F_BUSY: u8 = 0b01;
pub const OC_F_PASS: u8 = 0b10;

/// Identifies a parked connection so a waiting-list wakeup can be handed
/// back to the worker-reactor thread that owns it, instead of migrating
/// a live `mio::net::TcpStream` across reactors (SPEC_FULL.md §F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParkedSession {
    pub worker: usize,
    pub token: usize,
}

/// The object-core analogue: one per digest, shared by every session
/// that hashes to it. Holds the object once fetched, the busy/pass
/// flags while a fetch is in flight, and the waiting list of sessions
/// parked on `lookup` returning null.
#[derive(Debug, Default)]
pub struct ObjHead {
    pub flags: u8,
    pub object: Option<ObjectHandle>,
    waiting: Vec<ParkedSession>,
}

impl ObjHead {
    pub fn is_busy(&self) -> bool {
        self.flags & OC_F_BUSY != 0
    }

    pub fn is_hit_for_pass(&self) -> bool {
        self.flags & OC_F_PASS != 0
    }

    fn set_busy(&mut self) {
        self.flags |= OC_F_BUSY;
    }

    fn clear_busy(&mut self) {
        self.flags &= !OC_F_BUSY;
    }

    pub fn park(&mut self, who: ParkedSession) {
        self.waiting.push(who);
    }

    /// Drains the waiting list so the caller can re-dispatch each parked
    /// session into state `lookup`, per the waiting-list contract.
    fn drain_waiters(&mut self) -> Vec<ParkedSession> {
        std::mem::take(&mut self.waiting)
    }
}

/// Outcome of a hash-table lookup, matching §4.2 `lookup`'s three-way
/// branch: a ready object, a busy object this session must park behind,
/// or nothing (a fresh slot this session now owns as the fetching peer).
pub enum LookupResult {
    Hit(Arc<Mutex<ObjHead>>),
    Busy,
    Miss(Arc<Mutex<ObjHead>>),
}

#[derive(Default)]
pub struct Cache {
    table: Mutex<HashMap<Digest, Arc<Mutex<ObjHead>>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `digest`. If no entry exists, creates a busy placeholder
    /// and returns `Miss` — the caller becomes the fetching session and
    /// must call `unbusy` (success) or `drop` (failure) when done. If an
    /// entry exists and is busy, the caller must park on it via
    /// `ObjHead::park` and wait for `unbusy`/`drop` to requeue it. If the
    /// entry is ready, returns `Hit`.
    pub fn lookup(&self, digest: Digest, hash_ignore_busy: bool) -> LookupResult {
        let mut table = self.table.lock().unwrap();
        if let Some(head) = table.get(&digest) {
            let guard = head.lock().unwrap();
            if guard.is_busy() && !hash_ignore_busy {
                drop(guard);
                return LookupResult::Busy;
            }
            drop(guard);
            return LookupResult::Hit(Arc::clone(head));
        }
        let mut head = ObjHead::default();
        head.set_busy();
        let entry = Arc::new(Mutex::new(head));
        table.insert(digest, Arc::clone(&entry));
        LookupResult::Miss(entry)
    }

    /// Reserves a scratch objhead that is never inserted into the shared
    /// table (spec §6 `prealloc`). `pass` and `error` use this: neither a
    /// passed response nor a synthesized error response is a cache entry,
    /// so no other session's `lookup` may ever observe it, whether as a
    /// `Hit`, a `Busy` it parks behind, or anything else. Because it never
    /// enters the table, it also needs no `unbusy`/`drop_entry` call to
    /// release it — there is no waiting list to drain and no slot to leak.
    pub fn prealloc(&self, _digest: Digest) -> Arc<Mutex<ObjHead>> {
        Arc::new(Mutex::new(ObjHead::default()))
    }

    /// Marks a fetched object ready and returns the sessions parked
    /// behind it, so the caller can re-dispatch each into state
    /// `lookup`. `object` is only assigned when given — a streaming
    /// fetch already attached its handle directly in `fetchbody` while
    /// the entry was still busy, so `streambody` calls this with `None`
    /// just to clear the busy flag and drain waiters without disturbing
    /// the handle already in place.
    pub fn unbusy(&self, head: &Arc<Mutex<ObjHead>>, object: Option<ObjectHandle>, hit_for_pass: bool) -> Vec<ParkedSession> {
        let mut guard = head.lock().unwrap();
        if object.is_some() {
            guard.object = object;
        }
        guard.clear_busy();
        if hit_for_pass {
            guard.flags |= OC_F_PASS;
        }
        guard.drain_waiters()
    }

    /// Backend fetch failed: remove the slot entirely and hand back the
    /// parked sessions so they can be restarted through `miss` again.
    pub fn drop_entry(&self, digest: &Digest, head: &Arc<Mutex<ObjHead>>) -> Vec<ParkedSession> {
        self.table.lock().unwrap().remove(digest);
        head.lock().unwrap().drain_waiters()
    }

    /// Removes an expired entry outright, handing back its storage handle
    /// (for `Storage::release`) and anyone still parked on it. Used by the
    /// expiry sweep, which finds entries `lookup` never sees timing out on
    /// its own — nothing else drives a ready object out of the table once
    /// its TTL passes.
    pub fn evict(&self, digest: &Digest) -> (Option<ObjectHandle>, Vec<ParkedSession>) {
        let head = match self.table.lock().unwrap().remove(digest) {
            Some(head) => head,
            None => return (None, Vec::new()),
        };
        let mut guard = head.lock().unwrap();
        let object = guard.object.take();
        let woken = guard.drain_waiters();
        (object, woken)
    }

    pub fn deref(&self, digest: &Digest) -> Option<Arc<Mutex<ObjHead>>> {
        self.table.lock().unwrap().get(digest).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
