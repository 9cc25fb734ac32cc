//! Adaptive replacement cache for database pages.
//!
//! Implements ARC (Megiddo & Modha, FAST '03) keyed by page number. Four
//! lists back the policy:
//!
//! - `T1` — pages referenced once, recently (recency side)
//! - `T2` — pages referenced at least twice (frequency side)
//! - `B1` / `B2` — ghost entries for pages evicted from T1 / T2; keys only
//!
//! A hit in B1 grows the adaptive target `p` (favour recency); a hit in B2
//! shrinks it (favour frequency). Payloads are shared `Arc<PageData>` and
//! immutable once published; a page write installs a fresh buffer. Eviction
//! performs no I/O — the pager's dirty set holds its own strong reference
//! to any payload that still must reach disk.
//!
//! Invariants: `|T1| + |T2| <= capacity` and `|B1| + |B2| <= capacity` at
//! every operation boundary.

use std::collections::HashMap;
use std::sync::Arc;

use strata_types::{PageData, PageNumber};
use xxhash_rust::xxh3::xxh3_64;

// ---------------------------------------------------------------------------
// Slot list: slab-backed doubly-linked list, O(1) unlink, no unsafe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotId(u32);

struct SlotNode<T> {
    value: T,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// LRU-ordered list: head is LRU, tail is MRU. Links are slab indices so
/// the whole structure stays free of raw pointers.
struct SlotList<T> {
    slots: Vec<Option<SlotNode<T>>>,
    free: Vec<u32>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl<T> SlotList<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn push_mru(&mut self, value: T) -> SlotId {
        let id = match self.free.pop() {
            Some(raw) => {
                self.slots[raw as usize] = Some(SlotNode {
                    value,
                    prev: None,
                    next: None,
                });
                SlotId(raw)
            }
            None => {
                let raw = u32::try_from(self.slots.len()).expect("slot index fits u32");
                self.slots.push(Some(SlotNode {
                    value,
                    prev: None,
                    next: None,
                }));
                SlotId(raw)
            }
        };

        match self.tail {
            Some(tail) => {
                self.node_mut(tail).next = Some(id);
                self.node_mut(id).prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        id
    }

    fn unlink(&mut self, id: SlotId) -> T {
        let node = self.slots[id.0 as usize]
            .take()
            .expect("unlink of vacant slot");
        match (node.prev, node.next) {
            (Some(p), Some(n)) => {
                self.node_mut(p).next = Some(n);
                self.node_mut(n).prev = Some(p);
            }
            (None, Some(n)) => {
                self.node_mut(n).prev = None;
                self.head = Some(n);
            }
            (Some(p), None) => {
                self.node_mut(p).next = None;
                self.tail = Some(p);
            }
            (None, None) => {
                self.head = None;
                self.tail = None;
            }
        }
        self.free.push(id.0);
        self.len -= 1;
        node.value
    }

    fn pop_lru(&mut self) -> Option<T> {
        let head = self.head?;
        Some(self.unlink(head))
    }

    /// Move an existing node to the MRU end.
    fn touch(&mut self, id: SlotId) {
        if self.tail == Some(id) {
            return;
        }
        let (prev, next) = {
            let node = self.slots[id.0 as usize].as_ref().expect("touch vacant slot");
            (node.prev, node.next)
        };
        match (prev, next) {
            (Some(p), Some(n)) => {
                self.node_mut(p).next = Some(n);
                self.node_mut(n).prev = Some(p);
            }
            (None, Some(n)) => {
                self.node_mut(n).prev = None;
                self.head = Some(n);
            }
            _ => return, // already tail (or sole element)
        }
        let old_tail = self.tail.expect("non-empty list has a tail");
        self.node_mut(old_tail).next = Some(id);
        let node = self.node_mut(id);
        node.prev = Some(old_tail);
        node.next = None;
        self.tail = Some(id);
    }

    fn get(&self, id: SlotId) -> &T {
        &self.slots[id.0 as usize]
            .as_ref()
            .expect("get of vacant slot")
            .value
    }

    fn get_mut(&mut self, id: SlotId) -> &mut T {
        &mut self.slots[id.0 as usize]
            .as_mut()
            .expect("get_mut of vacant slot")
            .value
    }

    fn node_mut(&mut self, id: SlotId) -> &mut SlotNode<T> {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("dangling slot id")
    }

    #[cfg(test)]
    fn lru(&self) -> Option<&T> {
        self.head.map(|id| self.get(id))
    }
}

// ---------------------------------------------------------------------------
// Cache entries and bookkeeping
// ---------------------------------------------------------------------------

/// A resident page.
struct Resident {
    page: PageNumber,
    data: Arc<PageData>,
    /// XXH3 of the payload at admission; re-checked on eviction in debug
    /// builds to catch anyone mutating a published buffer.
    stamp: u64,
}

impl Resident {
    fn new(page: PageNumber, data: Arc<PageData>) -> Self {
        let stamp = xxh3_64(data.as_bytes());
        Self { page, data, stamp }
    }

    fn verify_stamp(&self) {
        debug_assert_eq!(
            self.stamp,
            xxh3_64(self.data.as_bytes()),
            "cached payload for page {} mutated in place",
            self.page
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    T1(SlotId),
    T2(SlotId),
    B1(SlotId),
    B2(SlotId),
}

/// Outcome of [`ArcCache::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Resident in T1 or T2; promotion/refresh already applied.
    Hit,
    /// Ghost hit in B1 — fetch the page and [`ArcCache::admit`] it.
    GhostB1,
    /// Ghost hit in B2 — fetch the page and [`ArcCache::admit`] it.
    GhostB2,
    /// Not tracked at all — fetch and [`ArcCache::admit`].
    Miss,
}

/// Point-in-time counters and gauges, captured under the pager mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub ghost_hits_b1: u64,
    pub ghost_hits_b2: u64,
    pub evictions_t1: u64,
    pub evictions_t2: u64,
    pub admits: u64,
    pub t1_len: usize,
    pub t2_len: usize,
    pub b1_len: usize,
    pub b2_len: usize,
    pub p: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Resident page count.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.t1_len + self.t2_len
    }
}

// ---------------------------------------------------------------------------
// ArcCache
// ---------------------------------------------------------------------------

/// The ARC policy state. Not internally synchronized: the pager wraps it in
/// its own mutex and keeps I/O outside the critical section.
pub struct ArcCache {
    t1: SlotList<Resident>,
    t2: SlotList<Resident>,
    b1: SlotList<PageNumber>,
    b2: SlotList<PageNumber>,
    dir: HashMap<PageNumber, Place>,
    /// Adaptive target size for T1, in `[0, capacity]`.
    p: usize,
    capacity: usize,

    hits: u64,
    misses: u64,
    ghost_hits_b1: u64,
    ghost_hits_b2: u64,
    evictions_t1: u64,
    evictions_t2: u64,
    admits: u64,
}

impl ArcCache {
    /// Create a cache bounded at `capacity` resident pages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            t1: SlotList::new(),
            t2: SlotList::new(),
            b1: SlotList::new(),
            b2: SlotList::new(),
            dir: HashMap::with_capacity(capacity.saturating_mul(2)),
            p: 0,
            capacity,
            hits: 0,
            misses: 0,
            ghost_hits_b1: 0,
            ghost_hits_b2: 0,
            evictions_t1: 0,
            evictions_t2: 0,
            admits: 0,
        }
    }

    /// Resident page count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    /// True when no pages are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current stats snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            ghost_hits_b1: self.ghost_hits_b1,
            ghost_hits_b2: self.ghost_hits_b2,
            evictions_t1: self.evictions_t1,
            evictions_t2: self.evictions_t2,
            admits: self.admits,
            t1_len: self.t1.len(),
            t2_len: self.t2.len(),
            b1_len: self.b1.len(),
            b2_len: self.b2.len(),
            p: self.p,
            capacity: self.capacity,
        }
    }

    /// Payload of a resident page, without touching recency state.
    #[must_use]
    pub fn peek(&self, page: PageNumber) -> Option<Arc<PageData>> {
        match self.dir.get(&page)? {
            Place::T1(id) => Some(Arc::clone(&self.t1.get(*id).data)),
            Place::T2(id) => Some(Arc::clone(&self.t2.get(*id).data)),
            Place::B1(_) | Place::B2(_) => None,
        }
    }

    /// Look a page up, applying ARC promotion and ghost adaptation.
    ///
    /// On [`Lookup::Hit`] the payload is available via [`Self::peek`]. The
    /// other outcomes mean the caller fetches the bytes (outside the pager
    /// mutex) and hands them to [`Self::admit`].
    pub fn request(&mut self, page: PageNumber) -> Lookup {
        match self.dir.get(&page).copied() {
            Some(Place::T1(id)) => {
                // Second reference: promote recency -> frequency.
                let entry = self.t1.unlink(id);
                let new_id = self.t2.push_mru(entry);
                self.dir.insert(page, Place::T2(new_id));
                self.hits += 1;
                Lookup::Hit
            }
            Some(Place::T2(id)) => {
                self.t2.touch(id);
                self.hits += 1;
                Lookup::Hit
            }
            Some(Place::B1(id)) => {
                let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
                self.p = self.capacity.min(self.p.saturating_add(delta));
                self.b1.unlink(id);
                self.dir.remove(&page);
                self.ghost_hits_b1 += 1;
                Lookup::GhostB1
            }
            Some(Place::B2(id)) => {
                let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                self.b2.unlink(id);
                self.dir.remove(&page);
                self.ghost_hits_b2 += 1;
                Lookup::GhostB2
            }
            None => {
                self.misses += 1;
                Lookup::Miss
            }
        }
    }

    /// Admit a freshly fetched page after a miss or ghost hit.
    ///
    /// `origin` is the [`Lookup`] that prompted the fetch: ghost hits
    /// resurface in T2, plain misses start in T1, and only a B2 ghost hit
    /// biases the replacement tie-break toward T1. Admission is idempotent —
    /// if a racing caller already admitted the page, the existing entry is
    /// refreshed instead.
    pub fn admit(&mut self, page: PageNumber, data: Arc<PageData>, origin: Lookup) {
        if self.capacity == 0 {
            return;
        }
        match self.dir.get(&page).copied() {
            Some(Place::T1(id)) => {
                *self.t1.get_mut(id) = Resident::new(page, data);
                return;
            }
            Some(Place::T2(id)) => {
                *self.t2.get_mut(id) = Resident::new(page, data);
                self.t2.touch(id);
                return;
            }
            Some(Place::B1(id)) => {
                // Raced with another admit that re-ghosted the key; treat as
                // a ghost resurrection.
                self.b1.unlink(id);
                self.dir.remove(&page);
            }
            Some(Place::B2(id)) => {
                self.b2.unlink(id);
                self.dir.remove(&page);
            }
            None => {}
        }

        self.make_room(origin == Lookup::GhostB2);
        let entry = Resident::new(page, data);
        let place = match origin {
            Lookup::GhostB1 | Lookup::GhostB2 => Place::T2(self.t2.push_mru(entry)),
            Lookup::Hit | Lookup::Miss => Place::T1(self.t1.push_mru(entry)),
        };
        self.dir.insert(page, place);
        self.admits += 1;
        self.trim_ghosts();
    }

    /// Install a page written by a transaction: counts as a reference and
    /// replaces any published payload with the new buffer.
    pub fn install(&mut self, page: PageNumber, data: Arc<PageData>) {
        match self.request(page) {
            Lookup::Hit => match self.dir.get(&page).copied() {
                Some(Place::T1(id)) => *self.t1.get_mut(id) = Resident::new(page, data),
                Some(Place::T2(id)) => *self.t2.get_mut(id) = Resident::new(page, data),
                _ => unreachable!("hit entries are resident"),
            },
            outcome @ (Lookup::GhostB1 | Lookup::GhostB2 | Lookup::Miss) => {
                self.admit(page, data, outcome);
            }
        }
    }

    /// Drop a page from the cache entirely (resident or ghost).
    pub fn invalidate(&mut self, page: PageNumber) {
        match self.dir.remove(&page) {
            Some(Place::T1(id)) => {
                self.t1.unlink(id);
            }
            Some(Place::T2(id)) => {
                self.t2.unlink(id);
            }
            Some(Place::B1(id)) => {
                self.b1.unlink(id);
            }
            Some(Place::B2(id)) => {
                self.b2.unlink(id);
            }
            None => {}
        }
    }

    /// Drop everything. Used when the on-disk state is replaced wholesale
    /// (journal rollback replay, recovery).
    pub fn clear(&mut self) {
        self.t1 = SlotList::new();
        self.t2 = SlotList::new();
        self.b1 = SlotList::new();
        self.b2 = SlotList::new();
        self.dir.clear();
        self.p = 0;
    }

    /// Evict one resident page if the cache is full.
    ///
    /// The ARC REPLACE rule: prefer the T1 side while it exceeds its target
    /// `p` (or meets it exactly while servicing a B2 ghost hit), otherwise
    /// take the T2 side.
    fn make_room(&mut self, servicing_b2_hit: bool) {
        if self.len() < self.capacity {
            return;
        }
        let t1_len = self.t1.len();
        let from_t1 =
            t1_len > 0 && (t1_len > self.p || (t1_len == self.p && servicing_b2_hit));
        if from_t1 {
            if let Some(victim) = self.t1.pop_lru() {
                victim.verify_stamp();
                let ghost = self.b1.push_mru(victim.page);
                self.dir.insert(victim.page, Place::B1(ghost));
                self.evictions_t1 += 1;
            }
        } else if let Some(victim) = self.t2.pop_lru() {
            victim.verify_stamp();
            let ghost = self.b2.push_mru(victim.page);
            self.dir.insert(victim.page, Place::B2(ghost));
            self.evictions_t2 += 1;
        } else if let Some(victim) = self.t1.pop_lru() {
            // T2 empty; fall back to T1 regardless of target.
            victim.verify_stamp();
            let ghost = self.b1.push_mru(victim.page);
            self.dir.insert(victim.page, Place::B1(ghost));
            self.evictions_t1 += 1;
        }
    }

    /// Keep `|B1| + |B2| <= capacity`, trimming the longer list first.
    fn trim_ghosts(&mut self) {
        while self.b1.len() + self.b2.len() > self.capacity {
            let from_b1 = self.b1.len() >= self.b2.len();
            let dropped = if from_b1 {
                self.b1.pop_lru()
            } else {
                self.b2.pop_lru()
            };
            if let Some(page) = dropped {
                self.dir.remove(&page);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn in_t1(&self, page: PageNumber) -> bool {
        matches!(self.dir.get(&page), Some(Place::T1(_)))
    }

    #[cfg(test)]
    fn in_t2(&self, page: PageNumber) -> bool {
        matches!(self.dir.get(&page), Some(Place::T2(_)))
    }

    #[cfg(test)]
    fn in_b1(&self, page: PageNumber) -> bool {
        matches!(self.dir.get(&page), Some(Place::B1(_)))
    }
}
