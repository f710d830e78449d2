//! A single cache table (one of PHYS, TLB, PAGING).
//!
//! Each table shards its working set across [`crate::config::CACHE_SHARD_COUNT`]
//! independent shards, each with its own bucket array and MRU/LRU age list.

use super::page::{Page, PageHandle};
use crate::address::{page_hash, PhysAddr};
use crate::config::{CACHE_BUCKET_COUNT, CACHE_SHARD_COUNT};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Below this count a shard's LRU half is never reclaimed:
/// `reclaim(shard, total=false)` is a no-op once the shard is this small or
/// smaller.
const RECLAIM_FLOOR: usize = 16;

struct ShardState {
    buckets: Vec<Vec<PageHandle>>,
    age: VecDeque<PageHandle>,
}

impl ShardState {
    fn new() -> Self {
        ShardState {
            buckets: (0..CACHE_BUCKET_COUNT).map(|_| Vec::new()).collect(),
            age: VecDeque::new(),
        }
    }

    fn count(&self) -> usize {
        self.age.len()
    }

    fn bucket_index(&self, addr: PhysAddr) -> usize {
        page_hash(addr, CACHE_BUCKET_COUNT)
    }

    fn insert(&mut self, page: PageHandle) {
        let idx = self.bucket_index(page.addr());
        self.buckets[idx].push(page.clone());
        self.age.push_front(page);
    }

    fn find(&self, addr: PhysAddr) -> Option<PageHandle> {
        let idx = self.bucket_index(addr);
        self.buckets[idx].iter().find(|p| p.addr() == addr).cloned()
    }

    /// Detaches every entry matching `addr` from both the bucket and the
    /// age list, returning them for release to the empty pool.
    fn detach_matching(&mut self, addr: PhysAddr) -> Vec<PageHandle> {
        let idx = self.bucket_index(addr);
        let mut removed = Vec::new();
        self.buckets[idx].retain(|p| {
            if p.addr() == addr {
                removed.push(p.clone());
                false
            } else {
                true
            }
        });
        self.age.retain(|p| p.addr() != addr);
        removed
    }

    /// Pops `count` entries from the LRU tail, detaching them from their
    /// bucket as well. Returns the detached pages.
    fn evict_lru(&mut self, count: usize) -> Vec<PageHandle> {
        let mut evicted = Vec::with_capacity(count);

        for _ in 0..count {
            let Some(page) = self.age.pop_back() else {
                break;
            };

            let idx = self.bucket_index(page.addr());
            if let Some(pos) = self.buckets[idx].iter().position(|p| arc_ptr_eq(p, &page)) {
                self.buckets[idx].swap_remove(pos);
            }

            evicted.push(page);
        }

        evicted
    }

    fn drain_all(&mut self) -> Vec<PageHandle> {
        let mut all: Vec<PageHandle> = self.age.drain(..).collect();
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        all.shrink_to_fit();
        all
    }
}

#[inline]
fn arc_ptr_eq(a: &PageHandle, b: &PageHandle) -> bool {
    std::sync::Arc::ptr_eq(a, b)
}

struct Shard {
    state: Mutex<ShardState>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            state: Mutex::new(ShardState::new()),
        }
    }
}

pub struct CacheTable {
    shards: Vec<Shard>,
    empty: SegQueue<PageHandle>,
    total: Mutex<Vec<PageHandle>>,
    c_total: AtomicUsize,
    max_entries: usize,
    reclaim_rr: AtomicUsize,
    active: AtomicBool,
}

impl CacheTable {
    pub fn new(max_entries: usize) -> Self {
        CacheTable {
            shards: (0..CACHE_SHARD_COUNT).map(|_| Shard::new()).collect(),
            empty: SegQueue::new(),
            total: Mutex::new(Vec::new()),
            c_total: AtomicUsize::new(0),
            max_entries,
            reclaim_rr: AtomicUsize::new(0),
            active: AtomicBool::new(true),
        }
    }

    fn shard_index(&self, addr: PhysAddr) -> usize {
        page_hash(addr, self.shards.len())
    }

    /// `get(tag, addr)`: returns a cloned strong reference to the cached
    /// page at `addr`, if present. Takes only the shard lock.
    pub fn get(&self, addr: PhysAddr) -> Option<PageHandle> {
        let shard = &self.shards[self.shard_index(addr)];
        shard.state.lock().find(addr)
    }

    /// `reserve()`: obtains an unpublished page for the caller to fill.
    /// Never returns `None` unless the table has been closed.
    pub fn reserve(&self) -> Option<PageHandle> {
        let mut rounds_without_progress = 0usize;

        loop {
            if let Some(page) = self.empty.pop() {
                page.reset();
                return Some(page);
            }

            if !self.active.load(Ordering::Acquire) {
                return None;
            }

            if let Some(page) = self.try_grow() {
                return Some(page);
            }

            if self.reclaim_one_shard(false) > 0 {
                continue;
            }

            rounds_without_progress += 1;

            if rounds_without_progress >= self.shards.len() {
                log::warn!(
                    "cache: reserve() made no progress after {} rounds, sleeping",
                    rounds_without_progress
                );
                std::thread::sleep(Duration::from_millis(1));
                rounds_without_progress = 0;
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Grows the table by one fresh page, if under `max_entries`. The new
    /// page is pushed onto `total` (the one permanent strong reference) and
    /// handed back directly to the caller, already reserved -- it is never
    /// routed through the empty pool, since nothing else could observe it
    /// between those two pushes anyway.
    fn try_grow(&self) -> Option<PageHandle> {
        loop {
            let current = self.c_total.load(Ordering::Acquire);
            if current >= self.max_entries {
                return None;
            }

            if self
                .c_total
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let page = Page::new();
                self.total.lock().push(page.clone());
                return Some(page);
            }
        }
    }

    /// `publish(page)`: inserts a filled page into its shard if it looks
    /// valid and the table is active; otherwise releases it back to the
    /// empty pool.
    pub fn publish(&self, page: PageHandle) {
        let addr = page.addr();
        let publishable = page.is_valid() && addr.is_valid() && self.active.load(Ordering::Acquire);

        if publishable {
            let shard = &self.shards[self.shard_index(addr)];
            shard.state.lock().insert(page);
        } else {
            self.release(page);
        }
    }

    fn release(&self, page: PageHandle) {
        page.reset();
        self.empty.push(page);
    }

    /// Walks the bucket chain of `addr`'s shard and detaches every entry
    /// matching it, releasing each to the empty pool.
    pub fn invalidate(&self, addr: PhysAddr) {
        let shard = &self.shards[self.shard_index(addr)];
        let removed = shard.state.lock().detach_matching(addr);

        for page in removed {
            self.release(page);
        }
    }

    /// Reclaims a single round-robin-chosen shard. Returns how many pages
    /// were evicted.
    fn reclaim_one_shard(&self, total: bool) -> usize {
        let idx = self.reclaim_rr.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.reclaim(idx, total)
    }

    /// `reclaim(shard, total)`: evicts from the LRU tail until the shard is
    /// empty (`total`) or halved-but-not-below-16.
    pub fn reclaim(&self, shard_idx: usize, total: bool) -> usize {
        let shard = &self.shards[shard_idx];
        let mut state = shard.state.lock();

        let evicted = if total {
            state.drain_all()
        } else {
            let count = state.count();
            if count <= RECLAIM_FLOOR {
                Vec::new()
            } else {
                let target = (count / 2).max(RECLAIM_FLOOR);
                state.evict_lru(count - target)
            }
        };

        drop(state);

        let n = evicted.len();
        for page in evicted {
            self.release(page);
        }

        n
    }

    /// Reclaims every shard down to empty.
    pub fn clear(&self) {
        for idx in 0..self.shards.len() {
            self.reclaim(idx, true);
        }
    }

    /// Marks the table inactive, reclaims everything and drains the empty
    /// and total pools. The table cannot be used again afterwards.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.clear();

        while self.empty.pop().is_some() {}
        self.total.lock().clear();
        self.c_total.store(0, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> usize {
        self.c_total.load(Ordering::Acquire)
    }

    pub fn empty_count(&self) -> usize {
        // SegQueue has no O(1) len(); this is only used by tests/metrics.
        self.empty.len()
    }

    pub fn shard_count(&self, shard_idx: usize) -> usize {
        self.shards[shard_idx].state.lock().count()
    }

    pub fn shard_len(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PAGE_SIZE;

    fn addr(n: u64) -> PhysAddr {
        PhysAddr::new(n * PAGE_SIZE)
    }

    #[test]
    fn reserve_publish_get_roundtrip() {
        let table = CacheTable::new(64);
        let page = table.reserve().unwrap();
        page.write_from(addr(5), true, &[0xAB; PAGE_SIZE as usize]);
        table.publish(page);

        let found = table.get(addr(5)).expect("page should be cached");
        let mut out = [0u8; PAGE_SIZE as usize];
        found.read_into(&mut out);
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn invalidate_removes_entry() {
        let table = CacheTable::new(64);
        let page = table.reserve().unwrap();
        page.write_from(addr(7), true, &[1; PAGE_SIZE as usize]);
        table.publish(page);

        assert!(table.get(addr(7)).is_some());
        table.invalidate(addr(7));
        assert!(table.get(addr(7)).is_none());

        // Invalidating again is a no-op, not an error.
        table.invalidate(addr(7));
        assert!(table.get(addr(7)).is_none());
    }

    #[test]
    fn publish_rejects_invalid_page() {
        let table = CacheTable::new(64);
        let page = table.reserve().unwrap();
        // Never filled: valid stays false.
        table.publish(page);
        assert_eq!(table.empty_count(), 1);
    }

    #[test]
    fn total_is_capped() {
        let table = CacheTable::new(4);
        let mut held = Vec::new();

        for i in 0..4 {
            let page = table.reserve().unwrap();
            page.write_from(addr(i), true, &[0; PAGE_SIZE as usize]);
            held.push(page);
        }

        assert_eq!(table.total_count(), 4);

        for page in held {
            table.publish(page);
        }

        // Table is full, but reserve() can still make progress by
        // reclaiming LRU entries rather than growing further.
        let reserved = table.reserve().unwrap();
        assert_eq!(table.total_count(), 4);
        table.release(reserved);
    }

    #[test]
    fn reclaim_respects_floor() {
        let table = CacheTable::new(64);

        for i in 0..10 {
            let page = table.reserve().unwrap();
            page.write_from(addr(i), true, &[0; PAGE_SIZE as usize]);
            table.publish(page);
        }

        // At or below the floor, a non-total reclaim must be a no-op.
        let evicted = table.reclaim(0, false);
        assert!(evicted == 0 || table.shard_count(0) <= RECLAIM_FLOOR);
    }

    #[test]
    fn shard_invariant_holds_after_many_inserts() {
        let table = CacheTable::new(1024);

        for i in 0..200u64 {
            let page = table.reserve().unwrap();
            page.write_from(addr(i), true, &[0; PAGE_SIZE as usize]);
            table.publish(page);
        }

        let mut total_shard_counts = 0;
        for idx in 0..table.shard_len() {
            total_shard_counts += table.shard_count(idx);
        }

        assert_eq!(total_shard_counts + table.empty_count(), table.total_count());
    }

    #[test]
    fn close_drains_everything() {
        let table = CacheTable::new(16);
        let page = table.reserve().unwrap();
        page.write_from(addr(1), true, &[0; PAGE_SIZE as usize]);
        table.publish(page);

        table.close();
        assert!(!table.is_active());
        assert_eq!(table.total_count(), 0);
        assert!(table.get(addr(1)).is_none());
        assert!(table.reserve().is_none());
    }
}
