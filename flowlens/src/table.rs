// Capacity-bounded flow table with access-recency eviction.
//
// Slots and their link words are allocated once and handed out from a
// table-wide pool. A slot belongs to one shard at a time; that shard's
// spinning mutex guards its bucket chains and its access-ordered list.
// Counters live in atomics next to the slot tag and are read without
// taking any lock. Recency is access order only, `last_seen_ns` is data.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};

use flowlens_common::{FLOW_TABLE_CAPACITY, FlowInfo, FlowKey};
use spin::Mutex;

use crate::clock::Clock;

pub const MAX_SHARDS: usize = 64;
pub const MIN_SLOTS_PER_SHARD: usize = 1024;

const NIL: u32 = u32::MAX;
// Packed keys use 56 bits; the top bit marks a live slot.
const OCCUPIED: u64 = 1 << 63;

/// What `record` did with the observation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Update {
    Hit,
    Inserted,
    /// The table was full; the least recently accessed key of the key's
    /// shard (or of the next shard holding entries) made room.
    Evicted(FlowKey),
}

struct Slot {
    tag: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
    last_seen_ns: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            tag: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            last_seen_ns: AtomicU64::new(0),
        }
    }

    // Lock-free read. Counters and timestamp are loaded independently, so
    // a concurrent hit may show up in one and not the other.
    fn load(&self) -> Option<(FlowKey, FlowInfo)> {
        let tag = self.tag.load(Ordering::Acquire);
        if tag & OCCUPIED == 0 {
            return None;
        }
        let info = FlowInfo {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            last_seen_ns: self.last_seen_ns.load(Ordering::Relaxed),
        };
        fence(Ordering::Acquire);
        // A slot recycled mid-read carries a different tag.
        if self.tag.load(Ordering::Relaxed) != tag {
            return None;
        }
        Some((FlowKey::unpack(tag & !OCCUPIED), info))
    }

    fn publish(&self, tag: u64, bytes: u64, now_ns: u64) {
        self.tag.store(0, Ordering::Relaxed);
        fence(Ordering::Release);
        self.packets.store(1, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        self.last_seen_ns.store(now_ns, Ordering::Relaxed);
        self.tag.store(tag, Ordering::Release);
    }
}

// Intrusive links of one slot. Only the owning shard touches them, under
// its lock, so relaxed accesses suffice.
struct Link {
    chain: AtomicU32,
    prev: AtomicU32,
    next: AtomicU32,
}

impl Link {
    fn new() -> Self {
        Self {
            chain: AtomicU32::new(NIL),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
        }
    }
}

#[inline]
fn get(word: &AtomicU32) -> u32 {
    word.load(Ordering::Relaxed)
}

#[inline]
fn set(word: &AtomicU32, value: u32) {
    word.store(value, Ordering::Relaxed);
}

struct ShardIndex {
    buckets: Box<[u32]>,
    // Most recently accessed.
    head: u32,
    // Least recently accessed; the eviction victim.
    tail: u32,
    len: u32,
}

impl ShardIndex {
    fn new(buckets: usize) -> Self {
        Self {
            buckets: vec![NIL; buckets.max(1).next_power_of_two()].into_boxed_slice(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.buckets.fill(NIL);
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash >> 32) as usize & (self.buckets.len() - 1)
    }

    // Chains never exceed the slot count, which bounds every walk below.
    fn find(&self, slots: &[Slot], links: &[Link], bucket: usize, tag: u64) -> Option<u32> {
        let mut cursor = self.buckets[bucket];
        for _ in 0..links.len() {
            if cursor == NIL {
                return None;
            }
            if slots[cursor as usize].tag.load(Ordering::Relaxed) == tag {
                return Some(cursor);
            }
            cursor = get(&links[cursor as usize].chain);
        }
        None
    }

    fn insert(&mut self, links: &[Link], bucket: usize, idx: u32) {
        set(&links[idx as usize].chain, self.buckets[bucket]);
        self.buckets[bucket] = idx;
        self.push_front(links, idx);
        self.len += 1;
    }

    /// Detaches the least recently accessed slot and clears its tag.
    fn evict_tail(&mut self, slots: &[Slot], links: &[Link]) -> Option<(u32, FlowKey)> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        let slot = &slots[idx as usize];
        let victim = FlowKey::unpack(slot.tag.load(Ordering::Relaxed) & !OCCUPIED);
        let bucket = self.bucket_of(hash_key(&victim));
        self.unlink_bucket(links, bucket, idx);
        self.unlink(links, idx);
        self.len -= 1;
        slot.tag.store(0, Ordering::Release);
        Some((idx, victim))
    }

    fn unlink_bucket(&mut self, links: &[Link], bucket: usize, idx: u32) {
        let mut prev = NIL;
        let mut cursor = self.buckets[bucket];
        for _ in 0..links.len() {
            if cursor == NIL {
                return;
            }
            if cursor == idx {
                let next = get(&links[idx as usize].chain);
                if prev == NIL {
                    self.buckets[bucket] = next;
                } else {
                    set(&links[prev as usize].chain, next);
                }
                set(&links[idx as usize].chain, NIL);
                return;
            }
            prev = cursor;
            cursor = get(&links[cursor as usize].chain);
        }
    }

    fn push_front(&mut self, links: &[Link], idx: u32) {
        set(&links[idx as usize].prev, NIL);
        set(&links[idx as usize].next, self.head);
        if self.head != NIL {
            set(&links[self.head as usize].prev, idx);
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, links: &[Link], idx: u32) {
        let prev = get(&links[idx as usize].prev);
        let next = get(&links[idx as usize].next);
        if prev != NIL {
            set(&links[prev as usize].next, next);
        } else {
            self.head = next;
        }
        if next != NIL {
            set(&links[next as usize].prev, prev);
        } else {
            self.tail = prev;
        }
        set(&links[idx as usize].prev, NIL);
        set(&links[idx as usize].next, NIL);
    }

    fn touch(&mut self, links: &[Link], idx: u32) {
        if self.head != idx {
            self.unlink(links, idx);
            self.push_front(links, idx);
        }
    }
}

// Slots no shard owns. Untouched slots are handed out by a bump counter;
// slots freed by `drain` and `reset` go on a stack reserved at full
// capacity, so pushing never allocates.
struct SlotPool {
    next: AtomicUsize,
    capacity: usize,
    free: Mutex<Vec<u32>>,
    free_len: AtomicUsize,
}

impl SlotPool {
    fn new(capacity: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            free_len: AtomicUsize::new(0),
        }
    }

    /// `None` once every slot is owned by a shard.
    fn claim(&self) -> Option<u32> {
        let fresh = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if let Ok(idx) = fresh {
            return Some(idx as u32);
        }
        if self.free_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut free = self.free.lock();
        let idx = free.pop();
        self.free_len.store(free.len(), Ordering::Release);
        idx
    }

    fn release(&self, idx: u32) {
        let mut free = self.free.lock();
        free.push(idx);
        self.free_len.store(free.len(), Ordering::Release);
    }
}

pub struct FlowTable {
    slots: Box<[Slot]>,
    links: Box<[Link]>,
    shards: Box<[Mutex<ShardIndex>]>,
    pool: SlotPool,
    capacity: usize,
}

impl FlowTable {
    /// Table with `capacity` slots and a shard count derived from it.
    /// Small tables get a single shard and therefore exact global LRU.
    pub fn new(capacity: usize) -> Self {
        let shards = (capacity / MIN_SLOTS_PER_SHARD).clamp(1, MAX_SHARDS);
        Self::with_shards(capacity, shards)
    }

    /// Every shard draws from the same `capacity` slots, so nothing is
    /// evicted before the table as a whole is full. Eviction then takes the
    /// least recently accessed entry of the key's shard.
    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let capacity = capacity.min((NIL - 1) as usize);
        let shards = shards.clamp(1, MAX_SHARDS).min(capacity.max(1));
        let buckets = capacity / shards;
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            links: (0..capacity).map(|_| Link::new()).collect(),
            shards: (0..shards)
                .map(|_| Mutex::new(ShardIndex::new(buckets)))
                .collect(),
            pool: SlotPool::new(capacity),
            capacity,
        }
    }

    /// Counts one packet of `bytes` for `key`, creating the entry on a miss.
    ///
    /// Never fails outward: `None` means the observation was not tracked,
    /// which only happens for a zero-capacity table.
    pub fn record<C>(&self, key: FlowKey, bytes: u64, clock: &C) -> Option<Update>
    where
        C: Clock + ?Sized,
    {
        if self.slots.is_empty() {
            return None;
        }
        let hash = hash_key(&key);
        let home = self.shard_of(hash);
        let tag = key.pack() | OCCUPIED;

        {
            let mut index = self.shards[home].lock();
            let bucket = index.bucket_of(hash);
            if let Some(idx) = index.find(&self.slots, &self.links, bucket, tag) {
                self.hit(&mut index, idx, bytes, clock);
                return Some(Update::Hit);
            }
            if let Some(idx) = self.pool.claim() {
                self.fill(&mut index, bucket, idx, tag, bytes, clock);
                return Some(Update::Inserted);
            }
            if let Some((idx, victim)) = index.evict_tail(&self.slots, &self.links) {
                self.fill(&mut index, bucket, idx, tag, bytes, clock);
                return Some(Update::Evicted(victim));
            }
        }

        // Full, and this shard owns no slot. Only one shard lock is held at
        // a time, so the lookup is repeated once a slot is in hand.
        let (idx, update) = match self.steal(home) {
            Some((idx, victim)) => (idx, Update::Evicted(victim)),
            None => (self.pool.claim()?, Update::Inserted),
        };
        let mut index = self.shards[home].lock();
        let bucket = index.bucket_of(hash);
        if let Some(found) = index.find(&self.slots, &self.links, bucket, tag) {
            self.pool.release(idx);
            self.hit(&mut index, found, bytes, clock);
            return Some(Update::Hit);
        }
        self.fill(&mut index, bucket, idx, tag, bytes, clock);
        Some(update)
    }

    fn hit<C>(&self, index: &mut ShardIndex, idx: u32, bytes: u64, clock: &C)
    where
        C: Clock + ?Sized,
    {
        index.touch(&self.links, idx);
        let slot = &self.slots[idx as usize];
        slot.packets.fetch_add(1, Ordering::Relaxed);
        slot.bytes.fetch_add(bytes, Ordering::Relaxed);
        // Overwritten separately from the counters.
        slot.last_seen_ns.store(clock.now_ns(), Ordering::Relaxed);
    }

    fn fill<C>(
        &self,
        index: &mut ShardIndex,
        bucket: usize,
        idx: u32,
        tag: u64,
        bytes: u64,
        clock: &C,
    ) where
        C: Clock + ?Sized,
    {
        self.slots[idx as usize].publish(tag, bytes, clock.now_ns());
        index.insert(&self.links, bucket, idx);
    }

    // Evicts the oldest entry of the first shard after `from` that has one.
    fn steal(&self, from: usize) -> Option<(u32, FlowKey)> {
        let count = self.shards.len();
        (1..=count).find_map(|step| {
            self.shards[(from + step) % count]
                .lock()
                .evict_tail(&self.slots, &self.links)
        })
    }

    /// Reads one entry. Does not count as an access for eviction.
    pub fn get(&self, key: &FlowKey) -> Option<FlowInfo> {
        let hash = hash_key(key);
        let index = self.shards[self.shard_of(hash)].lock();
        let tag = key.pack() | OCCUPIED;
        let idx = index.find(&self.slots, &self.links, index.bucket_of(hash), tag)?;
        self.slots[idx as usize].load().map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().len as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Lock-free walk over live entries. Entries updated or recycled while
    /// the walk is in progress may be stale or skipped.
    pub fn iter(&self) -> impl Iterator<Item = (FlowKey, FlowInfo)> + '_ {
        self.slots.iter().filter_map(Slot::load)
    }

    /// Removes and returns every entry, one shard at a time.
    pub fn drain(&self) -> Vec<(FlowKey, FlowInfo)> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            self.drain_shard(shard, |key, info| entries.push((key, info)));
        }
        entries
    }

    pub fn reset(&self) {
        for shard in self.shards.iter() {
            self.drain_shard(shard, |_, _| {});
        }
    }

    fn drain_shard<F>(&self, shard: &Mutex<ShardIndex>, mut f: F)
    where
        F: FnMut(FlowKey, FlowInfo),
    {
        let mut index = shard.lock();
        let mut cursor = index.head;
        for _ in 0..index.len {
            if cursor == NIL {
                break;
            }
            let slot = &self.slots[cursor as usize];
            if let Some((key, info)) = slot.load() {
                f(key, info);
            }
            slot.tag.store(0, Ordering::Release);
            // Another shard may claim the slot as soon as it is released.
            let next = get(&self.links[cursor as usize].next);
            self.pool.release(cursor);
            cursor = next;
        }
        index.clear();
    }

    fn shard_of(&self, hash: u64) -> usize {
        (hash as usize) % self.shards.len()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new(FLOW_TABLE_CAPACITY as usize)
    }
}

fn hash_key(key: &FlowKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.pack().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    use flowlens_common::Protocol;

    use super::*;
    use crate::clock::ManualClock;

    fn key(n: u32) -> FlowKey {
        FlowKey::new(0x0a00_0000 | n, 443, Protocol::Tcp)
    }

    #[test]
    fn miss_then_hits_accumulate() {
        let table = FlowTable::new(16);
        let clock = ManualClock::new(100);
        assert_eq!(table.record(key(1), 60, &clock), Some(Update::Inserted));
        clock.advance(10);
        assert_eq!(table.record(key(1), 40, &clock), Some(Update::Hit));
        clock.advance(10);
        assert_eq!(table.record(key(1), 1500, &clock), Some(Update::Hit));

        let info = table.get(&key(1)).unwrap();
        assert_eq!(info.packets, 3);
        assert_eq!(info.bytes, 1600);
        assert_eq!(info.last_seen_ns, 120);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used_after_reaccess() {
        let table = FlowTable::new(2);
        let clock = ManualClock::new(0);
        let (a, b, c) = (key(1), key(2), key(3));

        table.record(a, 100, &clock);
        table.record(b, 100, &clock);
        table.record(a, 100, &clock);
        assert_eq!(table.record(c, 100, &clock), Some(Update::Evicted(b)));

        assert_eq!(table.len(), 2);
        assert!(table.get(&b).is_none());
        let a_info = table.get(&a).unwrap();
        assert_eq!((a_info.packets, a_info.bytes), (2, 200));
        let c_info = table.get(&c).unwrap();
        assert_eq!((c_info.packets, c_info.bytes), (1, 100));
    }

    #[test]
    fn eviction_follows_access_order_not_timestamps() {
        let table = FlowTable::new(3);
        let clock = ManualClock::new(1_000);
        table.record(key(1), 1, &clock);
        clock.set(10);
        table.record(key(2), 1, &clock);
        clock.set(500);
        table.record(key(3), 1, &clock);

        // key(2) has the oldest timestamp but key(1) was accessed first.
        assert_eq!(table.record(key(4), 1, &clock), Some(Update::Evicted(key(1))));
        assert_eq!(table.record(key(5), 1, &clock), Some(Update::Evicted(key(2))));
    }

    #[test]
    fn evicts_in_access_order_when_overfilled() {
        let table = FlowTable::new(4);
        let clock = ManualClock::new(0);
        for n in 0..4 {
            table.record(key(n), 1, &clock);
        }
        table.record(key(0), 1, &clock);
        table.record(key(1), 1, &clock);

        let mut evicted = Vec::new();
        for n in 10..14 {
            if let Some(Update::Evicted(old)) = table.record(key(n), 1, &clock) {
                evicted.push(old);
            }
        }
        assert_eq!(evicted, vec![key(2), key(3), key(0), key(1)]);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn get_does_not_refresh_recency() {
        let table = FlowTable::new(2);
        let clock = ManualClock::new(0);
        table.record(key(1), 1, &clock);
        table.record(key(2), 1, &clock);
        assert!(table.get(&key(1)).is_some());
        assert_eq!(table.record(key(3), 1, &clock), Some(Update::Evicted(key(1))));
    }

    #[test]
    fn shard_count_follows_capacity() {
        let table = FlowTable::with_shards(10, 3);
        assert_eq!(table.shard_count(), 3);
        assert_eq!(table.capacity(), 10);

        assert_eq!(FlowTable::new(2).shard_count(), 1);
        assert_eq!(FlowTable::new(100_000).shard_count(), MAX_SHARDS);
        assert_eq!(FlowTable::with_shards(2, 8).shard_count(), 2);
    }

    #[test]
    fn sharded_table_fills_to_capacity_before_evicting() {
        let table = FlowTable::with_shards(64, 8);
        let clock = ManualClock::new(0);
        for n in 0..64 {
            assert_eq!(table.record(key(n), 1, &clock), Some(Update::Inserted));
        }
        assert_eq!(table.len(), 64);
        assert!(matches!(
            table.record(key(64), 1, &clock),
            Some(Update::Evicted(_))
        ));
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn reference_capacity_holds_every_distinct_flow() {
        let table = FlowTable::default();
        let clock = ManualClock::new(0);
        let capacity = FLOW_TABLE_CAPACITY;
        for n in 0..capacity {
            assert_eq!(table.record(key(n), 1, &clock), Some(Update::Inserted));
        }
        assert_eq!(table.len(), capacity as usize);
        assert_eq!(table.iter().count(), capacity as usize);
    }

    #[test]
    fn full_table_makes_room_for_keys_of_any_shard() {
        // Four slots over four shards: most shards own nothing once full.
        let table = FlowTable::with_shards(4, 4);
        let clock = ManualClock::new(0);
        for n in 0..1_000 {
            assert!(table.record(key(n), 1, &clock).is_some());
            assert!(table.get(&key(n)).is_some());
            let expected = (n as usize + 1).min(4);
            assert_eq!(table.len(), expected);
            assert_eq!(table.iter().count(), expected);
        }
    }

    #[test]
    fn drained_slots_are_reused() {
        let table = FlowTable::with_shards(8, 4);
        let clock = ManualClock::new(0);
        for round in 0..3 {
            for n in 0..8 {
                let update = table.record(key(round * 100 + n), 1, &clock);
                assert_eq!(update, Some(Update::Inserted));
            }
            assert_eq!(table.drain().len(), 8);
            assert!(table.is_empty());
        }
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let table = FlowTable::with_shards(500, 4);
        let clock = ManualClock::new(0);
        for n in 0..5_000 {
            table.record(key(n), 64, &clock);
            assert!(table.len() <= 500);
        }
        assert_eq!(table.len(), 500);
        assert_eq!(table.iter().count(), 500);
    }

    #[test]
    fn zero_capacity_tracks_nothing() {
        let table = FlowTable::new(0);
        let clock = ManualClock::new(0);
        assert_eq!(table.record(key(1), 1, &clock), None);
        assert!(table.is_empty());
    }

    #[test]
    fn drain_returns_entries_and_empties_table() {
        let table = FlowTable::with_shards(8, 2);
        let clock = ManualClock::new(0);
        for n in 0..5 {
            table.record(key(n), 10, &clock);
        }
        let drained: HashSet<FlowKey> = table.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(drained, (0..5).map(key).collect());
        assert!(table.is_empty());
        assert_eq!(table.iter().count(), 0);

        assert_eq!(table.record(key(0), 10, &clock), Some(Update::Inserted));
        assert_eq!(table.get(&key(0)).unwrap().packets, 1);
    }

    #[test]
    fn reset_discards_entries() {
        let table = FlowTable::new(4);
        let clock = ManualClock::new(0);
        table.record(key(1), 10, &clock);
        table.reset();
        assert!(table.get(&key(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_hits_do_not_lose_updates() {
        let table = FlowTable::with_shards(64, 4);
        let clock = ManualClock::new(0);
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 10_000;

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let table = &table;
                let clock = &clock;
                s.spawn(move || {
                    for _ in 0..PER_THREAD {
                        table.record(key(1), t + 1, clock);
                    }
                });
            }
        });

        let info = table.get(&key(1)).unwrap();
        assert_eq!(info.packets, THREADS * PER_THREAD);
        assert_eq!(info.bytes, PER_THREAD * (1..=THREADS).sum::<u64>());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_misses_with_eviction_stay_bounded() {
        let table = FlowTable::with_shards(256, 4);
        let clock = ManualClock::new(0);
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            for t in 0..4u32 {
                let table = &table;
                let clock = &clock;
                s.spawn(move || {
                    for n in 0..20_000 {
                        table.record(key(t * 100_000 + n), 1, clock);
                    }
                });
            }
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    for (_, info) in table.iter() {
                        assert!(info.packets >= 1);
                    }
                    if table.len() == 256 {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
            });
        });

        assert_eq!(table.len(), 256);
        let keys: HashSet<FlowKey> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 256);
    }
}
