// Presence bitmap over all 65,536 ports: `contains` is one atomic load.

use std::collections::BTreeSet;
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use thiserror::Error;

const WORD_BITS: usize = 64;
const WORDS: usize = (u16::MAX as usize + 1) / WORD_BITS;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PortSetError {
    #[error("monitored port set is full ({capacity} ports), cannot add port {port}")]
    Full { port: u16, capacity: usize },
}

pub struct MonitoredPortSet {
    bits: Box<[AtomicU64]>,
    len: AtomicUsize,
    capacity: usize,
    writer: Mutex<()>,
}

impl MonitoredPortSet {
    pub fn new(capacity: usize) -> Self {
        let bits = (0..WORDS).map(|_| AtomicU64::new(0)).collect();
        Self {
            bits,
            len: AtomicUsize::new(0),
            capacity: capacity.min(WORDS * WORD_BITS),
            writer: Mutex::new(()),
        }
    }

    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        let (word, mask) = locate(port);
        self.bits[word].load(Ordering::Acquire) & mask != 0
    }

    /// Returns `Ok(false)` if the port was already present.
    pub fn insert(&self, port: u16) -> Result<bool, PortSetError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.contains(port) {
            return Ok(false);
        }
        if self.len() >= self.capacity {
            return Err(PortSetError::Full {
                port,
                capacity: self.capacity,
            });
        }
        Ok(self.set_bit(port))
    }

    pub fn remove(&self, port: u16) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.clear_bit(port)
    }

    /// Makes the set equal to `ports`. Ports present before and after stay
    /// visible to readers throughout.
    pub fn replace<I>(&self, ports: I) -> Result<(), PortSetError>
    where
        I: IntoIterator<Item = u16>,
    {
        let wanted: BTreeSet<u16> = ports.into_iter().collect();
        if let Some(&port) = wanted.iter().nth(self.capacity) {
            return Err(PortSetError::Full {
                port,
                capacity: self.capacity,
            });
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<u16> = self.iter().filter(|p| !wanted.contains(p)).collect();
        // New ports go in before stale ones come out. The bitmap can hold
        // both for the moment in between.
        for &port in &wanted {
            self.set_bit(port);
        }
        for port in stale {
            self.clear_bit(port);
        }
        Ok(())
    }

    fn set_bit(&self, port: u16) -> bool {
        let (word, mask) = locate(port);
        let prev = self.bits[word].fetch_or(mask, Ordering::Release);
        if prev & mask != 0 {
            return false;
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn clear_bit(&self, port: u16) -> bool {
        let (word, mask) = locate(port);
        let prev = self.bits[word].fetch_and(!mask, Ordering::Release);
        if prev & mask == 0 {
            return false;
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ports in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.bits.iter().enumerate().flat_map(|(word, bits)| {
            let snapshot = bits.load(Ordering::Acquire);
            (0..WORD_BITS)
                .filter(move |bit| snapshot & (1u64 << bit) != 0)
                .map(move |bit| (word * WORD_BITS + bit) as u16)
        })
    }
}

impl Default for MonitoredPortSet {
    fn default() -> Self {
        Self::new(flowlens_common::MONITORED_PORTS_CAPACITY as usize)
    }
}

fn locate(port: u16) -> (usize, u64) {
    let idx = port as usize;
    (idx / WORD_BITS, 1u64 << (idx % WORD_BITS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let set = MonitoredPortSet::new(8);
        assert!(!set.contains(443));
        assert_eq!(set.insert(443), Ok(true));
        assert_eq!(set.insert(443), Ok(false));
        assert!(set.contains(443));
        assert!(!set.contains(444));
        assert_eq!(set.len(), 1);

        assert!(set.remove(443));
        assert!(!set.remove(443));
        assert!(!set.contains(443));
        assert!(set.is_empty());
    }

    #[test]
    fn boundary_ports_are_addressable() {
        let set = MonitoredPortSet::new(4);
        set.insert(0).unwrap();
        set.insert(u16::MAX).unwrap();
        assert!(set.contains(0));
        assert!(set.contains(u16::MAX));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, u16::MAX]);
    }

    #[test]
    fn insert_fails_at_capacity() {
        let set = MonitoredPortSet::new(2);
        set.insert(80).unwrap();
        set.insert(443).unwrap();
        assert_eq!(
            set.insert(53),
            Err(PortSetError::Full {
                port: 53,
                capacity: 2
            })
        );
        // Re-inserting a present port is not a capacity error.
        assert_eq!(set.insert(80), Ok(false));
        assert!(!set.contains(53));
    }

    #[test]
    fn replace_swaps_membership() {
        let set = MonitoredPortSet::new(3);
        set.replace([80, 443, 8080]).unwrap();
        set.replace([443, 53, 27015]).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![53, 443, 27015]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn replace_at_capacity_with_disjoint_set() {
        let set = MonitoredPortSet::new(2);
        set.replace([1, 2]).unwrap();
        set.replace([3, 4]).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn replace_never_leaves_a_gap() {
        // Ports 1 and 3 share a bitmap word, so one `iter` snapshot sees
        // both atomically.
        let set = MonitoredPortSet::new(2);
        set.replace([1, 2]).unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..5_000 {
                    let swap = if round % 2 == 0 { 3 } else { 1 };
                    set.replace([swap, 2]).unwrap();
                }
                done.store(true, Ordering::Relaxed);
            });
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let seen: Vec<u16> = set.iter().take_while(|p| *p < 64).collect();
                    assert!(seen.contains(&2));
                    assert!(seen.contains(&1) || seen.contains(&3));
                }
            });
        });
    }

    #[test]
    fn replace_rejects_oversized_sets() {
        let set = MonitoredPortSet::new(2);
        set.insert(22).unwrap();
        assert!(set.replace([1, 2, 3]).is_err());
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![22]);
    }

    #[test]
    fn readers_see_concurrent_writes() {
        let set = MonitoredPortSet::new(1000);
        std::thread::scope(|s| {
            s.spawn(|| {
                for port in 1000..1500 {
                    set.insert(port).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..10_000 {
                    // Ports outside the written range never appear.
                    assert!(!set.contains(80));
                }
            });
        });
        assert_eq!(set.len(), 500);
        assert!((1000..1500).all(|p| set.contains(p)));
    }
}
