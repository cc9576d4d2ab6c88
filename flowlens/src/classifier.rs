use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use flowlens_common::Outcome;

use crate::clock::{Clock, MonotonicClock};
use crate::parser;
use crate::ports::MonitoredPortSet;
use crate::table::FlowTable;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
}

pub struct FlowClassifier<C = MonotonicClock> {
    ports: Arc<MonitoredPortSet>,
    table: Arc<FlowTable>,
    clock: C,
    stats: ClassifierStats,
}

impl FlowClassifier<MonotonicClock> {
    pub fn new(ports: Arc<MonitoredPortSet>, table: Arc<FlowTable>) -> Self {
        Self::with_clock(ports, table, MonotonicClock)
    }
}

impl<C: Clock> FlowClassifier<C> {
    pub fn with_clock(ports: Arc<MonitoredPortSet>, table: Arc<FlowTable>, clock: C) -> Self {
        Self {
            ports,
            table,
            clock,
            stats: ClassifierStats::default(),
        }
    }

    /// Packet-path entry point. `packet_len` is the length on the wire,
    /// which may exceed the captured buffer.
    #[inline]
    pub fn process(&self, packet: &[u8], packet_len: u64) -> Verdict {
        let outcome = self.observe(packet, packet_len);
        self.stats.record(outcome);
        Verdict::Pass
    }

    pub fn observe(&self, packet: &[u8], packet_len: u64) -> Outcome {
        let headers = match parser::parse(packet) {
            Ok(headers) => headers,
            Err(skip) => return skip.outcome(),
        };
        if !self.ports.contains(headers.dst_port) {
            return Outcome::Unmonitored;
        }
        match self.table.record(headers.flow_key(), packet_len, &self.clock) {
            Some(_) => Outcome::Tracked,
            None => Outcome::Untracked,
        }
    }

    pub fn ports(&self) -> &Arc<MonitoredPortSet> {
        &self.ports
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn stats(&self) -> &ClassifierStats {
        &self.stats
    }
}

/// One relaxed counter per [`Outcome`].
#[derive(Default)]
pub struct ClassifierStats {
    counts: [AtomicU64; Outcome::COUNT],
}

impl ClassifierStats {
    #[inline]
    pub fn record(&self, outcome: Outcome) {
        self.counts[outcome.index() as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, outcome: Outcome) -> u64 {
        self.counts[outcome.index() as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> OutcomeCounts {
        let mut counts = [0u64; Outcome::COUNT];
        for outcome in Outcome::ALL {
            counts[outcome.index() as usize] = self.get(outcome);
        }
        OutcomeCounts(counts)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OutcomeCounts(pub [u64; Outcome::COUNT]);

impl OutcomeCounts {
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.0[outcome.index() as usize]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, n| acc.wrapping_add(*n))
    }
}
