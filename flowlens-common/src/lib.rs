#![no_std]

// Types shared between the userspace pipeline and the kernel classifier.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub const FLOW_STATS_MAP: &str = "flow_stats";
pub const MONITORED_PORTS_MAP: &str = "monitored_ports";
pub const CLASSIFIER_STATS_MAP: &str = "classifier_stats";

/// Reference size of the flow table.
pub const FLOW_TABLE_CAPACITY: u32 = 100_000;
/// Reference size of the monitored-port set.
pub const MONITORED_PORTS_CAPACITY: u32 = 1_000;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp = PROTO_TCP,
    Udp = PROTO_UDP,
}

impl Protocol {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            PROTO_TCP => Some(Protocol::Tcp),
            PROTO_UDP => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Identity of a tracked flow.
///
/// The destination address is not part of the key: traffic from one source
/// to one port is aggregated across every destination.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    /// IPv4 source address in host byte order.
    pub src_addr: u32,
    pub dst_port: u16,
    pub proto: u8,
    pub pad: u8,
}

impl FlowKey {
    pub const fn new(src_addr: u32, dst_port: u16, protocol: Protocol) -> Self {
        Self {
            src_addr,
            dst_port,
            proto: protocol as u8,
            pad: 0,
        }
    }

    pub const fn protocol(&self) -> Option<Protocol> {
        Protocol::from_u8(self.proto)
    }

    /// Packs the key into the low 56 bits of a `u64`.
    pub const fn pack(&self) -> u64 {
        ((self.src_addr as u64) << 24) | ((self.dst_port as u64) << 8) | self.proto as u64
    }

    pub const fn unpack(packed: u64) -> Self {
        Self {
            src_addr: (packed >> 24) as u32,
            dst_port: (packed >> 8) as u16,
            proto: packed as u8,
            pad: 0,
        }
    }
}

/// Aggregate counters for one flow.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowInfo {
    pub packets: u64,
    pub bytes: u64,
    /// CLOCK_MONOTONIC nanoseconds of the latest observation.
    pub last_seen_ns: u64,
}

/// Terminal result of classifying one packet. Indexes the per-outcome
/// counter arrays on both sides.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Outcome {
    /// Counted against a flow table entry.
    Tracked = 0,
    /// Truncated buffer or malformed header.
    Malformed = 1,
    /// Not IPv4, or neither TCP nor UDP.
    Unsupported = 2,
    /// Destination port is not monitored.
    Unmonitored = 3,
    /// Monitored, but the flow table could not take the entry.
    Untracked = 4,
}

impl Outcome {
    pub const COUNT: usize = 5;

    pub const ALL: [Outcome; Outcome::COUNT] = [
        Outcome::Tracked,
        Outcome::Malformed,
        Outcome::Unsupported,
        Outcome::Unmonitored,
        Outcome::Untracked,
    ];

    pub const fn index(self) -> u32 {
        self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Tracked => "tracked",
            Outcome::Malformed => "malformed",
            Outcome::Unsupported => "unsupported",
            Outcome::Unmonitored => "unmonitored",
            Outcome::Untracked => "untracked",
        }
    }
}

/// Per-flow map operations of the kernel classifier.
pub trait FlowStore {
    /// Counts one packet against an existing entry; `false` if absent.
    fn bump(&self, key: &FlowKey, bytes: u64) -> bool;
    /// Creates `key` only if absent. `false` if it already exists or the
    /// map refused the entry.
    fn create(&self, key: &FlowKey, info: &FlowInfo) -> bool;
}

/// Counts one packet for `key`. When another CPU creates the entry between
/// the lookup and the insert, the packet is counted against that entry.
#[inline(always)]
pub fn track_flow<S, F>(store: &S, key: &FlowKey, bytes: u64, now_ns: F) -> Outcome
where
    S: FlowStore + ?Sized,
    F: FnOnce() -> u64,
{
    if store.bump(key, bytes) {
        return Outcome::Tracked;
    }
    let init = FlowInfo {
        packets: 1,
        bytes,
        last_seen_ns: now_ns(),
    };
    if store.create(key, &init) || store.bump(key, bytes) {
        Outcome::Tracked
    } else {
        Outcome::Untracked
    }
}

// With the `user` feature the crate implements `aya::Pod` for the map key
// and value types so they work with aya's typed map APIs. The eBPF side
// stays free of userspace-only dependencies.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{FlowInfo, FlowKey};
    use aya::Pod;

    unsafe impl Pod for FlowKey {}
    unsafe impl Pod for FlowInfo {}
}
