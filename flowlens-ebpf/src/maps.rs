// Map definitions for the kernel classifier. Names and key/value layouts
// are shared with userspace through `flowlens_common`.

use aya_ebpf::macros::map;
use aya_ebpf::maps::{HashMap, LruHashMap, PerCpuArray};
use flowlens_common::{
    FlowInfo, FlowKey, Outcome, FLOW_TABLE_CAPACITY, MONITORED_PORTS_CAPACITY,
};

// The loader may resize this before load.
#[map(name = "flow_stats")]
pub static FLOW_STATS: LruHashMap<FlowKey, FlowInfo> =
    LruHashMap::<FlowKey, FlowInfo>::with_max_entries(FLOW_TABLE_CAPACITY, 0);

// Presence only; the value byte is ignored.
#[map(name = "monitored_ports")]
pub static MONITORED_PORTS: HashMap<u16, u8> =
    HashMap::<u16, u8>::with_max_entries(MONITORED_PORTS_CAPACITY, 0);

#[map(name = "classifier_stats")]
pub static CLASSIFIER_STATS: PerCpuArray<u64> =
    PerCpuArray::<u64>::with_max_entries(Outcome::COUNT as u32, 0);
