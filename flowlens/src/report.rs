use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use flowlens_common::{FlowInfo, FlowKey, Outcome};
use log::info;
use serde::Serialize;
use serde_json::{Value, json};

use crate::classifier::OutcomeCounts;

pub const DEFAULT_ACTIVITY_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_MIN_PACKETS: u64 = 50;
pub const DEFAULT_MIN_BYTES: u64 = 1000;

/// Which flows count as active for the per-port summary.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ActivityFilter {
    /// Flows not seen within this window are ignored.
    pub window: Duration,
    pub min_packets: u64,
    pub min_bytes: u64,
}

impl Default for ActivityFilter {
    fn default() -> Self {
        Self {
            window: DEFAULT_ACTIVITY_WINDOW,
            min_packets: DEFAULT_MIN_PACKETS,
            min_bytes: DEFAULT_MIN_BYTES,
        }
    }
}

impl ActivityFilter {
    fn admits(&self, info: &FlowInfo, cutoff_ns: u64) -> bool {
        info.last_seen_ns >= cutoff_ns
            && info.packets >= self.min_packets
            && info.bytes >= self.min_bytes
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PortActivity {
    pub port: u16,
    /// Distinct source addresses with at least one admitted flow.
    pub active_sources: usize,
    pub packets: u64,
    pub bytes: u64,
}

/// Groups admitted flows by destination port, ascending.
pub fn summarize<I>(entries: I, now_ns: u64, filter: &ActivityFilter) -> Vec<PortActivity>
where
    I: IntoIterator<Item = (FlowKey, FlowInfo)>,
{
    let window_ns = u64::try_from(filter.window.as_nanos()).unwrap_or(u64::MAX);
    let cutoff_ns = now_ns.saturating_sub(window_ns);

    let mut ports: BTreeMap<u16, (HashSet<u32>, u64, u64)> = BTreeMap::new();
    for (key, info) in entries {
        if !filter.admits(&info, cutoff_ns) {
            continue;
        }
        let (sources, packets, bytes) = ports.entry(key.dst_port).or_default();
        sources.insert(key.src_addr);
        *packets = packets.wrapping_add(info.packets);
        *bytes = bytes.wrapping_add(info.bytes);
    }

    ports
        .into_iter()
        .map(|(port, (sources, packets, bytes))| PortActivity {
            port,
            active_sources: sources.len(),
            packets,
            bytes,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct FlowRecord {
    src_addr: Ipv4Addr,
    dst_port: u16,
    protocol: &'static str,
    packets: u64,
    bytes: u64,
    last_seen_ns: u64,
}

impl From<(FlowKey, FlowInfo)> for FlowRecord {
    fn from((key, info): (FlowKey, FlowInfo)) -> Self {
        Self {
            src_addr: Ipv4Addr::from(key.src_addr),
            dst_port: key.dst_port,
            protocol: key.protocol().map(|p| p.as_str()).unwrap_or("unknown"),
            packets: info.packets,
            bytes: info.bytes,
            last_seen_ns: info.last_seen_ns,
        }
    }
}

/// Returns a JSON array of flow objects.
pub fn flows_to_json<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (FlowKey, FlowInfo)>,
{
    let records: Vec<FlowRecord> = entries.into_iter().map(FlowRecord::from).collect();
    serde_json::to_value(records).unwrap_or(Value::Array(Vec::new()))
}

pub fn outcomes_to_json(counts: &OutcomeCounts) -> Value {
    let mut obj = serde_json::Map::new();
    for outcome in Outcome::ALL {
        obj.insert(outcome.as_str().to_string(), json!(counts.get(outcome)));
    }
    Value::Object(obj)
}

/// One reporting cycle's worth of data.
pub struct Report {
    pub flows: Vec<(FlowKey, FlowInfo)>,
    pub outcomes: OutcomeCounts,
    pub now_ns: u64,
}

impl Report {
    pub fn to_json(&self, filter: &ActivityFilter) -> Value {
        json!({
            "now_ns": self.now_ns,
            "outcomes": outcomes_to_json(&self.outcomes),
            "ports": summarize(self.flows.iter().copied(), self.now_ns, filter),
            "flows": flows_to_json(self.flows.iter().copied()),
        })
    }

    pub fn log(&self, filter: &ActivityFilter, as_json: bool) {
        if as_json {
            info!("{}", self.to_json(filter));
            return;
        }

        info!(
            "{} flows; outcomes: tracked={} malformed={} unsupported={} unmonitored={} untracked={}",
            self.flows.len(),
            self.outcomes.get(Outcome::Tracked),
            self.outcomes.get(Outcome::Malformed),
            self.outcomes.get(Outcome::Unsupported),
            self.outcomes.get(Outcome::Unmonitored),
            self.outcomes.get(Outcome::Untracked),
        );
        for activity in summarize(self.flows.iter().copied(), self.now_ns, filter) {
            info!(
                "port {}: {} active sources, {} packets, {} bytes",
                activity.port, activity.active_sources, activity.packets, activity.bytes
            );
        }
    }
}
