use std::{
    collections::BTreeSet,
    convert::TryFrom,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::pin::PinError;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{HashMap, Map, MapData, PerCpuArray},
};
use aya_log::EbpfLogger;
use clap::ValueEnum;
use log::{debug, info, warn};
use tokio::{signal, time};

use flowlens_common::{
    CLASSIFIER_STATS_MAP, FLOW_STATS_MAP, FlowInfo, FlowKey, MONITORED_PORTS_CAPACITY,
    MONITORED_PORTS_MAP, Outcome,
};

use crate::classifier::OutcomeCounts;
use crate::clock::{Clock, MonotonicClock};
use crate::report::{ActivityFilter, Report};

const EBPF_BYTES: &[u8] =
    include_bytes_aligned!(concat!(env!("OUT_DIR"), "/flowlens-classifier"));
const XDP_PROGRAM: &str = "flow_monitor_xdp";
const TC_PROGRAM: &str = "flow_monitor";
const PORT_PRESENT: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum AttachPoint {
    Xdp,
    TcIngress,
    TcEgress,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub attach_point: AttachPoint,
    pub xdp_mode: XdpMode,
    pub flow_map_entries: u32,
    pub ports: Vec<u16>,
    /// Directory to pin `flow_stats` and `monitored_ports` under.
    pub pin_dir: Option<PathBuf>,
    pub report_interval: Duration,
    pub activity: ActivityFilter,
    pub drain: bool,
    pub json: bool,
}

pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // `set_max_entries` is the only sizing API stable across aya releases.
        loader.set_max_entries(FLOW_STATS_MAP, opts.flow_map_entries);
    }

    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;
    if let Err(err) = EbpfLogger::init(&mut bpf) {
        // The program has no log statements on its hot path; carry on.
        warn!("failed to initialize eBPF logger: {err}");
    }

    sync_monitored_ports(&mut bpf, &opts.ports)?;

    if let Some(dir) = &opts.pin_dir {
        pin_map(&mut bpf, FLOW_STATS_MAP, &dir.join(FLOW_STATS_MAP))?;
        pin_map(&mut bpf, MONITORED_PORTS_MAP, &dir.join(MONITORED_PORTS_MAP))?;
    }

    let handle = match opts.attach_point {
        AttachPoint::Xdp => LinkHandle::Xdp(attach_xdp(&mut bpf, &opts.iface, opts.xdp_mode)?),
        AttachPoint::TcIngress => {
            LinkHandle::Tc(attach_tc(&mut bpf, &opts.iface, TcAttachType::Ingress)?)
        }
        AttachPoint::TcEgress => {
            LinkHandle::Tc(attach_tc(&mut bpf, &opts.iface, TcAttachType::Egress)?)
        }
    };

    info!(
        "attached {:?} classifier to {} watching {} ports. Press Ctrl+C to detach.",
        opts.attach_point,
        opts.iface,
        opts.ports.len()
    );

    let mut ticker = time::interval(opts.report_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("failed to wait for shutdown signal")?;
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = report_kernel_flows(&mut bpf, &opts, opts.drain) {
                    warn!("failed to read kernel flow table: {err:#}");
                }
            }
        }
    }

    info!("detaching {:?} from {}...", opts.attach_point, opts.iface);
    report_kernel_flows(&mut bpf, &opts, false)?;
    detach(&mut bpf, handle)?;
    Ok(())
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(
        opts.flow_map_entries > 0,
        "flow map size must be greater than zero"
    );
    ensure!(
        opts.ports.len() <= MONITORED_PORTS_CAPACITY as usize,
        "{} ports given but the kernel port map holds {}",
        opts.ports.len(),
        MONITORED_PORTS_CAPACITY
    );
    ensure!(
        !opts.report_interval.is_zero(),
        "report interval must be greater than zero"
    );
    Ok(())
}

/// Makes the kernel port map equal to `ports`: adds first, then removes
/// ports no longer wanted.
pub fn sync_monitored_ports(bpf: &mut Ebpf, ports: &[u16]) -> Result<()> {
    let map = bpf
        .map_mut(MONITORED_PORTS_MAP)
        .with_context(|| format!("map {MONITORED_PORTS_MAP} not found"))?;
    let mut monitored =
        HashMap::<_, u16, u8>::try_from(map).context("port map has unexpected type")?;

    let wanted: BTreeSet<u16> = ports.iter().copied().collect();
    for port in &wanted {
        monitored
            .insert(port, PORT_PRESENT, 0)
            .with_context(|| format!("failed to add port {port}"))?;
    }

    let stale: Vec<u16> = monitored
        .keys()
        .filter_map(|key| key.ok())
        .filter(|port| !wanted.contains(port))
        .collect();
    for port in stale {
        monitored
            .remove(&port)
            .with_context(|| format!("failed to remove port {port}"))?;
    }
    debug!("monitored ports: {wanted:?}");
    Ok(())
}

fn report_kernel_flows(bpf: &mut Ebpf, opts: &AttachOptions, drain: bool) -> Result<()> {
    let flows = if drain {
        drain_flows(bpf)?
    } else {
        read_flows(bpf)?
    };
    let report = Report {
        flows,
        outcomes: read_outcome_counts(bpf)?,
        now_ns: MonotonicClock.now_ns(),
    };
    report.log(&opts.activity, opts.json);
    Ok(())
}

/// Snapshot of the kernel flow table. Entries may be updated or evicted
/// while the walk is in progress.
pub fn read_flows(bpf: &Ebpf) -> Result<Vec<(FlowKey, FlowInfo)>> {
    let map = bpf
        .map(FLOW_STATS_MAP)
        .with_context(|| format!("map {FLOW_STATS_MAP} not found"))?;
    let flows = HashMap::<_, FlowKey, FlowInfo>::try_from(map)
        .context("flow map has unexpected type")?;
    collect_flows(&flows)
}

/// Reads and deletes every entry. Packets counted between the read and the
/// delete of a key are lost from the report.
pub fn drain_flows(bpf: &mut Ebpf) -> Result<Vec<(FlowKey, FlowInfo)>> {
    let map = bpf
        .map_mut(FLOW_STATS_MAP)
        .with_context(|| format!("map {FLOW_STATS_MAP} not found"))?;
    let mut flows = HashMap::<_, FlowKey, FlowInfo>::try_from(map)
        .context("flow map has unexpected type")?;
    let entries = collect_flows(&flows)?;
    for (key, _) in &entries {
        // Already evicted by the kernel is fine.
        let _ = flows.remove(key);
    }
    Ok(entries)
}

/// Reads a flow table pinned by a previous `attach --pin-dir`.
pub fn read_pinned_flows<P: AsRef<Path>>(pin_path: P) -> Result<Vec<(FlowKey, FlowInfo)>> {
    let pin = pin_path.as_ref();
    let map_data =
        MapData::from_pin(pin).map_err(|e| anyhow!("failed to open pinned map: {}", e))?;
    let map_enum = Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {}", e))?;
    let flows = HashMap::<_, FlowKey, FlowInfo>::try_from(map_enum)
        .map_err(|e| anyhow!("failed to convert to HashMap: {}", e))?;
    collect_flows(&flows)
}

fn collect_flows<T>(flows: &HashMap<T, FlowKey, FlowInfo>) -> Result<Vec<(FlowKey, FlowInfo)>>
where
    T: std::borrow::Borrow<MapData>,
{
    let mut entries = Vec::new();
    for item in flows.iter() {
        let (key, info) = item.map_err(|e| anyhow!("aya iter error: {}", e))?;
        entries.push((key, info));
    }
    Ok(entries)
}

pub fn read_outcome_counts(bpf: &Ebpf) -> Result<OutcomeCounts> {
    let map = bpf
        .map(CLASSIFIER_STATS_MAP)
        .with_context(|| format!("map {CLASSIFIER_STATS_MAP} not found"))?;
    let stats =
        PerCpuArray::<_, u64>::try_from(map).context("stats map has unexpected type")?;

    let mut counts = OutcomeCounts::default();
    for outcome in Outcome::ALL {
        let per_cpu = stats
            .get(&outcome.index(), 0)
            .with_context(|| format!("failed to read {} counter", outcome.as_str()))?;
        counts.0[outcome.index() as usize] = sum_per_cpu(per_cpu.iter());
    }
    Ok(counts)
}

fn sum_per_cpu<'a, I>(values: I) -> u64
where
    I: IntoIterator<Item = &'a u64>,
{
    values.into_iter().fold(0u64, |acc, v| acc.wrapping_add(*v))
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

enum LinkHandle {
    Xdp(XdpLinkId),
    Tc(SchedClassifierLinkId),
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let flags = xdp_flags(mode);
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, flags)
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

fn attach_tc(
    bpf: &mut Ebpf,
    iface: &str,
    attach_type: TcAttachType,
) -> Result<SchedClassifierLinkId> {
    // Fails harmlessly when the clsact qdisc already exists.
    if let Err(err) = tc::qdisc_add_clsact(iface) {
        debug!("qdisc_add_clsact on {iface}: {err}");
    }
    let program: &mut SchedClassifier = bpf
        .program_mut(TC_PROGRAM)
        .with_context(|| format!("program {TC_PROGRAM} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.load().context("failed to load tc program")?;
    program
        .attach(iface, attach_type)
        .with_context(|| format!("failed to attach tc on {iface}"))
}

fn detach(bpf: &mut Ebpf, handle: LinkHandle) -> Result<()> {
    match handle {
        LinkHandle::Xdp(id) => {
            let program: &mut Xdp = bpf
                .program_mut(XDP_PROGRAM)
                .with_context(|| format!("program {XDP_PROGRAM} not found"))?
                .try_into()
                .context("xdp program has wrong type")?;
            program.detach(id).context("failed to detach xdp program")
        }
        LinkHandle::Tc(id) => {
            let program: &mut SchedClassifier = bpf
                .program_mut(TC_PROGRAM)
                .with_context(|| format!("program {TC_PROGRAM} not found"))?
                .try_into()
                .context("tc program has wrong type")?;
            program.detach(id).context("failed to detach tc program")
        }
    }
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> AttachOptions {
        AttachOptions {
            iface: "eth0".to_string(),
            attach_point: AttachPoint::TcIngress,
            xdp_mode: XdpMode::Skb,
            flow_map_entries: 100_000,
            ports: vec![53, 443],
            pin_dir: None,
            report_interval: Duration::from_secs(30),
            activity: ActivityFilter::default(),
            drain: false,
            json: false,
        }
    }

    #[test]
    fn sum_per_cpu_accumulates_all_cpus() {
        let cpus = vec![3u64, 0, 7, 1];
        assert_eq!(sum_per_cpu(cpus.iter()), 11);
    }

    #[test]
    fn sum_per_cpu_wraps_instead_of_panicking() {
        let cpus = vec![u64::MAX, 2];
        assert_eq!(sum_per_cpu(cpus.iter()), 1);
    }

    #[test]
    fn attach_options_validate() {
        assert!(validate_attach_options(&options()).is_ok());

        let mut opts = options();
        opts.flow_map_entries = 0;
        assert!(validate_attach_options(&opts).is_err());

        let mut opts = options();
        opts.ports = (0..=MONITORED_PORTS_CAPACITY as u16).collect();
        assert!(validate_attach_options(&opts).is_err());
    }

    #[test]
    fn xdp_modes_map_to_flags() {
        assert_eq!(xdp_flags(XdpMode::Skb), XdpFlags::SKB_MODE);
        assert_eq!(xdp_flags(XdpMode::Driver), XdpFlags::DRV_MODE);
        assert_eq!(xdp_flags(XdpMode::Hw), XdpFlags::HW_MODE);
    }
}
