use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering, fence},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, info, warn};
use tokio::{signal, task, time};

use crate::classifier::FlowClassifier;
use crate::clock::Clock;
use crate::ports::MonitoredPortSet;
use crate::report::{ActivityFilter, Report};
use crate::table::FlowTable;

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20; // 1 MiB
pub const DEFAULT_BLOCK_COUNT: u32 = 64;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u32 = 100;

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
    pub block_timeout_ms: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
        }
    }
}

pub struct NodeOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub ring: RingConfig,
    pub ports: Vec<u16>,
    pub port_capacity: usize,
    pub table_capacity: usize,
    pub report_interval: Duration,
    pub activity: ActivityFilter,
    /// Empty the table after every report.
    pub drain: bool,
    pub json: bool,
}

pub fn validate_node_options(opts: &NodeOptions) -> Result<()> {
    ensure!(opts.workers > 0, "workers must be at least 1");
    ensure!(
        !opts.report_interval.is_zero(),
        "report interval must be greater than zero"
    );
    ensure!(
        opts.table_capacity > 0,
        "flow table capacity must be greater than zero"
    );
    ensure!(
        opts.ports.len() <= opts.port_capacity,
        "{} ports given but the monitored-port set holds {}",
        opts.ports.len(),
        opts.port_capacity
    );
    validate_ring_config(&opts.ring)
}

fn validate_ring_config(cfg: &RingConfig) -> Result<()> {
    if cfg.block_size == 0 || cfg.block_count == 0 || cfg.frame_size == 0 {
        return Err(anyhow!("ring parameters must be non-zero"));
    }
    if cfg.frame_size > cfg.block_size {
        return Err(anyhow!("frame size must be <= block size"));
    }
    if cfg.block_size % cfg.frame_size != 0 {
        return Err(anyhow!("block size must be a multiple of frame size"));
    }
    let alignment = libc::TPACKET_ALIGNMENT as u32;
    if cfg.block_size % alignment != 0 || cfg.frame_size % alignment != 0 {
        return Err(anyhow!(
            "block and frame sizes must be aligned to {} bytes",
            alignment
        ));
    }
    (cfg.block_size / cfg.frame_size)
        .checked_mul(cfg.block_count)
        .ok_or_else(|| anyhow!("ring size overflow"))?;
    Ok(())
}

pub async fn run_packet_pipeline(opts: NodeOptions) -> Result<()> {
    validate_node_options(&opts)?;

    let ports = Arc::new(MonitoredPortSet::new(opts.port_capacity));
    ports
        .replace(opts.ports.iter().copied())
        .context("failed to populate monitored ports")?;
    if ports.is_empty() {
        warn!("no monitored ports configured; every packet will be skipped");
    }
    let table = Arc::new(FlowTable::new(opts.table_capacity));
    let classifier = Arc::new(FlowClassifier::new(ports.clone(), table.clone()));
    info!(
        "tracking {} ports on {} with a {}-entry table ({} shards)",
        ports.len(),
        opts.iface,
        table.capacity(),
        table.shard_count()
    );

    let running = Arc::new(AtomicBool::new(true));

    let mut handles = Vec::with_capacity(opts.workers);
    for worker_id in 0..opts.workers {
        let iface = opts.iface.clone();
        let fanout = opts.fanout_group;
        let classifier = classifier.clone();
        let running = running.clone();
        let ring_cfg = opts.ring;
        handles.push(task::spawn(async move {
            worker_loop(worker_id, &iface, fanout, running, classifier, ring_cfg).await
        }));
    }

    let reporter_classifier = classifier.clone();
    let reporter_running = running.clone();
    let report_interval = opts.report_interval;
    let activity = opts.activity;
    let (drain, json) = (opts.drain, opts.json);
    let reporter = tokio::spawn(async move {
        let mut ticker = time::interval(report_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !reporter_running.load(Ordering::Relaxed) {
                break;
            }
            report(&reporter_classifier, &activity, drain, json);
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("received shutdown signal, draining...");
    running.store(false, Ordering::Relaxed);

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(anyhow!("worker panicked: {err}")),
        }
    }

    reporter.abort();
    let _ = reporter.await;

    report(&classifier, &activity, true, json);
    Ok(())
}

fn report(classifier: &FlowClassifier, activity: &ActivityFilter, drain: bool, json: bool) {
    let table = classifier.table();
    let flows = if drain {
        table.drain()
    } else {
        table.iter().collect()
    };
    let report = Report {
        flows,
        outcomes: classifier.stats().snapshot(),
        now_ns: classifier.clock().now_ns(),
    };
    report.log(activity, json);
}

async fn worker_loop(
    worker_id: usize,
    iface: &str,
    fanout_group: Option<u16>,
    running: Arc<AtomicBool>,
    classifier: Arc<FlowClassifier>,
    ring_cfg: RingConfig,
) -> Result<()> {
    let mut socket = PacketSocket::bind(iface, fanout_group, ring_cfg)
        .with_context(|| format!("worker {worker_id}: failed to bind packet socket"))?;
    debug!("worker {worker_id}: bound to {iface}");
    socket.pump(&running, &classifier).await
}

struct PacketSocket {
    fd: OwnedFd,
    ring: PacketRing,
}

impl PacketSocket {
    fn bind(iface: &str, fanout_group: Option<u16>, ring_cfg: RingConfig) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to create packet socket");
        }

        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let version: libc::c_int = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                owned_fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_VERSION,
                &version as *const _ as *const libc::c_void,
                mem::size_of_val(&version) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to enable TPACKET_V3");
        }

        let ring = PacketRing::new(owned_fd.as_raw_fd(), ring_cfg)?;
        bind_interface(owned_fd.as_raw_fd(), iface, protocol)?;
        configure_fanout(owned_fd.as_raw_fd(), fanout_group)?;

        Ok(Self { fd: owned_fd, ring })
    }

    async fn pump(&mut self, running: &AtomicBool, classifier: &FlowClassifier) -> Result<()> {
        let block_nr = self.ring.block_count() as usize;
        while running.load(Ordering::Relaxed) {
            let mut made_progress = false;
            for _ in 0..block_nr {
                if self.ring.consume_next_block(classifier) {
                    made_progress = true;
                }
            }

            if !made_progress {
                wait_for_read(self.fd.as_raw_fd()).await?;
            }
        }

        Ok(())
    }
}

fn bind_interface(fd: RawFd, iface: &str, protocol: u16) -> Result<()> {
    let ifname = CString::new(iface)?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("failed to lookup interface index of {iface}"));
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("failed to bind packet socket");
    }

    Ok(())
}

fn configure_fanout(fd: RawFd, fanout_group: Option<u16>) -> Result<()> {
    if let Some(group) = fanout_group {
        // Hash fanout keeps all packets of one flow on one worker.
        let fanout_type = libc::PACKET_FANOUT_HASH;
        let val: u32 = (group as u32) | (fanout_type << 16);
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_FANOUT,
                &val as *const _ as *const libc::c_void,
                mem::size_of_val(&val) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to configure PACKET_FANOUT");
        }
    }

    Ok(())
}

struct PacketRing {
    base: *mut u8,
    len: usize,
    req: libc::tpacket_req3,
    current_block: u32,
}

// Each ring is owned by one PacketSocket, which is driven by a single task.
unsafe impl Send for PacketRing {}

impl PacketRing {
    fn new(fd: RawFd, cfg: RingConfig) -> Result<Self> {
        validate_ring_config(&cfg)?;
        let frame_nr = (cfg.block_size / cfg.frame_size)
            .checked_mul(cfg.block_count)
            .ok_or_else(|| anyhow!("ring size overflow"))?;

        let req = libc::tpacket_req3 {
            tp_block_size: cfg.block_size,
            tp_block_nr: cfg.block_count,
            tp_frame_size: cfg.frame_size,
            tp_frame_nr: frame_nr,
            tp_retire_blk_tov: cfg.block_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: libc::TP_FT_REQ_FILL_RXHASH,
        };

        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_RX_RING,
                &req as *const _ as *const libc::c_void,
                mem::size_of::<libc::tpacket_req3>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to configure PACKET_RX_RING");
        }

        let len = (req.tp_block_size as usize)
            .checked_mul(req.tp_block_nr as usize)
            .ok_or_else(|| anyhow!("ring mmap length overflow"))?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("failed to mmap PACKET_RX_RING");
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            req,
            current_block: 0,
        })
    }

    fn block_count(&self) -> u32 {
        self.req.tp_block_nr
    }

    fn block_size(&self) -> usize {
        self.req.tp_block_size as usize
    }

    fn consume_next_block(&mut self, classifier: &FlowClassifier) -> bool {
        let idx = self.current_block;
        self.current_block = (self.current_block + 1) % self.req.tp_block_nr.max(1);
        self.consume_block(idx, classifier)
    }

    fn consume_block(&mut self, idx: u32, classifier: &FlowClassifier) -> bool {
        let block_ptr = unsafe { self.base.add(idx as usize * self.block_size()) };
        let desc = block_ptr as *mut libc::tpacket_block_desc;
        let status = unsafe { (*desc).hdr.bh1.block_status };
        if status & libc::TP_STATUS_USER == 0 {
            return false;
        }

        fence(Ordering::Acquire);
        unsafe {
            let hdr = &mut (*desc).hdr.bh1;
            let mut offset = hdr.offset_to_first_pkt as usize;
            let block_size = self.block_size();
            for _ in 0..hdr.num_pkts {
                if offset >= block_size {
                    break;
                }
                let frame_ptr = block_ptr.add(offset) as *const libc::tpacket3_hdr;
                let next = (*frame_ptr).tp_next_offset as usize;
                let snaplen = (*frame_ptr).tp_snaplen as usize;
                let wire_len = (*frame_ptr).tp_len as u64;
                let mac = (*frame_ptr).tp_mac as usize;
                let data_offset = offset + mac;
                if data_offset > block_size || data_offset + snaplen > block_size {
                    break;
                }
                let frame = slice::from_raw_parts(block_ptr.add(data_offset), snaplen);
                classifier.process(frame, wire_len);
                if next == 0 {
                    break;
                }
                offset += next;
            }
            hdr.block_status = libc::TP_STATUS_KERNEL;
        }
        fence(Ordering::Release);
        true
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        if !self.base.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}

async fn wait_for_read(fd: RawFd) -> Result<()> {
    use tokio::io::unix::AsyncFd;

    let async_fd = AsyncFd::new(fd).context("failed to create AsyncFd")?;
    // Bounded so a quiet interface still observes shutdown.
    let readable = time::timeout(Duration::from_millis(500), async_fd.readable()).await;
    match readable {
        Ok(Ok(mut guard)) => {
            guard.clear_ready();
            Ok(())
        }
        Ok(Err(err)) => Err(err).context("failed to wait for socket readability"),
        Err(_elapsed) => Ok(()),
    }
}
