#![no_std]
#![no_main]

mod maps;

use core::ptr::{addr_of_mut, read_unaligned};
use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::bindings::{BPF_NOEXIST, TC_ACT_OK, xdp_action};
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::macros::{classifier, xdp};
use aya_ebpf::programs::{TcContext, XdpContext};
use aya_log_ebpf::debug;
use flowlens_common::{FlowInfo, FlowKey, FlowStore, Outcome, PROTO_TCP, PROTO_UDP, track_flow};

use maps::{CLASSIFIER_STATS, FLOW_STATS, MONITORED_PORTS};

const ETH_HDR_SIZE: usize = 14;
const H_PROTO_OFFSET: usize = 12;
const ETH_P_IPV4: u16 = 0x0800;
const IPV4_MIN_HEADER_BYTES: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SADDR_OFFSET: usize = 12;
const TCP_HEADER_BYTES: usize = 20;
const UDP_HEADER_BYTES: usize = 8;
const L4_DEST_OFFSET: usize = 2;

#[classifier]
pub fn flow_monitor(ctx: TcContext) -> i32 {
    let outcome = classify(
        ctx.data() as *const u8,
        ctx.data_end() as *const u8,
        ctx.len() as u64,
    );
    if outcome == Outcome::Untracked {
        debug!(&ctx, "flow_monitor: flow table rejected new entry");
    }
    record_outcome(outcome);
    TC_ACT_OK
}

#[xdp]
pub fn flow_monitor_xdp(ctx: XdpContext) -> u32 {
    let data = ctx.data() as *const u8;
    let data_end = ctx.data_end() as *const u8;
    let pkt_len = (data_end as usize).saturating_sub(data as usize) as u64;
    record_outcome(classify(data, data_end, pkt_len));
    xdp_action::XDP_PASS
}

#[inline(always)]
fn classify(data: *const u8, data_end: *const u8, pkt_len: u64) -> Outcome {
    let key = match parse_flow_key(data, data_end) {
        Ok(key) => key,
        Err(outcome) => return outcome,
    };

    if MONITORED_PORTS.get_ptr(&key.dst_port).is_none() {
        return Outcome::Unmonitored;
    }

    track_flow(&KernelFlows, &key, pkt_len, || unsafe { bpf_ktime_get_ns() })
}

// Every read below is preceded by a check against data_end; the verifier
// rejects the program otherwise.
#[inline(always)]
fn parse_flow_key(data: *const u8, data_end: *const u8) -> Result<FlowKey, Outcome> {
    if unsafe { data.add(ETH_HDR_SIZE) } > data_end {
        return Err(Outcome::Malformed);
    }

    let h_proto = unsafe {
        let p = data.add(H_PROTO_OFFSET) as *const u16;
        u16::from_be(read_unaligned(p))
    };
    if h_proto != ETH_P_IPV4 {
        return Err(Outcome::Unsupported);
    }

    let ip_start = unsafe { data.add(ETH_HDR_SIZE) };
    if unsafe { ip_start.add(IPV4_MIN_HEADER_BYTES) } > data_end {
        return Err(Outcome::Malformed);
    }

    let ihl_words = (unsafe { *ip_start } & 0x0f) as usize;
    if ihl_words < 5 {
        return Err(Outcome::Malformed);
    }
    let header_len = ihl_words * 4;
    if unsafe { ip_start.add(header_len) } > data_end {
        return Err(Outcome::Malformed);
    }

    let proto = unsafe { *ip_start.add(IPV4_PROTO_OFFSET) };
    let src_addr = unsafe {
        let p = ip_start.add(IPV4_SADDR_OFFSET) as *const u32;
        u32::from_be(read_unaligned(p))
    };

    let l4_len = match proto {
        PROTO_TCP => TCP_HEADER_BYTES,
        PROTO_UDP => UDP_HEADER_BYTES,
        _ => return Err(Outcome::Unsupported),
    };
    let l4_start = unsafe { ip_start.add(header_len) };
    if unsafe { l4_start.add(l4_len) } > data_end {
        return Err(Outcome::Malformed);
    }

    let dst_port = unsafe {
        let p = l4_start.add(L4_DEST_OFFSET) as *const u16;
        u16::from_be(read_unaligned(p))
    };

    Ok(FlowKey {
        src_addr,
        dst_port,
        proto,
        pad: 0,
    })
}

struct KernelFlows;

impl FlowStore for KernelFlows {
    #[inline(always)]
    fn bump(&self, key: &FlowKey, bytes: u64) -> bool {
        let Some(info) = FLOW_STATS.get_ptr_mut(key) else {
            return false;
        };
        // Counters are atomic; the timestamp store is a separate,
        // unsynchronised write.
        unsafe {
            AtomicU64::from_ptr(addr_of_mut!((*info).packets)).fetch_add(1, Ordering::Relaxed);
            AtomicU64::from_ptr(addr_of_mut!((*info).bytes)).fetch_add(bytes, Ordering::Relaxed);
            (*info).last_seen_ns = bpf_ktime_get_ns();
        }
        true
    }

    #[inline(always)]
    fn create(&self, key: &FlowKey, info: &FlowInfo) -> bool {
        FLOW_STATS.insert(key, info, BPF_NOEXIST as u64).is_ok()
    }
}

fn record_outcome(outcome: Outcome) {
    if let Some(ptr) = CLASSIFIER_STATS.get_ptr_mut(outcome.index()) {
        unsafe {
            *ptr = (*ptr).wrapping_add(1);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
