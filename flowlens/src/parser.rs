use std::net::Ipv4Addr;

use flowlens_common::{FlowKey, Outcome, PROTO_TCP, PROTO_UDP, Protocol};
use thiserror::Error;

pub const ETH_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const ETH_P_IPV4: u16 = 0x0800;
const ETHER_TYPE_OFFSET: usize = 12;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SADDR_OFFSET: usize = 12;
const L4_DEST_OFFSET: usize = 2;

/// Fields the pipeline needs from a validated packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PacketHeaders {
    pub src_addr: Ipv4Addr,
    pub protocol: Protocol,
    pub dst_port: u16,
}

impl PacketHeaders {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(u32::from(self.src_addr), self.dst_port, self.protocol)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layer {
    Ethernet,
    Ipv4,
    Tcp,
    Udp,
}

/// Why a packet is not applicable for tracking.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum Skip {
    #[error("buffer ends inside the {0:?} header")]
    Truncated(Layer),
    #[error("ether type {0:#06x} is not IPv4")]
    NotIpv4(u16),
    #[error("IPv4 header length of {0} words is below the minimum of 5")]
    BadHeaderLength(u8),
    #[error("IP protocol {0} is neither TCP nor UDP")]
    UnsupportedProtocol(u8),
}

impl Skip {
    pub fn outcome(&self) -> Outcome {
        match self {
            Skip::Truncated(_) | Skip::BadHeaderLength(_) => Outcome::Malformed,
            Skip::NotIpv4(_) | Skip::UnsupportedProtocol(_) => Outcome::Unsupported,
        }
    }
}

pub fn parse(packet: &[u8]) -> Result<PacketHeaders, Skip> {
    if packet.len() < ETH_HEADER_LEN {
        return Err(Skip::Truncated(Layer::Ethernet));
    }
    let ether_type =
        read_u16(packet, ETHER_TYPE_OFFSET).ok_or(Skip::Truncated(Layer::Ethernet))?;
    if ether_type != ETH_P_IPV4 {
        return Err(Skip::NotIpv4(ether_type));
    }

    let ip = &packet[ETH_HEADER_LEN..];
    if ip.len() < IPV4_MIN_HEADER_LEN {
        return Err(Skip::Truncated(Layer::Ipv4));
    }
    let ihl_words = ip[0] & 0x0f;
    if ihl_words < 5 {
        return Err(Skip::BadHeaderLength(ihl_words));
    }
    let header_len = ihl_words as usize * 4;
    if ip.len() < header_len {
        return Err(Skip::Truncated(Layer::Ipv4));
    }

    let proto = ip[IPV4_PROTO_OFFSET];
    let src_addr = read_u32(ip, IPV4_SADDR_OFFSET).ok_or(Skip::Truncated(Layer::Ipv4))?;

    let (protocol, layer, l4_len) = match proto {
        PROTO_TCP => (Protocol::Tcp, Layer::Tcp, TCP_HEADER_LEN),
        PROTO_UDP => (Protocol::Udp, Layer::Udp, UDP_HEADER_LEN),
        other => return Err(Skip::UnsupportedProtocol(other)),
    };

    let l4 = &ip[header_len..];
    if l4.len() < l4_len {
        return Err(Skip::Truncated(layer));
    }
    let dst_port = read_u16(l4, L4_DEST_OFFSET).ok_or(Skip::Truncated(layer))?;

    Ok(PacketHeaders {
        src_addr: Ipv4Addr::from(src_addr),
        protocol,
        dst_port,
    })
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    let bytes = buf.get(offset..end)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes = buf.get(offset..end)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
