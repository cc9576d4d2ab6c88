use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use flowlens::{
    Clock, FlowClassifier, FlowKey, FlowTable, ManualClock, MonitoredPortSet, Outcome, Protocol,
    Verdict,
};

const SEC: u64 = 1_000_000_000;

fn frame(src: Ipv4Addr, dst_port: u16, protocol: Protocol, padded_len: usize) -> Vec<u8> {
    let l4_len = match protocol {
        Protocol::Tcp => 20,
        Protocol::Udp => 8,
    };
    let mut buf = vec![0u8; 14 + 20 + l4_len];
    buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    let ip = &mut buf[14..];
    ip[0] = 0x45;
    ip[9] = protocol as u8;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&[10, 0, 0, 254]);
    let l4 = &mut ip[20..];
    l4[0..2].copy_from_slice(&40_000u16.to_be_bytes());
    l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
    if buf.len() < padded_len {
        buf.resize(padded_len, 0);
    }
    buf
}

fn key(src: Ipv4Addr, port: u16, protocol: Protocol) -> FlowKey {
    FlowKey::new(u32::from(src), port, protocol)
}

fn classifier(
    ports: &[u16],
    capacity: usize,
) -> (FlowClassifier<ManualClock>, Arc<FlowTable>) {
    let set = Arc::new(MonitoredPortSet::new(16));
    for port in ports {
        set.insert(*port).unwrap();
    }
    let table = Arc::new(FlowTable::new(capacity));
    let classifier = FlowClassifier::with_clock(set, table.clone(), ManualClock::new(SEC));
    (classifier, table)
}

#[test]
fn least_recently_used_flow_is_evicted() {
    let (classifier, table) = classifier(&[443], 2);
    let a = Ipv4Addr::new(10, 0, 0, 1);
    let b = Ipv4Addr::new(10, 0, 0, 2);
    let c = Ipv4Addr::new(10, 0, 0, 3);

    for src in [a, b, a, c] {
        let packet = frame(src, 443, Protocol::Tcp, 100);
        assert_eq!(classifier.process(&packet, 100), Verdict::Pass);
        classifier.clock().advance(SEC);
    }

    assert_eq!(table.len(), 2);
    let info_a = table.get(&key(a, 443, Protocol::Tcp)).unwrap();
    assert_eq!((info_a.packets, info_a.bytes), (2, 200));
    let info_c = table.get(&key(c, 443, Protocol::Tcp)).unwrap();
    assert_eq!((info_c.packets, info_c.bytes), (1, 100));
    assert!(table.get(&key(b, 443, Protocol::Tcp)).is_none());
}

#[test]
fn udp_packet_creates_one_entry() {
    let (classifier, table) = classifier(&[53], 16);
    let src = Ipv4Addr::new(192, 168, 1, 20);
    let packet = frame(src, 53, Protocol::Udp, 60);
    assert_eq!(packet.len(), 60);

    classifier.process(&packet, packet.len() as u64);

    let entries: Vec<_> = table.iter().collect();
    assert_eq!(entries.len(), 1);
    let (flow, info) = entries[0];
    assert_eq!(flow, key(src, 53, Protocol::Udp));
    assert_eq!((info.packets, info.bytes), (1, 60));
    assert_eq!(info.last_seen_ns, SEC);
}

#[test]
fn unmonitored_port_leaves_table_empty() {
    let (classifier, table) = classifier(&[53], 16);
    let packet = frame(Ipv4Addr::new(10, 1, 1, 1), 8080, Protocol::Tcp, 0);

    assert_eq!(classifier.process(&packet, 1500), Verdict::Pass);
    assert!(table.is_empty());
    assert_eq!(classifier.stats().get(Outcome::Unmonitored), 1);
}

#[test]
fn truncated_packets_change_nothing() {
    let (classifier, table) = classifier(&[443], 16);
    let full = frame(Ipv4Addr::new(10, 1, 1, 1), 443, Protocol::Tcp, 0);

    for len in 0..full.len() {
        assert_eq!(classifier.process(&full[..len], len as u64), Verdict::Pass);
    }
    assert!(table.is_empty());
    assert_eq!(classifier.stats().get(Outcome::Malformed), full.len() as u64);
}

#[test]
fn protocols_are_separate_flows() {
    let (classifier, table) = classifier(&[53], 16);
    let src = Ipv4Addr::new(10, 2, 2, 2);
    classifier.process(&frame(src, 53, Protocol::Udp, 0), 70);
    classifier.process(&frame(src, 53, Protocol::Tcp, 0), 90);

    assert_eq!(table.len(), 2);
    assert_eq!(table.get(&key(src, 53, Protocol::Udp)).unwrap().bytes, 70);
    assert_eq!(table.get(&key(src, 53, Protocol::Tcp)).unwrap().bytes, 90);
}

#[test]
fn concurrent_packets_on_one_flow_are_all_counted() {
    let (classifier, table) = classifier(&[443], 1024);
    let classifier = Arc::new(classifier);
    let src = Ipv4Addr::new(172, 16, 0, 9);
    let packet = Arc::new(frame(src, 443, Protocol::Tcp, 0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let classifier = classifier.clone();
            let packet = packet.clone();
            thread::spawn(move || {
                for _ in 0..5_000 {
                    classifier.process(&packet, 64);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let info = table.get(&key(src, 443, Protocol::Tcp)).unwrap();
    assert_eq!(info.packets, 40_000);
    assert_eq!(info.bytes, 40_000 * 64);
    assert_eq!(table.len(), 1);
}

#[test]
fn last_seen_follows_the_latest_packet() {
    let (classifier, table) = classifier(&[22], 16);
    let src = Ipv4Addr::new(10, 9, 9, 9);
    let packet = frame(src, 22, Protocol::Tcp, 0);

    let mut previous = 0;
    for _ in 0..5 {
        classifier.process(&packet, 60);
        let seen = table.get(&key(src, 22, Protocol::Tcp)).unwrap().last_seen_ns;
        assert!(seen >= previous);
        assert_eq!(seen, classifier.clock().now_ns());
        previous = seen;
        classifier.clock().advance(SEC);
    }
}

#[test]
fn removing_a_port_keeps_existing_entries() {
    let (classifier, table) = classifier(&[53, 123], 16);
    let src = Ipv4Addr::new(10, 3, 3, 3);
    classifier.process(&frame(src, 53, Protocol::Udp, 0), 80);

    classifier.ports().replace([123]).unwrap();
    classifier.process(&frame(src, 53, Protocol::Udp, 0), 80);

    let info = table.get(&key(src, 53, Protocol::Udp)).unwrap();
    assert_eq!(info.packets, 1);
    assert_eq!(classifier.stats().get(Outcome::Unmonitored), 1);
}

#[test]
fn table_never_exceeds_capacity() {
    let (classifier, table) = classifier(&[80], 32);
    for i in 0..1_000u32 {
        let src = Ipv4Addr::from(0x0a00_0000 + i);
        classifier.process(&frame(src, 80, Protocol::Tcp, 0), 60);
        assert!(table.len() <= 32);
    }
    assert_eq!(table.len(), 32);
    assert_eq!(classifier.stats().get(Outcome::Tracked), 1_000);
}
