use core::net::Ipv4Addr;

use enc_net_stack::classify::{self as frames, MqttKind, TcpFlagKind};
use enc_net_stack::{
    classify, Identity, Intent, ManualTimer, NetworkStack, QueueTransport, StackConfig,
};
use enc_packetlib::packet::*;
use proptest::prelude::*;

const LOCAL: Identity = Identity {
    mac: MacAddr([0x02, 0x03, 0x04, 0x05, 0x06, 0x8d]),
    ip: Ipv4Addr::new(192, 168, 1, 141),
};

fn run_predicates(frame: &[u8]) {
    let _ = classify(frame, &LOCAL);
    let _ = frames::is_ipv4(frame);
    let _ = frames::is_unicast_to(frame, LOCAL.ip);
    let _ = frames::is_arp_request_to(frame, LOCAL.ip);
    let _ = frames::is_arp_response_to(frame, LOCAL.ip);
    let _ = frames::is_icmp_echo_request(frame);
    let _ = frames::is_udp(frame);
    let _ = frames::is_tcp(frame, LOCAL.mac, TcpFlagKind::SynAck);
    let _ = frames::is_tcp_reset(frame, LOCAL.mac);
    let _ = frames::tcp_payload_len(frame, LOCAL.mac);
    let _ = frames::is_mqtt(frame, LOCAL.mac, MqttKind::ConnAck);
    let _ = frames::is_mqtt_publish(frame, LOCAL.mac);
    let _ = frames::is_mqtt_puback(frame, LOCAL.mac);
    let _ = frames::is_mqtt_pubrec(frame, LOCAL.mac);
    let _ = frames::is_mqtt_pubrel(frame, LOCAL.mac);
    let _ = frames::is_mqtt_pubcomp(frame, LOCAL.mac);
}

/// PUBLISH from the broker to `LOCAL`, fully valid.
fn broker_publish() -> Vec<u8> {
    let broker = Ipv4Addr::new(192, 168, 1, 10);
    let tcp = TcpSegmentBuilder {
        src_port: 1883,
        dst_port: 1000,
        seq_number: 1,
        ack_number: 1,
        flags: TcpFlags::PSH | TcpFlags::ACK,
        window_size: 1024,
        options: &[],
    }
    .build_vec(broker, LOCAL.ip, &[0x30, 5, 0, 1, b'a', b'h', b'i'])
    .unwrap();
    let ip = Ipv4PacketBuilder {
        dscp_ecn: 0,
        identification: 3,
        dont_fragment: true,
        ttl: 64,
        protocol: IPPROTO_TCP,
        src_ip: broker,
        dst_ip: LOCAL.ip,
    }
    .build_vec(&tcp)
    .unwrap();
    EthernetFrameBuilder {
        dest_mac: LOCAL.mac,
        src_mac: MacAddr([0xaa; 6]),
        ethertype: EtherType::IPV4,
    }
    .build_vec(&ip)
    .unwrap()
}

#[test]
fn valid_publish_matches_only_its_predicates() {
    let frame = broker_publish();
    assert!(frames::is_ipv4(&frame));
    assert!(frames::is_unicast_to(&frame, LOCAL.ip));
    assert!(frames::is_tcp(&frame, LOCAL.mac, TcpFlagKind::PshAck));
    assert!(!frames::is_tcp(&frame, LOCAL.mac, TcpFlagKind::Ack));
    assert!(!frames::is_udp(&frame));
    assert_eq!(frames::is_mqtt_publish(&frame, LOCAL.mac), Some(7));
    assert_eq!(frames::is_mqtt_puback(&frame, LOCAL.mac), None);
    assert_eq!(frames::is_mqtt_publish(&frame, MacAddr([1; 6])), None);
}

#[test]
fn every_truncation_is_rejected_by_predicates() {
    let frame = broker_publish();
    for len in 0..frame.len() {
        let short = &frame[..len];
        assert!(!frames::is_ipv4(short), "len {len}");
        assert!(!frames::is_tcp(short, LOCAL.mac, TcpFlagKind::PshAck), "len {len}");
        assert_eq!(frames::is_mqtt_publish(short, LOCAL.mac), None, "len {len}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
        rng_seed: proptest::test_runner::RngSeed::Fixed(0x8d_0141),
        .. ProptestConfig::default()
    })]

    #[test]
    fn predicates_never_panic(data in proptest::collection::vec(any::<u8>(), 0..=1518)) {
        run_predicates(&data);
    }

    #[test]
    fn short_buffers_match_nothing(data in proptest::collection::vec(any::<u8>(), 0..14)) {
        prop_assert!(!frames::is_ipv4(&data));
        prop_assert!(!frames::is_arp_request_to(&data, LOCAL.ip));
        prop_assert!(!frames::is_icmp_echo_request(&data));
        prop_assert!(!frames::is_udp(&data));
        prop_assert!(!frames::is_tcp_reset(&data, LOCAL.mac));
        prop_assert_eq!(frames::mqtt_kind(&data, LOCAL.mac), None);
    }

    #[test]
    fn mutated_publish_never_panics(idx in 0usize..63, byte in any::<u8>()) {
        let mut frame = broker_publish();
        let idx = idx % frame.len();
        frame[idx] = byte;
        run_predicates(&frame);
    }

    #[test]
    fn stack_survives_arbitrary_frames(
        input in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..=128), 1..8),
    ) {
        let mut stack = NetworkStack::new(StackConfig {
            broker_ip: Ipv4Addr::new(192, 168, 1, 10),
            broker_mac: Some(MacAddr([0xaa; 6])),
            ..StackConfig::default()
        });
        stack.request(Intent::Connect).unwrap();
        let mut link = QueueTransport::new();
        for frame in input {
            link.push_rx(frame);
        }
        let timer = ManualTimer::new();
        let outcome = stack.poll(&mut link, &timer, ());
        prop_assert!(outcome.link_up);
    }
}
