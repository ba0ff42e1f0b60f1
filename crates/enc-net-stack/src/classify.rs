//! Frame classification.
//!
//! Every function here is a pure read of the received bytes: nothing is byte-swapped in place and
//! calling a predicate twice on the same buffer always gives the same answer. A buffer too short
//! for the header a predicate needs simply fails the predicate.

use core::net::Ipv4Addr;

use enc_packetlib::packet::{
    ArpPacket, ControlPacketType, EtherType, EthernetFrame, Icmpv4Packet, Ipv4Packet, MacAddr,
    MqttPacket, TcpFlags, TcpSegment, UdpPacket, ARP_OP_REPLY, ARP_OP_REQUEST, IPPROTO_ICMP,
    IPPROTO_TCP, IPPROTO_UDP,
};

/// Local addressing the classifier compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

/// Why a frame addressed to us was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// A header claims more bytes than the frame holds.
    MalformedFrame,
    ChecksumMismatch,
    /// Source MAC, IP or port differs from the session peer.
    UnexpectedPeer,
    /// Valid frame that the current session state has no use for.
    ProtocolStateMismatch,
}

/// Exact TCP flag combinations the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlagKind {
    Syn,
    SynAck,
    Ack,
    PshAck,
    Fin,
    FinAck,
}

impl TcpFlagKind {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x02 => Some(Self::Syn),
            0x12 => Some(Self::SynAck),
            0x10 => Some(Self::Ack),
            0x18 => Some(Self::PshAck),
            0x01 => Some(Self::Fin),
            0x11 => Some(Self::FinAck),
            _ => None,
        }
    }

    pub fn flags(self) -> TcpFlags {
        match self {
            Self::Syn => TcpFlags::SYN,
            Self::SynAck => TcpFlags::SYN | TcpFlags::ACK,
            Self::Ack => TcpFlags::ACK,
            Self::PshAck => TcpFlags::PSH | TcpFlags::ACK,
            Self::Fin => TcpFlags::FIN,
            Self::FinAck => TcpFlags::FIN | TcpFlags::ACK,
        }
    }
}

/// MQTT packets the client can receive, keyed on the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttKind {
    ConnAck,
    /// Any `0x3x` byte; QoS, retain and dup bits are ignored.
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    SubAck,
    UnsubAck,
    PingResp,
}

impl MqttKind {
    pub fn from_first_byte(byte: u8) -> Option<Self> {
        if byte & 0xf0 == 0x30 {
            return Some(Self::Publish);
        }
        match byte {
            0x20 => Some(Self::ConnAck),
            0x40 => Some(Self::PubAck),
            0x50 => Some(Self::PubRec),
            0x62 => Some(Self::PubRel),
            0x70 => Some(Self::PubComp),
            0x90 => Some(Self::SubAck),
            0xb0 => Some(Self::UnsubAck),
            0xd0 => Some(Self::PingResp),
            _ => None,
        }
    }

    pub fn packet_type(self) -> ControlPacketType {
        match self {
            Self::ConnAck => ControlPacketType::ConnAck,
            Self::Publish => ControlPacketType::Publish,
            Self::PubAck => ControlPacketType::PubAck,
            Self::PubRec => ControlPacketType::PubRec,
            Self::PubRel => ControlPacketType::PubRel,
            Self::PubComp => ControlPacketType::PubComp,
            Self::SubAck => ControlPacketType::SubAck,
            Self::UnsubAck => ControlPacketType::UnsubAck,
            Self::PingResp => ControlPacketType::PingResp,
        }
    }
}

fn ipv4_packet(frame: &[u8]) -> Option<Ipv4Packet<'_>> {
    let eth = EthernetFrame::parse(frame).ok()?;
    if eth.ethertype() != EtherType::IPV4 {
        return None;
    }
    let ip = Ipv4Packet::parse(eth.payload()).ok()?;
    ip.checksum_valid().then_some(ip)
}

fn arp_packet(frame: &[u8]) -> Option<ArpPacket<'_>> {
    let eth = EthernetFrame::parse(frame).ok()?;
    if eth.ethertype() != EtherType::ARP {
        return None;
    }
    ArpPacket::parse(eth.payload()).ok()
}

/// IPv4 frame with a valid header checksum.
pub fn is_ipv4(frame: &[u8]) -> bool {
    ipv4_packet(frame).is_some()
}

pub fn is_unicast_to(frame: &[u8], ip: Ipv4Addr) -> bool {
    ipv4_packet(frame).is_some_and(|p| p.dst_ip() == ip)
}

pub fn is_arp_request_to(frame: &[u8], ip: Ipv4Addr) -> bool {
    arp_packet(frame).is_some_and(|a| a.opcode() == ARP_OP_REQUEST && a.target_ip() == ip)
}

pub fn is_arp_response_to(frame: &[u8], ip: Ipv4Addr) -> bool {
    arp_packet(frame).is_some_and(|a| a.opcode() == ARP_OP_REPLY && a.target_ip() == ip)
}

pub fn is_icmp_echo_request(frame: &[u8]) -> bool {
    ipv4_packet(frame)
        .filter(|p| p.protocol() == IPPROTO_ICMP)
        .and_then(|p| Icmpv4Packet::parse(p.payload()).ok())
        .is_some_and(|icmp| icmp.is_echo_request())
}

/// UDP datagram whose checksum (when present) matches the pseudo-header.
pub fn is_udp(frame: &[u8]) -> bool {
    ipv4_packet(frame)
        .filter(|p| p.protocol() == IPPROTO_UDP)
        .is_some_and(|p| {
            UdpPacket::parse(p.payload())
                .is_ok_and(|udp| udp.checksum_valid_ipv4(p.src_ip(), p.dst_ip()))
        })
}

fn tcp_segment(frame: &[u8], local_mac: MacAddr) -> Option<(Ipv4Packet<'_>, TcpSegment<'_>)> {
    let eth = EthernetFrame::parse(frame).ok()?;
    if eth.dest_mac() != local_mac {
        return None;
    }
    let ip = ipv4_packet(frame)?;
    if ip.protocol() != IPPROTO_TCP {
        return None;
    }
    let tcp = TcpSegment::parse(ip.payload()).ok()?;
    Some((ip, tcp))
}

/// TCP segment addressed to `local_mac` whose flag byte is exactly `kind`.
pub fn is_tcp(frame: &[u8], local_mac: MacAddr, kind: TcpFlagKind) -> bool {
    tcp_segment(frame, local_mac)
        .is_some_and(|(_, tcp)| TcpFlagKind::from_bits(tcp.flags().bits()) == Some(kind))
}

pub fn is_tcp_reset(frame: &[u8], local_mac: MacAddr) -> bool {
    tcp_segment(frame, local_mac).is_some_and(|(_, tcp)| tcp.flags().contains(TcpFlags::RST))
}

/// TCP payload length derived from the IP and TCP headers (`total − ihl·4 − offset·4`).
pub fn tcp_payload_len(frame: &[u8], local_mac: MacAddr) -> Option<usize> {
    let (ip, tcp) = tcp_segment(frame, local_mac)?;
    Some(ip.total_len() - ip.header_len() - tcp.header_len())
}

pub fn mqtt_kind(frame: &[u8], local_mac: MacAddr) -> Option<MqttKind> {
    let (_, tcp) = tcp_segment(frame, local_mac)?;
    MqttKind::from_first_byte(*tcp.payload().first()?)
}

pub fn is_mqtt(frame: &[u8], local_mac: MacAddr, kind: MqttKind) -> bool {
    mqtt_kind(frame, local_mac) == Some(kind)
}

fn publish_family(frame: &[u8], local_mac: MacAddr, kind: MqttKind) -> Option<usize> {
    if mqtt_kind(frame, local_mac)? != kind {
        return None;
    }
    tcp_payload_len(frame, local_mac)
}

/// PUBLISH of any QoS; yields the TCP payload length.
pub fn is_mqtt_publish(frame: &[u8], local_mac: MacAddr) -> Option<usize> {
    publish_family(frame, local_mac, MqttKind::Publish)
}

pub fn is_mqtt_puback(frame: &[u8], local_mac: MacAddr) -> Option<usize> {
    publish_family(frame, local_mac, MqttKind::PubAck)
}

pub fn is_mqtt_pubrec(frame: &[u8], local_mac: MacAddr) -> Option<usize> {
    publish_family(frame, local_mac, MqttKind::PubRec)
}

pub fn is_mqtt_pubrel(frame: &[u8], local_mac: MacAddr) -> Option<usize> {
    publish_family(frame, local_mac, MqttKind::PubRel)
}

pub fn is_mqtt_pubcomp(frame: &[u8], local_mac: MacAddr) -> Option<usize> {
    publish_family(frame, local_mac, MqttKind::PubComp)
}

/// Decoded fields of an ARP packet addressed to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpInfo {
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpInfo {
    pub src_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Payload location within the frame, bounded by the declared UDP length.
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub src_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    /// `None` when the flag byte is not one of the exact combinations in [`TcpFlagKind`].
    pub kind: Option<TcpFlagKind>,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl TcpInfo {
    pub fn payload<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[self.payload_offset..self.payload_offset + self.payload_len]
    }
}

/// Single tag for a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    ArpRequest(ArpInfo),
    ArpReply(ArpInfo),
    IcmpEchoRequest,
    Udp(UdpInfo),
    Tcp(TcpInfo),
    Dropped(DropReason),
    /// Not addressed to us or not a protocol we speak.
    Other,
}

pub fn classify(frame: &[u8], identity: &Identity) -> FrameKind {
    let Ok(eth) = EthernetFrame::parse(frame) else {
        return FrameKind::Dropped(DropReason::MalformedFrame);
    };
    match eth.ethertype() {
        EtherType::ARP => classify_arp(eth.payload(), identity),
        EtherType::IPV4 => classify_ipv4(&eth, identity),
        _ => FrameKind::Other,
    }
}

fn classify_arp(payload: &[u8], identity: &Identity) -> FrameKind {
    let Ok(arp) = ArpPacket::parse(payload) else {
        return FrameKind::Dropped(DropReason::MalformedFrame);
    };
    if arp.target_ip() != identity.ip {
        return FrameKind::Other;
    }
    let info = ArpInfo {
        sender_mac: arp.sender_mac(),
        sender_ip: arp.sender_ip(),
    };
    match arp.opcode() {
        ARP_OP_REQUEST => FrameKind::ArpRequest(info),
        ARP_OP_REPLY => FrameKind::ArpReply(info),
        _ => FrameKind::Other,
    }
}

fn classify_ipv4(eth: &EthernetFrame<'_>, identity: &Identity) -> FrameKind {
    let Ok(ip) = Ipv4Packet::parse(eth.payload()) else {
        return FrameKind::Dropped(DropReason::MalformedFrame);
    };
    if ip.dst_ip() != identity.ip {
        return FrameKind::Other;
    }
    if !ip.checksum_valid() {
        return FrameKind::Dropped(DropReason::ChecksumMismatch);
    }
    let transport_offset = EthernetFrame::HEADER_LEN + ip.header_len();

    match ip.protocol() {
        IPPROTO_ICMP => match Icmpv4Packet::parse(ip.payload()) {
            Ok(icmp) if icmp.is_echo_request() => FrameKind::IcmpEchoRequest,
            Ok(_) => FrameKind::Other,
            Err(_) => FrameKind::Dropped(DropReason::MalformedFrame),
        },
        IPPROTO_UDP => {
            let Ok(udp) = UdpPacket::parse(ip.payload()) else {
                return FrameKind::Dropped(DropReason::MalformedFrame);
            };
            if !udp.checksum_valid_ipv4(ip.src_ip(), ip.dst_ip()) {
                return FrameKind::Dropped(DropReason::ChecksumMismatch);
            }
            FrameKind::Udp(UdpInfo {
                src_mac: eth.src_mac(),
                src_ip: ip.src_ip(),
                src_port: udp.src_port(),
                dst_port: udp.dst_port(),
                payload_offset: transport_offset + UdpPacket::HEADER_LEN,
                payload_len: udp.payload().len(),
            })
        }
        IPPROTO_TCP => {
            if eth.dest_mac() != identity.mac {
                return FrameKind::Other;
            }
            let Ok(tcp) = TcpSegment::parse(ip.payload()) else {
                return FrameKind::Dropped(DropReason::MalformedFrame);
            };
            if !tcp.checksum_valid_ipv4(ip.src_ip(), ip.dst_ip()) {
                return FrameKind::Dropped(DropReason::ChecksumMismatch);
            }
            FrameKind::Tcp(TcpInfo {
                src_mac: eth.src_mac(),
                src_ip: ip.src_ip(),
                src_port: tcp.src_port(),
                dst_port: tcp.dst_port(),
                seq: tcp.seq_number(),
                ack: tcp.ack_number(),
                flags: tcp.flags(),
                kind: TcpFlagKind::from_bits(tcp.flags().bits()),
                payload_offset: transport_offset + tcp.header_len(),
                payload_len: tcp.payload().len(),
            })
        }
        _ => FrameKind::Other,
    }
}
