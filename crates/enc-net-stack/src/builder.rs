use core::net::Ipv4Addr;

use enc_packetlib::packet::mqtt::{
    write_ack, write_empty, ConnectBuilder, PublishBuilder, SubscribeBuilder, UnsubscribeBuilder,
};
use enc_packetlib::packet::tcp::mss_option;
use enc_packetlib::packet::{
    ArpPacketBuilder, ControlPacketType, EtherType, EthernetFrame, EthernetFrameBuilder,
    IcmpEchoBuilder, Icmpv4Packet, Ipv4Packet, Ipv4PacketBuilder, MacAddr, PacketError, QoS,
    TcpFlags, TcpSegment, TcpSegmentBuilder, UdpPacket, UdpPacketBuilder, ARP_OP_REPLY,
    ARP_OP_REQUEST, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};

use crate::classify::{ArpInfo, Identity, UdpInfo};
use crate::session::ConnectionContext;

/// Room for a maximum-size frame plus a VLAN tag and FCS.
pub const TX_BUFFER_LEN: usize = 1522;

const IPV4_OFFSET: usize = EthernetFrame::HEADER_LEN;
const TRANSPORT_OFFSET: usize = IPV4_OFFSET + Ipv4Packet::MIN_HEADER_LEN;
const TCP_PAYLOAD_OFFSET: usize = TRANSPORT_OFFSET + TcpSegment::MIN_HEADER_LEN;
const UDP_PAYLOAD_OFFSET: usize = TRANSPORT_OFFSET + UdpPacket::HEADER_LEN;
const ICMP_PAYLOAD_OFFSET: usize = TRANSPORT_OFFSET + Icmpv4Packet::HEADER_LEN;

/// Remote end of a UDP exchange, as seen in the datagram that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPeer {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    /// Source port of the received datagram; replies are sent to it.
    pub port: u16,
    /// Destination port of the received datagram; replies are sent from it.
    pub local_port: u16,
}

impl From<&UdpInfo> for UdpPeer {
    fn from(info: &UdpInfo) -> Self {
        Self {
            mac: info.src_mac,
            ip: info.src_ip,
            port: info.src_port,
            local_port: info.dst_port,
        }
    }
}

/// A finished TCP frame and the sequence space it consumes.
#[derive(Debug)]
pub struct TcpFrame<'a> {
    pub frame: &'a [u8],
    /// Payload length plus one for each of SYN and FIN.
    pub seq_len: u32,
}

/// Owns the transmit buffer; every constructor overwrites it and returns the finished frame.
#[derive(Debug)]
pub struct FrameBuilder {
    buf: Vec<u8>,
    ipv4_ident: u16,
    ttl: u8,
    window: u16,
}

impl FrameBuilder {
    pub fn new(ttl: u8, window: u16) -> Self {
        Self {
            buf: vec![0u8; TX_BUFFER_LEN],
            ipv4_ident: 1,
            ttl,
            window,
        }
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    pub fn set_window(&mut self, window: u16) {
        self.window = window;
    }

    fn next_ipv4_ident(&mut self) -> u16 {
        let id = self.ipv4_ident;
        self.ipv4_ident = self.ipv4_ident.wrapping_add(1);
        id
    }

    /// Wraps `transport_len` bytes already at `TRANSPORT_OFFSET` in IPv4 and Ethernet headers.
    fn finish_ipv4(
        &mut self,
        dest_mac: MacAddr,
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        protocol: u8,
        transport_len: usize,
    ) -> Result<usize, PacketError> {
        let ip_len = Ipv4PacketBuilder {
            dscp_ecn: 0,
            identification: self.next_ipv4_ident(),
            dont_fragment: true,
            ttl: self.ttl,
            protocol,
            src_ip,
            dst_ip,
        }
        .write(&mut self.buf[IPV4_OFFSET..], transport_len)?;
        EthernetFrameBuilder {
            dest_mac,
            src_mac,
            ethertype: EtherType::IPV4,
        }
        .write(&mut self.buf, ip_len)
    }

    fn arp(
        &mut self,
        dest_mac: MacAddr,
        builder: ArpPacketBuilder,
    ) -> Result<&[u8], PacketError> {
        let arp_len = builder.write(&mut self.buf[IPV4_OFFSET..])?;
        let len = EthernetFrameBuilder {
            dest_mac,
            src_mac: builder.sender_mac,
            ethertype: EtherType::ARP,
        }
        .write(&mut self.buf, arp_len)?;
        Ok(&self.buf[..len])
    }

    /// 42-byte reply telling `request.sender` our MAC.
    pub fn arp_reply(&mut self, local: &Identity, request: &ArpInfo) -> Result<&[u8], PacketError> {
        self.arp(
            request.sender_mac,
            ArpPacketBuilder {
                opcode: ARP_OP_REPLY,
                sender_mac: local.mac,
                sender_ip: local.ip,
                target_mac: request.sender_mac,
                target_ip: request.sender_ip,
            },
        )
    }

    /// Broadcast who-has for `target_ip`.
    pub fn arp_request(
        &mut self,
        local: &Identity,
        target_ip: Ipv4Addr,
    ) -> Result<&[u8], PacketError> {
        self.arp(
            MacAddr::BROADCAST,
            ArpPacketBuilder {
                opcode: ARP_OP_REQUEST,
                sender_mac: local.mac,
                sender_ip: local.ip,
                target_mac: MacAddr::UNSPECIFIED,
                target_ip,
            },
        )
    }

    /// Echo reply to the echo request in `request`, with addressing swapped.
    pub fn icmp_echo_reply(
        &mut self,
        local: &Identity,
        request: &[u8],
    ) -> Result<&[u8], PacketError> {
        let eth = EthernetFrame::parse(request)?;
        let ip = Ipv4Packet::parse(eth.payload())?;
        if ip.protocol() != IPPROTO_ICMP {
            return Err(PacketError::Malformed("not an ICMP packet"));
        }
        let icmp = Icmpv4Packet::parse(ip.payload())?;
        if !icmp.is_echo_request() {
            return Err(PacketError::Malformed("not an ICMP echo request"));
        }
        let data = icmp.payload();
        let end = ICMP_PAYLOAD_OFFSET + data.len();
        if end > self.buf.len() {
            return Err(PacketError::BufferTooSmall {
                needed: end,
                actual: self.buf.len(),
            });
        }
        self.buf[ICMP_PAYLOAD_OFFSET..end].copy_from_slice(data);
        let icmp_len =
            IcmpEchoBuilder::reply_to(&icmp).write(&mut self.buf[TRANSPORT_OFFSET..], data.len())?;
        let len = self.finish_ipv4(
            eth.src_mac(),
            local.mac,
            local.ip,
            ip.src_ip(),
            IPPROTO_ICMP,
            icmp_len,
        )?;
        Ok(&self.buf[..len])
    }

    /// Reply to a received datagram: sent from its destination port to its source port.
    pub fn udp_response(
        &mut self,
        local: &Identity,
        request: &UdpInfo,
        payload: &[u8],
    ) -> Result<&[u8], PacketError> {
        self.udp_datagram(local, &UdpPeer::from(request), payload)
    }

    /// Datagram to a peer remembered from an earlier exchange.
    pub fn udp_datagram(
        &mut self,
        local: &Identity,
        peer: &UdpPeer,
        payload: &[u8],
    ) -> Result<&[u8], PacketError> {
        let end = UDP_PAYLOAD_OFFSET + payload.len();
        if end > self.buf.len() {
            return Err(PacketError::BufferTooSmall {
                needed: end,
                actual: self.buf.len(),
            });
        }
        self.buf[UDP_PAYLOAD_OFFSET..end].copy_from_slice(payload);
        let udp_len = UdpPacketBuilder {
            src_port: peer.local_port,
            dst_port: peer.port,
        }
        .write(local.ip, peer.ip, &mut self.buf[TRANSPORT_OFFSET..], payload.len())?;
        let len = self.finish_ipv4(peer.mac, local.mac, local.ip, peer.ip, IPPROTO_UDP, udp_len)?;
        Ok(&self.buf[..len])
    }

    /// TCP segment for `conn` around `payload_len` bytes already at the payload offset for
    /// `options`.
    fn tcp_segment(
        &mut self,
        conn: &ConnectionContext,
        flags: TcpFlags,
        options: &[u8],
        payload_len: usize,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let dest_mac = conn
            .remote_mac
            .ok_or(PacketError::Malformed("peer MAC not resolved"))?;
        let ack_number = if flags.contains(TcpFlags::ACK) {
            conn.rcv_nxt
        } else {
            0
        };
        let seg_len = TcpSegmentBuilder {
            src_port: conn.local_port,
            dst_port: conn.remote_port,
            seq_number: conn.snd_nxt,
            ack_number,
            flags,
            window_size: self.window,
            options,
        }
        .write(
            conn.local_ip,
            conn.remote_ip,
            &mut self.buf[TRANSPORT_OFFSET..],
            payload_len,
        )?;
        let len = self.finish_ipv4(
            dest_mac,
            conn.local_mac,
            conn.local_ip,
            conn.remote_ip,
            IPPROTO_TCP,
            seg_len,
        )?;
        let mut seq_len = payload_len as u32;
        if flags.contains(TcpFlags::SYN) {
            seq_len += 1;
        }
        if flags.contains(TcpFlags::FIN) {
            seq_len += 1;
        }
        Ok(TcpFrame {
            frame: &self.buf[..len],
            seq_len,
        })
    }

    fn mqtt_segment(
        &mut self,
        conn: &ConnectionContext,
        packet_len: usize,
    ) -> Result<TcpFrame<'_>, PacketError> {
        self.tcp_segment(conn, TcpFlags::PSH | TcpFlags::ACK, &[], packet_len)
    }

    /// SYN from `conn.snd_nxt` advertising `mss`.
    pub fn tcp_syn(
        &mut self,
        conn: &ConnectionContext,
        mss: u16,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let options = mss_option(mss);
        self.tcp_segment(conn, TcpFlags::SYN, &options, 0)
    }

    pub fn tcp_ack(&mut self, conn: &ConnectionContext) -> Result<TcpFrame<'_>, PacketError> {
        self.tcp_segment(conn, TcpFlags::ACK, &[], 0)
    }

    /// PSH|ACK carrying the MQTT CONNECT (clean session).
    pub fn tcp_push_ack(
        &mut self,
        conn: &ConnectionContext,
        client_id: &str,
        keep_alive_secs: u16,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = ConnectBuilder {
            client_id,
            keep_alive_secs,
            clean_session: true,
        }
        .write(&mut self.buf[TCP_PAYLOAD_OFFSET..])?;
        self.mqtt_segment(conn, len)
    }

    pub fn tcp_fin(&mut self, conn: &ConnectionContext) -> Result<TcpFrame<'_>, PacketError> {
        self.tcp_segment(conn, TcpFlags::FIN | TcpFlags::ACK, &[], 0)
    }

    pub fn mqtt_publish(
        &mut self,
        conn: &ConnectionContext,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        packet_id: u16,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = PublishBuilder {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            packet_id,
        }
        .write(&mut self.buf[TCP_PAYLOAD_OFFSET..])?;
        self.mqtt_segment(conn, len)
    }

    pub fn mqtt_subscribe(
        &mut self,
        conn: &ConnectionContext,
        packet_id: u16,
        topic: &str,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = SubscribeBuilder {
            packet_id,
            topic,
            requested_qos: QoS::AtMostOnce,
        }
        .write(&mut self.buf[TCP_PAYLOAD_OFFSET..])?;
        self.mqtt_segment(conn, len)
    }

    pub fn mqtt_unsubscribe(
        &mut self,
        conn: &ConnectionContext,
        packet_id: u16,
        topic: &str,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = UnsubscribeBuilder { packet_id, topic }
            .write(&mut self.buf[TCP_PAYLOAD_OFFSET..])?;
        self.mqtt_segment(conn, len)
    }

    /// PUBACK, PUBREC, PUBREL or PUBCOMP for `packet_id`.
    pub fn mqtt_ack(
        &mut self,
        conn: &ConnectionContext,
        packet_type: ControlPacketType,
        packet_id: u16,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = write_ack(&mut self.buf[TCP_PAYLOAD_OFFSET..], packet_type, packet_id)?;
        self.mqtt_segment(conn, len)
    }

    pub fn mqtt_ping_request(
        &mut self,
        conn: &ConnectionContext,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = write_empty(&mut self.buf[TCP_PAYLOAD_OFFSET..], ControlPacketType::PingReq)?;
        self.mqtt_segment(conn, len)
    }

    pub fn mqtt_disconnect(
        &mut self,
        conn: &ConnectionContext,
    ) -> Result<TcpFrame<'_>, PacketError> {
        let len = write_empty(&mut self.buf[TCP_PAYLOAD_OFFSET..], ControlPacketType::Disconnect)?;
        self.mqtt_segment(conn, len)
    }
}
