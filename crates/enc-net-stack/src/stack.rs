use core::net::Ipv4Addr;
use core::time::Duration;

use enc_packetlib::packet::mqtt::{ConnAck, Publish, SubAck, MAX_REMAINING_LEN};
use enc_packetlib::packet::{ControlPacketType, MacAddr, MqttPacket, PacketError, QoS, TcpFlags};
use tracing::{debug, trace, warn};

use crate::builder::{FrameBuilder, TcpFrame, UdpPeer, TX_BUFFER_LEN};
use crate::classify::{
    classify, DropReason, FrameKind, Identity, MqttKind, TcpFlagKind, TcpInfo, UdpInfo,
};
use crate::config::{ClientId, PersistedConfig, StackConfig};
use crate::registry::{SubscriptionEntry, SubscriptionTable};
use crate::session::{
    ConnectionContext, Intent, MqttOpState, Payload, PublishProgress, PublishStage, SessionStatus,
    TcpState,
};
use crate::timer::Timer;
use crate::transport::LinkTransport;
use crate::StackError;

/// Application message delivered by the broker.
#[derive(Debug, Clone, Copy)]
pub struct InboundPublish<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<u16>,
}

/// UDP datagram addressed to the local IP.
#[derive(Debug, Clone, Copy)]
pub struct InboundDatagram<'a> {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Exactly the declared UDP payload.
    pub payload: &'a [u8],
}

/// What the application wants done in response to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reaction {
    #[default]
    None,
    /// Queued as if passed to [`NetworkStack::request`].
    Publish(Intent),
    /// Datagram to the most recent UDP peer.
    UdpReply(Payload),
}

pub trait MessageHandler {
    fn on_publish(&mut self, _publish: &InboundPublish<'_>) -> Reaction {
        Reaction::None
    }

    fn on_datagram(&mut self, _datagram: &InboundDatagram<'_>) -> Reaction {
        Reaction::None
    }
}

impl MessageHandler for () {}

impl<T: MessageHandler + ?Sized> MessageHandler for &mut T {
    fn on_publish(&mut self, publish: &InboundPublish<'_>) -> Reaction {
        <T as MessageHandler>::on_publish(&mut **self, publish)
    }

    fn on_datagram(&mut self, datagram: &InboundDatagram<'_>) -> Reaction {
        <T as MessageHandler>::on_datagram(&mut **self, datagram)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub malformed: u64,
    pub checksum_mismatch: u64,
    pub unexpected_peer: u64,
    pub state_mismatch: u64,
    pub tx_failures: u64,
    pub rx_overflows: u64,
    pub timeouts: u64,
    pub resets: u64,
}

impl StackStats {
    fn record_drop(&mut self, reason: DropReason) {
        let counter = match reason {
            DropReason::MalformedFrame => &mut self.malformed,
            DropReason::ChecksumMismatch => &mut self.checksum_mismatch,
            DropReason::UnexpectedPeer => &mut self.unexpected_peer,
            DropReason::ProtocolStateMismatch => &mut self.state_mismatch,
        };
        *counter += 1;
    }
}

/// Result of one [`NetworkStack::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollOutcome {
    pub link_up: bool,
    /// The controller reported (and cleared) a receive overrun.
    pub rx_overflow: bool,
    pub frames: usize,
}

/// Outbound TCP segment kinds, built from the current [`ConnectionContext`].
#[derive(Debug, Clone, Copy)]
enum Segment<'a> {
    Syn,
    Ack,
    Connect,
    Fin,
    Publish {
        topic: &'a str,
        payload: &'a [u8],
        qos: QoS,
        retain: bool,
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        topic: &'a str,
    },
    Unsubscribe {
        packet_id: u16,
        topic: &'a str,
    },
    MqttAck(ControlPacketType, u16),
    PingReq,
    Disconnect,
}

impl Segment<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Syn => "SYN",
            Self::Ack => "ACK",
            Self::Connect => "CONNECT",
            Self::Fin => "FIN",
            Self::Publish { .. } => "PUBLISH",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::MqttAck(ControlPacketType::PubAck, _) => "PUBACK",
            Self::MqttAck(ControlPacketType::PubRec, _) => "PUBREC",
            Self::MqttAck(ControlPacketType::PubRel, _) => "PUBREL",
            Self::MqttAck(ControlPacketType::PubComp, _) => "PUBCOMP",
            Self::MqttAck(_, _) => "MQTT ack",
            Self::PingReq => "PINGREQ",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

fn transmit<T: LinkTransport>(
    transport: &mut T,
    stats: &mut StackStats,
    what: &'static str,
    built: Result<&[u8], PacketError>,
) -> bool {
    let frame = match built {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, what, "failed to build frame");
            return false;
        }
    };
    trace!(what, len = frame.len(), "transmit");
    if transport.transmit_frame(frame) {
        stats.frames_sent += 1;
        true
    } else {
        stats.tx_failures += 1;
        warn!(what, "transmit aborted by controller");
        false
    }
}

#[derive(Debug)]
pub struct NetworkStack {
    cfg: StackConfig,
    conn: ConnectionContext,
    registry: SubscriptionTable,
    builder: FrameBuilder,
    rx: Vec<u8>,
    pending: Option<Intent>,
    disconnect_latched: bool,
    next_port: u16,
    next_packet_id: u16,
    udp_peer: Option<UdpPeer>,
    link_up: bool,
    stats: StackStats,
}

impl NetworkStack {
    pub fn new(cfg: StackConfig) -> Self {
        let builder = FrameBuilder::new(cfg.ttl, cfg.tcp_window);
        let mut stack = Self {
            conn: ConnectionContext::default(),
            registry: SubscriptionTable::new(),
            builder,
            rx: vec![0u8; TX_BUFFER_LEN],
            pending: None,
            disconnect_latched: false,
            next_port: cfg.ephemeral_ports.start,
            next_packet_id: 1,
            udp_peer: None,
            link_up: false,
            stats: StackStats::default(),
            cfg,
        };
        stack.sync_connection_identity();
        stack
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn stats(&self) -> StackStats {
        self.stats
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.registry.iter()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            link_up: self.link_up,
            tcp_state: self.conn.tcp_state,
            mqtt_state: self.conn.mqtt_state.clone(),
            mqtt_connected: self.conn.mqtt_connected,
            pending_intent: self.pending.is_some() || self.disconnect_latched,
        }
    }

    pub fn connection(&self) -> &ConnectionContext {
        &self.conn
    }

    fn identity(&self) -> Identity {
        Identity {
            mac: self.cfg.local_mac,
            ip: self.cfg.local_ip,
        }
    }

    /// Copies addressing from the config into the connection; takes effect on the next connect.
    fn sync_connection_identity(&mut self) {
        if !self.conn.is_closed() {
            return;
        }
        self.conn.local_mac = self.cfg.local_mac;
        self.conn.local_ip = self.cfg.local_ip;
        self.conn.remote_port = self.cfg.broker_port;
        if self.conn.remote_ip != self.cfg.broker_ip {
            self.conn.remote_ip = self.cfg.broker_ip;
            self.conn.remote_mac = None;
        }
        if let Some(mac) = self.cfg.broker_mac {
            self.conn.remote_mac = Some(mac);
        }
    }

    /// The resolved next hop may have changed; re-resolve on the next connect.
    fn forget_next_hop(&mut self) {
        if self.conn.is_closed() {
            self.conn.remote_mac = None;
            self.conn.arp_requested_at = None;
            self.sync_connection_identity();
        }
    }

    pub fn set_local_identity(&mut self, mac: MacAddr, ip: Ipv4Addr, subnet_mask: Ipv4Addr) {
        self.cfg.local_mac = mac;
        self.cfg.local_ip = ip;
        self.cfg.subnet_mask = subnet_mask;
        self.forget_next_hop();
    }

    pub fn set_gateway(&mut self, gateway_ip: Ipv4Addr) {
        self.cfg.gateway_ip = gateway_ip;
        self.forget_next_hop();
    }

    pub fn set_broker(&mut self, ip: Ipv4Addr, port: u16) {
        self.cfg.broker_ip = ip;
        self.cfg.broker_port = port;
        self.sync_connection_identity();
    }

    pub fn set_broker_mac(&mut self, mac: Option<MacAddr>) {
        self.cfg.broker_mac = mac;
        self.forget_next_hop();
    }

    pub fn set_client_id(&mut self, client_id: &str) -> Result<(), StackError> {
        let mut id = ClientId::new();
        id.push_str(client_id)
            .map_err(|()| StackError::ClientIdTooLong)?;
        self.cfg.client_id = id;
        Ok(())
    }

    pub fn set_ping_interval(&mut self, interval: Duration) {
        self.cfg.ping_interval = interval;
    }

    pub fn set_response_timeout(&mut self, timeout: Option<Duration>) {
        self.cfg.response_timeout = timeout;
    }

    pub fn set_tcp_window(&mut self, window: u16) {
        self.cfg.tcp_window = window;
        self.builder.set_window(window);
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.cfg.ttl = ttl;
        self.builder.set_ttl(ttl);
    }

    pub fn persisted_config(&self) -> PersistedConfig {
        PersistedConfig {
            broker_ip: self.cfg.broker_ip,
        }
    }

    pub fn apply_persisted(&mut self, persisted: &PersistedConfig) {
        persisted.apply(&mut self.cfg);
        self.sync_connection_identity();
    }

    /// Queues an operator request for the next `poll`.
    ///
    /// Only one intent may be pending or in flight; anything else is refused with
    /// [`StackError::Busy`]. A disconnect is the exception: it overrides an operation in flight
    /// and cancels one that has not started yet.
    pub fn request(&mut self, intent: Intent) -> Result<(), StackError> {
        if intent == Intent::Disconnect {
            return self.request_disconnect();
        }
        if self.pending.is_some() || self.disconnect_latched || !self.conn.mqtt_state.is_idle() {
            return Err(StackError::Busy);
        }
        match &intent {
            Intent::Publish {
                topic,
                payload,
                qos,
                ..
            } => {
                let id_len = if *qos == QoS::AtMostOnce { 0 } else { 2 };
                if 2 + topic.len() + id_len + payload.len() > MAX_REMAINING_LEN {
                    return Err(StackError::PayloadTooLarge);
                }
            }
            Intent::Subscribe { topic } => {
                if !self.registry.can_accept(topic) {
                    return Err(StackError::RegistryFull(crate::RegistryFull));
                }
            }
            Intent::Connect if self.conn.mqtt_connected => return Ok(()),
            _ => {}
        }
        debug!(intent = intent.name(), "intent queued");
        self.pending = Some(intent);
        Ok(())
    }

    fn request_disconnect(&mut self) -> Result<(), StackError> {
        match self.conn.tcp_state {
            TcpState::Closed => {
                if self.pending.take().is_none() {
                    return Err(StackError::NotConnected);
                }
                debug!("pending intent cancelled by disconnect");
            }
            _ if self.conn.mqtt_state == MqttOpState::Disconnecting => {}
            _ => {
                if self.pending.take().is_some() {
                    debug!("pending intent cancelled by disconnect");
                }
                self.disconnect_latched = true;
            }
        }
        Ok(())
    }

    pub fn poll<T, C, H>(&mut self, mut transport: T, timer: C, mut handler: H) -> PollOutcome
    where
        T: LinkTransport,
        C: Timer,
        H: MessageHandler,
    {
        let now = timer.ticks_since_reset();
        let mut outcome = PollOutcome {
            link_up: transport.is_link_up(),
            ..PollOutcome::default()
        };
        if outcome.link_up != self.link_up {
            debug!(link_up = outcome.link_up, "link state changed");
            self.link_up = outcome.link_up;
        }
        if transport.is_rx_overflow() {
            self.stats.rx_overflows += 1;
            outcome.rx_overflow = true;
            warn!("receive buffer overflow");
        }
        if !outcome.link_up {
            return outcome;
        }

        self.check_timeout(now);
        self.drive(&mut transport, now);

        let mut rx = std::mem::take(&mut self.rx);
        while outcome.frames < self.cfg.max_frames_per_poll && transport.is_frame_available() {
            let len = transport.receive_frame(&mut rx).min(rx.len());
            if len == 0 {
                break;
            }
            outcome.frames += 1;
            self.stats.frames_received += 1;
            self.handle_frame(&rx[..len], &mut transport, now, &mut handler);
        }
        self.rx = rx;

        self.drive(&mut transport, now);
        outcome
    }

    fn record_drop(&mut self, reason: DropReason) {
        trace!(?reason, "frame dropped");
        self.stats.record_drop(reason);
    }

    fn check_timeout(&mut self, now: Duration) {
        let Some(timeout) = self.cfg.response_timeout else {
            return;
        };
        let waiting = match self.conn.tcp_state {
            TcpState::Closed => false,
            TcpState::SynSent | TcpState::SynReceived => true,
            TcpState::Established => !self.conn.mqtt_state.is_idle(),
        };
        if waiting && now.saturating_sub(self.conn.waiting_since) >= timeout {
            warn!(
                tcp_state = ?self.conn.tcp_state,
                mqtt_state = ?self.conn.mqtt_state,
                "no response from broker; closing connection"
            );
            self.stats.timeouts += 1;
            self.disconnect_latched = false;
            self.conn.reset();
        }
    }

    /// Starts whatever the current state allows: next-hop resolution and SYN for a pending
    /// intent, a latched disconnect, the next queued operation, or a keepalive ping.
    fn drive<T: LinkTransport>(&mut self, transport: &mut T, now: Duration) {
        match self.conn.tcp_state {
            TcpState::Closed => {
                if self.pending.is_some() {
                    self.open_connection(transport, now);
                }
            }
            TcpState::Established if self.conn.mqtt_connected => {
                if self.disconnect_latched {
                    let state = self.send_disconnect(transport, now);
                    self.conn.mqtt_state = state;
                    return;
                }
                if !self.conn.mqtt_state.is_idle() {
                    return;
                }
                if let Some(intent) = self.pending.take() {
                    self.conn.mqtt_state = self.start_operation(intent, transport, now);
                } else if now.saturating_sub(self.conn.last_tx) >= self.cfg.ping_interval {
                    if self.emit(transport, now, Segment::PingReq) {
                        debug!("keepalive ping");
                        self.conn.mqtt_state = MqttOpState::Pinging;
                        self.conn.waiting_since = now;
                    } else {
                        // Next attempt one full interval later.
                        self.conn.last_tx = now;
                    }
                }
            }
            _ => {}
        }
    }

    fn open_connection<T: LinkTransport>(&mut self, transport: &mut T, now: Duration) {
        self.sync_connection_identity();
        if self.conn.remote_mac.is_none() {
            let due = self
                .conn
                .arp_requested_at
                .map_or(true, |at| now.saturating_sub(at) >= self.cfg.arp_retry_interval);
            if due {
                let identity = self.identity();
                let next_hop = self.cfg.broker_next_hop();
                debug!(%next_hop, "resolving broker next hop");
                transmit(
                    transport,
                    &mut self.stats,
                    "ARP request",
                    self.builder.arp_request(&identity, next_hop),
                );
                self.conn.arp_requested_at = Some(now);
            }
            return;
        }

        self.conn.local_port = self.allocate_port();
        self.conn.isn = self.cfg.initial_sequence;
        self.conn.snd_nxt = self.conn.isn;
        self.conn.rcv_nxt = 0;
        self.conn.tcp_state = TcpState::SynSent;
        self.conn.waiting_since = now;
        debug!(
            local_port = self.conn.local_port,
            broker = %self.conn.remote_ip,
            "connecting"
        );
        if !self.emit(transport, now, Segment::Syn) {
            self.abandon_handshake();
        }
    }

    /// A handshake frame never left the controller; nothing will answer it.
    fn abandon_handshake(&mut self) {
        warn!(tcp_state = ?self.conn.tcp_state, "handshake abandoned after transmit failure");
        self.pending = None;
        self.disconnect_latched = false;
        self.conn.reset();
    }

    fn allocate_port(&mut self) -> u16 {
        let range = self.cfg.ephemeral_ports.clone();
        if range.is_empty() {
            return range.start;
        }
        if !range.contains(&self.next_port) {
            self.next_port = range.start;
        }
        let port = self.next_port;
        self.next_port = if port + 1 >= range.end {
            range.start
        } else {
            port + 1
        };
        port
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    /// Builds and sends one segment. `snd_nxt` advances by the sequence space it used only when
    /// the controller accepted the frame.
    fn emit<T: LinkTransport>(
        &mut self,
        transport: &mut T,
        now: Duration,
        segment: Segment<'_>,
    ) -> bool {
        let conn = &self.conn;
        let built = match segment {
            Segment::Syn => self.builder.tcp_syn(conn, self.cfg.tcp_mss),
            Segment::Ack => self.builder.tcp_ack(conn),
            Segment::Connect => {
                let keep_alive = self.cfg.keepalive.as_secs().min(u16::MAX as u64) as u16;
                self.builder.tcp_push_ack(conn, &self.cfg.client_id, keep_alive)
            }
            Segment::Fin => self.builder.tcp_fin(conn),
            Segment::Publish {
                topic,
                payload,
                qos,
                retain,
                packet_id,
            } => self
                .builder
                .mqtt_publish(conn, topic, payload, qos, retain, packet_id),
            Segment::Subscribe { packet_id, topic } => {
                self.builder.mqtt_subscribe(conn, packet_id, topic)
            }
            Segment::Unsubscribe { packet_id, topic } => {
                self.builder.mqtt_unsubscribe(conn, packet_id, topic)
            }
            Segment::MqttAck(packet_type, packet_id) => {
                self.builder.mqtt_ack(conn, packet_type, packet_id)
            }
            Segment::PingReq => self.builder.mqtt_ping_request(conn),
            Segment::Disconnect => self.builder.mqtt_disconnect(conn),
        };
        let seq_len = built.as_ref().map_or(0, |f| f.seq_len);
        let sent = transmit(
            transport,
            &mut self.stats,
            segment.name(),
            built.map(|TcpFrame { frame, .. }| frame),
        );
        if sent {
            self.conn.snd_nxt = self.conn.snd_nxt.wrapping_add(seq_len);
            self.conn.last_tx = now;
        }
        sent
    }

    fn start_operation<T: LinkTransport>(
        &mut self,
        intent: Intent,
        transport: &mut T,
        now: Duration,
    ) -> MqttOpState {
        self.conn.waiting_since = now;
        match intent {
            Intent::Connect | Intent::Disconnect => MqttOpState::Idle,
            Intent::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                let (packet_id, stage) = match qos {
                    QoS::AtMostOnce => (0, PublishStage::AwaitingTcpAck),
                    QoS::AtLeastOnce => (self.allocate_packet_id(), PublishStage::AwaitingPubAck),
                    QoS::ExactlyOnce => (self.allocate_packet_id(), PublishStage::AwaitingPubRec),
                };
                let sent = self.emit(
                    transport,
                    now,
                    Segment::Publish {
                        topic: &topic,
                        payload: &payload,
                        qos,
                        retain,
                        packet_id,
                    },
                );
                if !sent {
                    warn!(topic = topic.as_str(), "publish dropped after transmit failure");
                    return MqttOpState::Idle;
                }
                self.conn.qos0_fast_path = qos == QoS::AtMostOnce;
                debug!(topic = topic.as_str(), ?qos, packet_id, "publish sent");
                MqttOpState::Publishing(PublishProgress {
                    qos,
                    packet_id,
                    stage,
                })
            }
            Intent::Subscribe { topic } => {
                let packet_id = match self.registry.subscribe_packet_id(&topic) {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(topic = topic.as_str(), %err, "subscribe dropped");
                        return MqttOpState::Idle;
                    }
                };
                let sent = self.emit(
                    transport,
                    now,
                    Segment::Subscribe {
                        packet_id,
                        topic: &topic,
                    },
                );
                if !sent {
                    warn!(topic = topic.as_str(), "subscribe dropped after transmit failure");
                    return MqttOpState::Idle;
                }
                if let Err(err) = self.registry.subscribe(&topic) {
                    warn!(topic = topic.as_str(), %err, "subscription not recorded");
                }
                debug!(topic = topic.as_str(), packet_id, "subscribe sent");
                MqttOpState::Subscribing { packet_id }
            }
            Intent::Unsubscribe { topic } => {
                let packet_id = self.registry.unsubscribe_packet_id(&topic);
                let sent = self.emit(
                    transport,
                    now,
                    Segment::Unsubscribe {
                        packet_id,
                        topic: &topic,
                    },
                );
                if !sent {
                    warn!(topic = topic.as_str(), "unsubscribe dropped after transmit failure");
                    return MqttOpState::Idle;
                }
                debug!(topic = topic.as_str(), packet_id, "unsubscribe sent");
                MqttOpState::Unsubscribing { packet_id, topic }
            }
        }
    }

    fn send_disconnect<T: LinkTransport>(
        &mut self,
        transport: &mut T,
        now: Duration,
    ) -> MqttOpState {
        self.disconnect_latched = false;
        self.conn.qos0_fast_path = false;
        self.conn.waiting_since = now;
        if !self.emit(transport, now, Segment::Disconnect) {
            warn!("disconnect dropped after transmit failure");
            return MqttOpState::Idle;
        }
        debug!("disconnect sent");
        MqttOpState::Disconnecting
    }

    fn handle_frame<T: LinkTransport, H: MessageHandler>(
        &mut self,
        frame: &[u8],
        transport: &mut T,
        now: Duration,
        handler: &mut H,
    ) {
        let identity = self.identity();
        match classify(frame, &identity) {
            FrameKind::ArpRequest(info) => {
                trace!(sender = %info.sender_ip, "ARP request");
                transmit(
                    transport,
                    &mut self.stats,
                    "ARP reply",
                    self.builder.arp_reply(&identity, &info),
                );
            }
            FrameKind::ArpReply(info) => {
                if self.conn.remote_mac.is_none() && info.sender_ip == self.cfg.broker_next_hop() {
                    debug!(
                        ip = %info.sender_ip,
                        mac = %info.sender_mac,
                        "broker next hop resolved"
                    );
                    self.conn.remote_mac = Some(info.sender_mac);
                    self.conn.arp_requested_at = None;
                }
            }
            FrameKind::IcmpEchoRequest => {
                transmit(
                    transport,
                    &mut self.stats,
                    "ICMP echo reply",
                    self.builder.icmp_echo_reply(&identity, frame),
                );
            }
            FrameKind::Udp(info) => self.handle_udp(frame, &info, transport, now, handler),
            FrameKind::Tcp(info) => self.handle_tcp(frame, &info, transport, now, handler),
            FrameKind::Dropped(reason) => self.record_drop(reason),
            FrameKind::Other => {}
        }
    }

    fn handle_udp<T: LinkTransport, H: MessageHandler>(
        &mut self,
        frame: &[u8],
        info: &UdpInfo,
        transport: &mut T,
        now: Duration,
        handler: &mut H,
    ) {
        let payload = &frame[info.payload_offset..info.payload_offset + info.payload_len];
        trace!(src = %info.src_ip, src_port = info.src_port, len = payload.len(), "UDP datagram");
        self.udp_peer = Some(UdpPeer::from(info));
        let reaction = handler.on_datagram(&InboundDatagram {
            src_ip: info.src_ip,
            src_port: info.src_port,
            dst_port: info.dst_port,
            payload,
        });
        self.react(reaction, transport);
    }

    fn react<T: LinkTransport>(&mut self, reaction: Reaction, transport: &mut T) {
        match reaction {
            Reaction::None => {}
            Reaction::Publish(intent) => {
                if let Err(err) = self.request(intent) {
                    warn!(%err, "handler publish dropped");
                }
            }
            Reaction::UdpReply(data) => {
                let Some(peer) = self.udp_peer else {
                    warn!("UDP reply without a peer");
                    return;
                };
                let identity = self.identity();
                transmit(
                    transport,
                    &mut self.stats,
                    "UDP reply",
                    self.builder.udp_datagram(&identity, &peer, &data),
                );
            }
        }
    }

    fn handle_tcp<T: LinkTransport, H: MessageHandler>(
        &mut self,
        frame: &[u8],
        info: &TcpInfo,
        transport: &mut T,
        now: Duration,
        handler: &mut H,
    ) {
        if self.conn.is_closed() {
            self.record_drop(DropReason::ProtocolStateMismatch);
            return;
        }
        let peer_ok = info.src_ip == self.conn.remote_ip
            && info.src_port == self.conn.remote_port
            && info.dst_port == self.conn.local_port
            && self.conn.remote_mac.map_or(true, |mac| mac == info.src_mac);
        if !peer_ok {
            self.record_drop(DropReason::UnexpectedPeer);
            return;
        }
        if info.flags.contains(TcpFlags::RST) {
            warn!(tcp_state = ?self.conn.tcp_state, "connection reset by broker");
            self.stats.resets += 1;
            self.pending = None;
            self.disconnect_latched = false;
            self.conn.reset();
            return;
        }

        match self.conn.tcp_state {
            TcpState::SynSent => {
                if info.kind != Some(TcpFlagKind::SynAck) || info.ack != self.conn.snd_nxt {
                    self.record_drop(DropReason::ProtocolStateMismatch);
                    return;
                }
                self.conn.rcv_nxt = info.seq.wrapping_add(1);
                self.conn.tcp_state = TcpState::SynReceived;
                self.conn.waiting_since = now;
                debug!(tcp_state = ?self.conn.tcp_state, "SYN|ACK received");
                if self.emit(transport, now, Segment::Ack)
                    && self.emit(transport, now, Segment::Connect)
                {
                    self.conn.tcp_state = TcpState::Established;
                    self.conn.mqtt_state = MqttOpState::AwaitingConnAck;
                    debug!(tcp_state = ?self.conn.tcp_state, "CONNECT sent");
                } else {
                    self.abandon_handshake();
                }
            }
            TcpState::Established => self.handle_established(frame, info, transport, now, handler),
            TcpState::SynReceived | TcpState::Closed => {
                self.record_drop(DropReason::ProtocolStateMismatch);
            }
        }
    }

    fn handle_established<T: LinkTransport, H: MessageHandler>(
        &mut self,
        frame: &[u8],
        info: &TcpInfo,
        transport: &mut T,
        now: Duration,
        handler: &mut H,
    ) {
        if info.flags.contains(TcpFlags::ACK) {
            self.on_ack(info.ack);
        }

        let payload = info.payload(frame);
        if !payload.is_empty() {
            if info.seq != self.conn.rcv_nxt {
                trace!(seq = info.seq, expected = self.conn.rcv_nxt, "out-of-order segment");
                self.emit(transport, now, Segment::Ack);
                self.record_drop(DropReason::ProtocolStateMismatch);
                return;
            }
            self.conn.rcv_nxt = self.conn.rcv_nxt.wrapping_add(payload.len() as u32);
            self.emit(transport, now, Segment::Ack);

            let mut rest = payload;
            while !rest.is_empty() {
                let packet = match MqttPacket::parse(rest) {
                    Ok(packet) => packet,
                    Err(err) => {
                        trace!(%err, "undecodable MQTT data");
                        self.record_drop(DropReason::MalformedFrame);
                        break;
                    }
                };
                self.on_mqtt_packet(&packet, transport, now, handler);
                rest = &rest[packet.len()..];
                if self.conn.is_closed() {
                    return;
                }
            }
        }

        if info.flags.contains(TcpFlags::FIN) {
            self.conn.rcv_nxt = info.seq.wrapping_add(payload.len() as u32).wrapping_add(1);
            self.emit(transport, now, Segment::Fin);
            debug!(mqtt_state = ?self.conn.mqtt_state, "connection closed by broker");
            self.disconnect_latched = false;
            self.conn.reset();
        }
    }

    fn on_ack(&mut self, ack: u32) {
        if !self.conn.qos0_fast_path || ack != self.conn.snd_nxt {
            return;
        }
        if let MqttOpState::Publishing(PublishProgress {
            stage: PublishStage::AwaitingTcpAck,
            ..
        }) = self.conn.mqtt_state
        {
            debug!("QoS 0 publish acknowledged");
            self.conn.mqtt_state = MqttOpState::Idle;
        }
        self.conn.qos0_fast_path = false;
    }

    fn on_mqtt_packet<T: LinkTransport, H: MessageHandler>(
        &mut self,
        packet: &MqttPacket<'_>,
        transport: &mut T,
        now: Duration,
        handler: &mut H,
    ) {
        let Some(kind) = MqttKind::from_first_byte(packet.first_byte()) else {
            self.record_drop(DropReason::ProtocolStateMismatch);
            return;
        };
        match kind {
            MqttKind::Publish => return self.on_inbound_publish(packet, transport, now, handler),
            MqttKind::PubRel => {
                match packet.ack_packet_id() {
                    Ok(id) => {
                        self.emit(transport, now, Segment::MqttAck(ControlPacketType::PubComp, id));
                    }
                    Err(_) => self.record_drop(DropReason::MalformedFrame),
                }
                return;
            }
            _ => {}
        }

        let ack_id = packet.ack_packet_id().ok();
        let state = std::mem::take(&mut self.conn.mqtt_state);
        let next = match (kind, state) {
            (MqttKind::ConnAck, MqttOpState::AwaitingConnAck) => {
                self.on_connack(packet, transport, now)
            }
            (MqttKind::PubAck, MqttOpState::Publishing(p))
                if p.stage == PublishStage::AwaitingPubAck && ack_id == Some(p.packet_id) =>
            {
                debug!(packet_id = p.packet_id, "QoS 1 publish acknowledged");
                MqttOpState::Idle
            }
            (MqttKind::PubRec, MqttOpState::Publishing(p))
                if p.stage == PublishStage::AwaitingPubRec && ack_id.is_some() =>
            {
                let packet_id = ack_id.unwrap_or(p.packet_id);
                let pubrel = Segment::MqttAck(ControlPacketType::PubRel, packet_id);
                if !self.emit(transport, now, pubrel) {
                    warn!(packet_id, "QoS 2 publish abandoned after transmit failure");
                    return self.finish_mqtt_packet(MqttOpState::Idle);
                }
                self.conn.waiting_since = now;
                MqttOpState::Publishing(PublishProgress {
                    packet_id,
                    stage: PublishStage::AwaitingPubComp,
                    ..p
                })
            }
            (MqttKind::PubComp, MqttOpState::Publishing(p))
                if p.stage == PublishStage::AwaitingPubComp && ack_id == Some(p.packet_id) =>
            {
                debug!(packet_id = p.packet_id, "QoS 2 publish complete");
                MqttOpState::Idle
            }
            (MqttKind::SubAck, MqttOpState::Subscribing { packet_id }) => {
                match SubAck::parse(packet) {
                    Ok(ack) if ack.packet_id == packet_id => {
                        if ack.return_code == 0x80 {
                            warn!(packet_id, "subscription refused by broker");
                        } else {
                            debug!(packet_id, "subscribed");
                        }
                        MqttOpState::Idle
                    }
                    _ => {
                        self.record_drop(DropReason::ProtocolStateMismatch);
                        MqttOpState::Subscribing { packet_id }
                    }
                }
            }
            (MqttKind::UnsubAck, MqttOpState::Unsubscribing { packet_id, topic })
                if ack_id == Some(packet_id) =>
            {
                self.registry.remove(&topic);
                debug!(topic = topic.as_str(), packet_id, "unsubscribed");
                MqttOpState::Idle
            }
            (MqttKind::PingResp, MqttOpState::Pinging) => {
                trace!("keepalive answered");
                MqttOpState::Idle
            }
            (_, state) => {
                trace!(?kind, mqtt_state = ?state, "unexpected MQTT packet");
                self.record_drop(DropReason::ProtocolStateMismatch);
                state
            }
        };
        self.finish_mqtt_packet(next);
    }

    fn finish_mqtt_packet(&mut self, next: MqttOpState) {
        if self.conn.tcp_state == TcpState::Established {
            self.conn.mqtt_state = next;
        }
    }

    fn on_connack<T: LinkTransport>(
        &mut self,
        packet: &MqttPacket<'_>,
        transport: &mut T,
        now: Duration,
    ) -> MqttOpState {
        let ack = match ConnAck::parse(packet) {
            Ok(ack) => ack,
            Err(_) => {
                self.record_drop(DropReason::MalformedFrame);
                return MqttOpState::AwaitingConnAck;
            }
        };
        if !ack.accepted() {
            warn!(return_code = ack.return_code, "broker refused connection");
            self.pending = None;
            self.disconnect_latched = false;
            self.emit(transport, now, Segment::Fin);
            self.conn.reset();
            return MqttOpState::Idle;
        }
        self.conn.mqtt_connected = true;
        debug!("MQTT session established");
        if self.disconnect_latched {
            return self.send_disconnect(transport, now);
        }
        match self.pending.take() {
            Some(intent) => self.start_operation(intent, transport, now),
            None => MqttOpState::Idle,
        }
    }

    fn on_inbound_publish<T: LinkTransport, H: MessageHandler>(
        &mut self,
        packet: &MqttPacket<'_>,
        transport: &mut T,
        now: Duration,
        handler: &mut H,
    ) {
        let publish = match Publish::parse(packet) {
            Ok(publish) => publish,
            Err(_) => {
                self.record_drop(DropReason::MalformedFrame);
                return;
            }
        };
        let Ok(topic) = publish.topic_str() else {
            self.record_drop(DropReason::MalformedFrame);
            return;
        };
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => {
                self.emit(transport, now, Segment::MqttAck(ControlPacketType::PubAck, id));
            }
            (QoS::ExactlyOnce, Some(id)) => {
                self.emit(transport, now, Segment::MqttAck(ControlPacketType::PubRec, id));
            }
            _ => {}
        }
        debug!(topic, len = publish.payload.len(), qos = ?publish.qos, "message received");
        let reaction = handler.on_publish(&InboundPublish {
            topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            packet_id: publish.packet_id,
        });
        self.react(reaction, transport);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;
    use crate::transport::QueueTransport;

    fn stack() -> NetworkStack {
        let cfg = StackConfig {
            broker_ip: Ipv4Addr::new(192, 168, 1, 10),
            broker_mac: Some(MacAddr([0xaa; 6])),
            ..StackConfig::default()
        };
        NetworkStack::new(cfg)
    }

    #[test]
    fn busy_while_intent_pending() {
        let mut s = stack();
        s.request(Intent::Connect).unwrap();
        assert_eq!(
            s.request(Intent::subscribe("a").unwrap()),
            Err(StackError::Busy)
        );
    }

    #[test]
    fn disconnect_without_connection_is_refused() {
        let mut s = stack();
        assert_eq!(s.request(Intent::Disconnect), Err(StackError::NotConnected));
        s.request(Intent::Connect).unwrap();
        assert_eq!(s.request(Intent::Disconnect), Ok(()));
        assert!(!s.status().pending_intent);
    }

    #[test]
    fn oversized_publish_is_refused() {
        let mut s = stack();
        let intent = Intent::publish(&"t".repeat(60), &[0u8; 66], QoS::AtLeastOnce).unwrap();
        assert_eq!(s.request(intent), Err(StackError::PayloadTooLarge));
    }

    #[test]
    fn link_down_skips_everything() {
        let mut s = stack();
        s.request(Intent::Connect).unwrap();
        let mut t = QueueTransport::new();
        t.link_up = false;
        t.signal_rx_overflow();
        let timer = ManualTimer::new();
        let outcome = s.poll(&mut t, &timer, ());
        assert!(!outcome.link_up);
        assert!(outcome.rx_overflow);
        assert!(t.tx.is_empty());
        assert_eq!(s.stats().rx_overflows, 1);
    }

    /// Driver that claims more bytes than the buffer it was given.
    struct OverreportingLink(Option<Vec<u8>>);

    impl LinkTransport for OverreportingLink {
        fn is_link_up(&mut self) -> bool {
            true
        }

        fn is_frame_available(&mut self) -> bool {
            self.0.is_some()
        }

        fn receive_frame(&mut self, buf: &mut [u8]) -> usize {
            let Some(frame) = self.0.take() else {
                return 0;
            };
            let len = frame.len().min(buf.len());
            buf[..len].copy_from_slice(&frame[..len]);
            buf.len() + 64
        }

        fn transmit_frame(&mut self, _frame: &[u8]) -> bool {
            true
        }

        fn is_rx_overflow(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn overreported_frame_length_is_clamped() {
        let mut s = stack();
        let mut link = OverreportingLink(Some(vec![0xff; 60]));
        let outcome = s.poll(&mut link, ManualTimer::new(), ());
        assert_eq!(outcome.frames, 1);
        assert_eq!(s.stats().frames_received, 1);
    }

    #[test]
    fn mqtt_ack_names_match_packet_type() {
        assert_eq!(Segment::MqttAck(ControlPacketType::PubComp, 1).name(), "PUBCOMP");
        assert_eq!(Segment::MqttAck(ControlPacketType::PubRel, 1).name(), "PUBREL");
        assert_eq!(Segment::MqttAck(ControlPacketType::SubAck, 1).name(), "MQTT ack");
    }

    #[test]
    fn ephemeral_ports_wrap() {
        let mut s = NetworkStack::new(StackConfig {
            ephemeral_ports: 1000..1002,
            ..StackConfig::default()
        });
        assert_eq!(s.allocate_port(), 1000);
        assert_eq!(s.allocate_port(), 1001);
        assert_eq!(s.allocate_port(), 1000);
    }

    #[test]
    fn client_id_capacity() {
        let mut s = stack();
        assert!(s.set_client_id("device-1").is_ok());
        assert_eq!(s.config().client_id.as_str(), "device-1");
        assert_eq!(
            s.set_client_id(&"x".repeat(24)),
            Err(StackError::ClientIdTooLong)
        );
    }
}
