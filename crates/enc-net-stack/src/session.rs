use core::net::Ipv4Addr;
use core::time::Duration;

use enc_packetlib::packet::{MacAddr, QoS};

use crate::registry::Topic;

/// Largest application payload carried in one PUBLISH or UDP reply.
pub const MAX_PAYLOAD_LEN: usize = 127;

pub type Payload = heapless::Vec<u8, MAX_PAYLOAD_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    Closed,
    /// SYN sent, waiting for SYN|ACK.
    SynSent,
    /// SYN|ACK received; our ACK and CONNECT are on the wire.
    SynReceived,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    /// QoS 0: waiting for the TCP ACK covering the PUBLISH.
    AwaitingTcpAck,
    /// QoS 1.
    AwaitingPubAck,
    /// QoS 2, first half.
    AwaitingPubRec,
    /// QoS 2, PUBREL sent.
    AwaitingPubComp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishProgress {
    pub qos: QoS,
    pub packet_id: u16,
    pub stage: PublishStage,
}

/// The one MQTT operation in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MqttOpState {
    #[default]
    Idle,
    AwaitingConnAck,
    Publishing(PublishProgress),
    Subscribing { packet_id: u16 },
    Unsubscribing { packet_id: u16, topic: Topic },
    Pinging,
    Disconnecting,
}

impl MqttOpState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Operator request handed to `NetworkStack::request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Connect,
    Publish {
        topic: Topic,
        payload: Payload,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        topic: Topic,
    },
    Unsubscribe {
        topic: Topic,
    },
    Disconnect,
}

impl Intent {
    pub fn publish(topic: &str, payload: &[u8], qos: QoS) -> Result<Self, crate::StackError> {
        Ok(Self::Publish {
            topic: topic_from(topic)?,
            payload: Payload::from_slice(payload).map_err(|()| crate::StackError::PayloadTooLarge)?,
            qos,
            retain: false,
        })
    }

    pub fn subscribe(topic: &str) -> Result<Self, crate::StackError> {
        Ok(Self::Subscribe {
            topic: topic_from(topic)?,
        })
    }

    pub fn unsubscribe(topic: &str) -> Result<Self, crate::StackError> {
        Ok(Self::Unsubscribe {
            topic: topic_from(topic)?,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Publish { .. } => "publish",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Disconnect => "disconnect",
        }
    }
}

pub(crate) fn topic_from(topic: &str) -> Result<Topic, crate::StackError> {
    let mut out = Topic::new();
    out.push_str(topic)
        .map_err(|()| crate::StackError::TopicTooLong)?;
    Ok(out)
}

/// State of the single broker connection. Sequence numbers are host order.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub local_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    /// Next-hop MAC for the broker; `None` until resolved.
    pub remote_mac: Option<MacAddr>,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,

    pub isn: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,

    pub tcp_state: TcpState,
    pub mqtt_state: MqttOpState,
    /// Set once CONNACK accepted the session.
    pub mqtt_connected: bool,
    /// A QoS 0 PUBLISH is in flight and completes on the next ACK covering `snd_nxt`.
    pub qos0_fast_path: bool,

    /// Last time anything was sent on the connection.
    pub last_tx: Duration,
    /// When the current handshake step or MQTT operation started waiting on the peer.
    pub waiting_since: Duration,
    pub arp_requested_at: Option<Duration>,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self {
            local_mac: MacAddr::UNSPECIFIED,
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_mac: None,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            isn: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            tcp_state: TcpState::Closed,
            mqtt_state: MqttOpState::Idle,
            mqtt_connected: false,
            qos0_fast_path: false,
            last_tx: Duration::ZERO,
            waiting_since: Duration::ZERO,
            arp_requested_at: None,
        }
    }
}

impl ConnectionContext {
    pub fn is_closed(&self) -> bool {
        self.tcp_state == TcpState::Closed
    }

    /// Back to `Closed`, keeping the resolved peer MAC for the next connection.
    pub fn reset(&mut self) {
        let remote_mac = self.remote_mac;
        *self = Self {
            local_mac: self.local_mac,
            local_ip: self.local_ip,
            remote_mac,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            ..Self::default()
        };
    }
}

/// Snapshot returned by `NetworkStack::status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub link_up: bool,
    pub tcp_state: TcpState,
    pub mqtt_state: MqttOpState,
    pub mqtt_connected: bool,
    pub pending_intent: bool,
}
