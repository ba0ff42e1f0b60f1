#![forbid(unsafe_code)]

//! Single-connection MQTT client on a minimal ARP/IPv4/ICMP/UDP/TCP stack.
//!
//! [`NetworkStack`] owns all protocol state and is driven by calling [`NetworkStack::poll`] with a
//! [`LinkTransport`] (the Ethernet controller), a [`Timer`] and a [`MessageHandler`] for inbound
//! application messages. Operator requests enter through [`NetworkStack::request`].

pub mod builder;
pub mod classify;
pub mod config;
pub mod registry;
pub mod session;
pub mod stack;
pub mod timer;
pub mod transport;

pub use enc_packetlib::packet::{MacAddr, PacketError, QoS};

pub use builder::{FrameBuilder, UdpPeer};
pub use classify::{classify, DropReason, FrameKind, Identity};
pub use config::{MemoryWordStore, PersistedConfig, StackConfig, WordStore};
pub use registry::{RegistryFull, SubscriptionEntry, SubscriptionTable};
pub use session::{Intent, MqttOpState, Payload, SessionStatus, TcpState};
pub use stack::{
    InboundDatagram, InboundPublish, MessageHandler, NetworkStack, PollOutcome, Reaction,
    StackStats,
};
pub use timer::{ManualTimer, StdTimer, Timer};
pub use transport::{LinkTransport, QueueTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("another operation is pending or in flight")]
    Busy,

    #[error("no broker connection to act on")]
    NotConnected,

    #[error("topic exceeds {} bytes", registry::MAX_TOPIC_LEN)]
    TopicTooLong,

    #[error("client id exceeds {} bytes", config::MAX_CLIENT_ID_LEN)]
    ClientIdTooLong,

    #[error("payload does not fit in a single MQTT packet")]
    PayloadTooLarge,

    #[error(transparent)]
    RegistryFull(#[from] RegistryFull),

    #[error(transparent)]
    Packet(#[from] PacketError),
}
