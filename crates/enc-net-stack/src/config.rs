use core::net::Ipv4Addr;
use core::ops::Range;
use core::time::Duration;

use enc_packetlib::packet::MacAddr;

pub const MQTT_PORT: u16 = 1883;

/// Longest client identifier accepted in a CONNECT packet.
pub const MAX_CLIENT_ID_LEN: usize = 23;

pub type ClientId = heapless::String<MAX_CLIENT_ID_LEN>;

#[derive(Debug, Clone)]
pub struct StackConfig {
    pub local_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Next hop for destinations outside `local_ip/subnet_mask`.
    pub gateway_ip: Ipv4Addr,

    pub broker_ip: Ipv4Addr,
    pub broker_port: u16,
    /// When set, the broker (or gateway) MAC is trusted as-is and no ARP request is sent.
    pub broker_mac: Option<MacAddr>,
    /// Sent verbatim in CONNECT; empty asks the broker to assign one.
    pub client_id: ClientId,

    /// Keep-alive advertised in CONNECT.
    pub keepalive: Duration,
    /// Transmit silence after which an idle session sends PINGREQ. Must stay below `keepalive`.
    pub ping_interval: Duration,
    pub arp_retry_interval: Duration,
    /// Abort a handshake or MQTT operation that has waited this long for the peer.
    ///
    /// `None` waits forever; the engine never retransmits, so a lost response then leaves the
    /// operation pending until the operator intervenes.
    pub response_timeout: Option<Duration>,

    pub tcp_window: u16,
    /// Advertised in the MSS option of the outgoing SYN.
    pub tcp_mss: u16,
    pub ttl: u8,
    /// Local ports are taken from this range, advancing on every new connection.
    pub ephemeral_ports: Range<u16>,
    pub initial_sequence: u32,

    /// Maximum number of received frames processed by one `poll`.
    pub max_frames_per_poll: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            local_mac: MacAddr([0x02, 0x03, 0x04, 0x05, 0x06, 0x8d]),
            local_ip: Ipv4Addr::new(192, 168, 1, 141),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
            broker_ip: Ipv4Addr::new(192, 168, 1, 1),
            broker_port: MQTT_PORT,
            broker_mac: None,
            client_id: ClientId::new(),
            keepalive: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            arp_retry_interval: Duration::from_secs(1),
            response_timeout: None,
            tcp_window: 1280,
            tcp_mss: 1280,
            ttl: 128,
            ephemeral_ports: 1000..3000,
            initial_sequence: 0,
            max_frames_per_poll: 8,
        }
    }
}

impl StackConfig {
    pub fn is_on_link(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.local_ip) & mask
    }

    /// Address whose MAC must be resolved to reach the broker.
    pub fn broker_next_hop(&self) -> Ipv4Addr {
        if self.is_on_link(self.broker_ip) {
            self.broker_ip
        } else {
            self.gateway_ip
        }
    }
}

/// Word-addressed non-volatile storage (EEPROM or emulation of it).
pub trait WordStore {
    fn read_word(&mut self, addr: u16) -> u16;
    fn write_word(&mut self, addr: u16, value: u16);
}

impl<T: WordStore + ?Sized> WordStore for &mut T {
    fn read_word(&mut self, addr: u16) -> u16 {
        <T as WordStore>::read_word(&mut **self, addr)
    }

    fn write_word(&mut self, addr: u16, value: u16) {
        <T as WordStore>::write_word(&mut **self, addr, value);
    }
}

/// Sparse in-memory [`WordStore`]; unwritten words read back as erased (`0xffff`).
#[derive(Debug, Default, Clone)]
pub struct MemoryWordStore {
    words: std::collections::BTreeMap<u16, u16>,
}

impl MemoryWordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WordStore for MemoryWordStore {
    fn read_word(&mut self, addr: u16) -> u16 {
        self.words.get(&addr).copied().unwrap_or(0xffff)
    }

    fn write_word(&mut self, addr: u16, value: u16) {
        self.words.insert(addr, value);
    }
}

/// Settings kept across resets: the broker address, one octet per word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedConfig {
    pub broker_ip: Ipv4Addr,
}

impl PersistedConfig {
    pub const BROKER_IP_BASE: u16 = 0x20;

    /// Returns `None` when any octet word is erased or out of range.
    pub fn load<S: WordStore>(store: &mut S) -> Option<Self> {
        let mut octets = [0u8; 4];
        for (i, octet) in octets.iter_mut().enumerate() {
            let word = store.read_word(Self::BROKER_IP_BASE + i as u16);
            *octet = u8::try_from(word).ok()?;
        }
        Some(Self {
            broker_ip: Ipv4Addr::from(octets),
        })
    }

    pub fn save<S: WordStore>(&self, store: &mut S) {
        for (i, octet) in self.broker_ip.octets().into_iter().enumerate() {
            store.write_word(Self::BROKER_IP_BASE + i as u16, octet as u16);
        }
        tracing::debug!(broker_ip = %self.broker_ip, "persisted broker address");
    }

    pub fn apply(&self, cfg: &mut StackConfig) {
        cfg.broker_ip = self.broker_ip;
    }
}
