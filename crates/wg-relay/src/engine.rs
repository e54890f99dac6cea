//! The protocol engine boundary.
//!
//! The relay never looks inside WireGuard messages. It hands inbound
//! datagrams and outbound IP packets to an [`Engine`], and the engine pushes
//! whatever it produces back out through an [`Egress`].

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
};

use ipnet::{IpNet, Ipv4Net};

use crate::{
    config,
    x25519::{self, PublicKey, StaticSecret, KEY_LEN},
};

mod boring;
mod random;

pub use boring::BoringEngine;

/// Opaque handle to a peer registered with an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerIndex(pub u32);

#[derive(Clone)]
pub struct PeerInit {
    pub public_key: PublicKey,
    pub preshared_key: Option<[u8; KEY_LEN]>,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error("no peer with index {}", .0 .0)]
    UnknownPeer(PeerIndex),
    #[error("invalid peer: {0}")]
    Peer(&'static str),
}

/// Where engine output goes
pub trait Egress: Send + Sync {
    /// Send a datagram to a peer. Delivery is best effort.
    fn send_datagram(&self, datagram: &[u8], target: SocketAddr);

    /// Hand a decrypted packet to the host network stack
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// A WireGuard protocol implementation.
///
/// `inbound` and `outbound` are called concurrently from the two relay
/// loops, `update_timers` from the protocol timer. Implementations
/// synchronize internally. Protocol failures are dropped inside the engine;
/// the only errors returned are the ones the [`Egress`] produced.
pub trait Engine: Send + Sync + 'static {
    fn init(&self, private_key: StaticSecret, listen_port: u16) -> Result<(), EngineError>;

    fn add_peer(&self, peer: PeerInit) -> Result<PeerIndex, EngineError>;

    /// Start an outbound handshake with a registered peer
    fn connect(&self, peer: PeerIndex, egress: &dyn Egress) -> Result<(), EngineError>;

    fn inbound(&self, egress: &dyn Egress, payload: &[u8], sender: SocketAddr) -> io::Result<()>;

    fn outbound(&self, egress: &dyn Egress, packet: &[u8], destination: IpAddr)
        -> io::Result<()>;

    /// Periodic maintenance: handshake retries, keepalives, rekeying
    fn update_timers(&self, egress: &dyn Egress) -> io::Result<()>;
}

impl PeerInit {
    /// The single server peer of a client configuration. All destinations
    /// are routed through it; an unspecified endpoint address means the
    /// peer has to contact us first.
    pub fn from_config(peer: &config::Peer) -> Self {
        let endpoint =
            (!peer.endpoint.ip().is_unspecified()).then_some(SocketAddr::V4(peer.endpoint));
        Self {
            public_key: peer.public_key,
            preshared_key: peer.preshared_key,
            allowed_ips: vec![IpNet::V4(Ipv4Net::default())],
            endpoint,
            persistent_keepalive: peer.persistent_keepalive,
        }
    }
}

impl fmt::Debug for PeerInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInit")
            .field("public_key", &x25519::encode(self.public_key.as_bytes()))
            .field("preshared_key", &self.preshared_key.map(|_| "<redacted>"))
            .field("allowed_ips", &self.allowed_ips)
            .field("endpoint", &self.endpoint)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .finish()
    }
}
