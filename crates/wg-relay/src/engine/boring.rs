use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use boringtun::noise::{
    handshake::parse_handshake_anon, rate_limiter::RateLimiter, HandshakeResponse, Packet,
    PacketCookieReply, PacketData, Tunn, TunnResult,
};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use tracing::{debug, info, trace};

use super::{random::SessionIndices, Egress, Engine, EngineError, PeerIndex, PeerInit};
use crate::x25519::{self, PublicKey, StaticSecret};

/// Scratch space for one encapsulation or decapsulation
const BUFFER_SIZE: usize = u16::MAX as usize;

/// [`Engine`] backed by boringtun's noise implementation
#[derive(Default)]
pub struct BoringEngine {
    device: RwLock<Option<Device>>,
}

struct Device {
    keypair: (StaticSecret, PublicKey),
    listen_port: u16,
    indices: SessionIndices,
    rate_limiter: Arc<RateLimiter>,
    peers: Vec<Peer>,
}

struct Peer {
    index: u32,
    public_key: PublicKey,
    allowed_ips: Vec<IpNet>,
    endpoint: Mutex<Option<SocketAddr>>,
    session: Mutex<Session>,
}

struct Session {
    tunnel: Tunn,
    buffer: Vec<u8>,
}

impl BoringEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.device.read().as_ref().map(|d| d.listen_port)
    }

    /// Last known address of a peer
    pub fn endpoint(&self, peer: PeerIndex) -> Option<SocketAddr> {
        let device = self.device.read();
        let peer = device.as_ref()?.peers.iter().find(|p| p.index == peer.0)?;
        let endpoint = *peer.endpoint.lock();
        endpoint
    }
}

impl Engine for BoringEngine {
    fn init(&self, private_key: StaticSecret, listen_port: u16) -> Result<(), EngineError> {
        let mut device = self.device.write();
        if device.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }

        let public_key = PublicKey::from(&private_key);
        info!(
            public_key = %x25519::encode(public_key.as_bytes()),
            listen_port,
            "protocol engine initialized"
        );
        *device = Some(Device {
            keypair: (private_key, public_key),
            listen_port,
            indices: SessionIndices::new(&mut OsRng),
            rate_limiter: Arc::new(RateLimiter::new(&public_key, 64)),
            peers: Vec::new(),
        });
        Ok(())
    }

    fn add_peer(&self, init: PeerInit) -> Result<PeerIndex, EngineError> {
        let mut device = self.device.write();
        let Device {
            keypair: (private, _),
            indices,
            rate_limiter,
            peers,
            ..
        } = device.as_mut().ok_or(EngineError::NotInitialized)?;

        let index = indices
            .next()
            .ok_or(EngineError::Peer("out of session indices"))?;
        let tunnel = Tunn::new(
            private.clone(),
            init.public_key,
            init.preshared_key,
            init.persistent_keepalive,
            index,
            Some(rate_limiter.clone()),
        )
        .map_err(EngineError::Peer)?;

        debug!(index, peer = ?init, "peer registered");
        peers.push(Peer {
            index,
            public_key: init.public_key,
            allowed_ips: init.allowed_ips,
            endpoint: Mutex::new(init.endpoint),
            session: Mutex::new(Session {
                tunnel,
                buffer: vec![0; BUFFER_SIZE],
            }),
        });
        Ok(PeerIndex(index))
    }

    fn connect(&self, peer: PeerIndex, egress: &dyn Egress) -> Result<(), EngineError> {
        let device = self.device.read();
        let device = device.as_ref().ok_or(EngineError::NotInitialized)?;
        let peer = device
            .peers
            .iter()
            .find(|p| p.index == peer.0)
            .ok_or(EngineError::UnknownPeer(peer))?;

        let Some(endpoint) = *peer.endpoint.lock() else {
            debug!(index = peer.index, "peer has no endpoint, waiting for it to connect");
            return Ok(());
        };

        let mut session = peer.session.lock();
        let Session { tunnel, buffer } = &mut *session;
        match tunnel.format_handshake_initiation(buffer, false) {
            TunnResult::WriteToNetwork(datagram) => {
                debug!(%endpoint, "sending handshake initiation");
                egress.send_datagram(datagram, endpoint);
            }
            TunnResult::Err(e) => debug!(error = ?e, "could not start handshake"),
            _ => {}
        }
        Ok(())
    }

    fn inbound(&self, egress: &dyn Egress, payload: &[u8], sender: SocketAddr) -> io::Result<()> {
        let device = self.device.read();
        let Some(Device {
            keypair: (private, public),
            peers,
            ..
        }) = device.as_ref()
        else {
            return Ok(());
        };

        let packet = match Tunn::parse_incoming_packet(payload) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%sender, error = ?e, len = payload.len(), "dropping datagram");
                return Ok(());
            }
        };

        let peer = match packet {
            Packet::HandshakeInit(packet) => parse_handshake_anon(private, public, &packet)
                .ok()
                .and_then(|handshake| {
                    peers
                        .iter()
                        .find(|p| p.public_key.as_bytes() == &handshake.peer_static_public)
                }),
            Packet::HandshakeResponse(HandshakeResponse { receiver_idx, .. })
            | Packet::PacketCookieReply(PacketCookieReply { receiver_idx, .. })
            | Packet::PacketData(PacketData { receiver_idx, .. }) => {
                peers.iter().find(|p| p.index == receiver_idx >> 8)
            }
        };
        let Some(peer) = peer else {
            trace!(%sender, "dropping datagram for unknown peer");
            return Ok(());
        };

        let mut session = peer.session.lock();
        let Session { tunnel, buffer } = &mut *session;
        match tunnel.decapsulate(Some(sender.ip()), payload, buffer) {
            TunnResult::Err(e) => {
                debug!(%sender, error = ?e, "dropping datagram");
                return Ok(());
            }
            TunnResult::Done => {}
            TunnResult::WriteToNetwork(datagram) => {
                egress.send_datagram(datagram, sender);
                while let TunnResult::WriteToNetwork(datagram) =
                    tunnel.decapsulate(None, &[], buffer)
                {
                    egress.send_datagram(datagram, sender);
                }
            }
            TunnResult::WriteToTunnelV4(packet, source) if peer.is_allowed_ip(source) => {
                egress.write_packet(packet)?;
            }
            TunnResult::WriteToTunnelV6(packet, source) if peer.is_allowed_ip(source) => {
                egress.write_packet(packet)?;
            }
            TunnResult::WriteToTunnelV4(_, source) => {
                debug!(%source, "dropping packet from disallowed source")
            }
            TunnResult::WriteToTunnelV6(_, source) => {
                debug!(%source, "dropping packet from disallowed source")
            }
        }

        let mut endpoint = peer.endpoint.lock();
        if *endpoint != Some(sender) {
            debug!(index = peer.index, %sender, "peer endpoint changed");
            *endpoint = Some(sender);
        }
        Ok(())
    }

    fn outbound(
        &self,
        egress: &dyn Egress,
        packet: &[u8],
        destination: IpAddr,
    ) -> io::Result<()> {
        let device = self.device.read();
        let Some(device) = device.as_ref() else {
            return Ok(());
        };

        let Some(peer) = device.peers.iter().find(|p| p.is_allowed_ip(destination)) else {
            trace!(%destination, "no peer for destination");
            return Ok(());
        };
        let Some(endpoint) = *peer.endpoint.lock() else {
            trace!(%destination, "peer endpoint unknown");
            return Ok(());
        };

        let mut session = peer.session.lock();
        let Session { tunnel, buffer } = &mut *session;
        match tunnel.encapsulate(packet, buffer) {
            TunnResult::WriteToNetwork(datagram) => egress.send_datagram(datagram, endpoint),
            TunnResult::Err(e) => debug!(%destination, error = ?e, "could not encapsulate"),
            _ => {}
        }
        Ok(())
    }

    fn update_timers(&self, egress: &dyn Egress) -> io::Result<()> {
        let device = self.device.read();
        let Some(device) = device.as_ref() else {
            return Ok(());
        };

        for peer in &device.peers {
            let Some(endpoint) = *peer.endpoint.lock() else {
                continue;
            };
            let mut session = peer.session.lock();
            let Session { tunnel, buffer } = &mut *session;
            match tunnel.update_timers(buffer) {
                TunnResult::WriteToNetwork(datagram) => egress.send_datagram(datagram, endpoint),
                TunnResult::Err(e) => trace!(index = peer.index, error = ?e, "timer"),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Peer {
    fn is_allowed_ip(&self, address: impl Into<IpAddr>) -> bool {
        let address = address.into();
        self.allowed_ips.iter().any(|net| net.contains(&address))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    #[derive(Default)]
    struct Capture {
        datagrams: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl Egress for Capture {
        fn send_datagram(&self, datagram: &[u8], target: SocketAddr) {
            self.datagrams.lock().push((datagram.to_vec(), target));
        }

        fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
            self.packets.lock().push(packet.to_vec());
            Ok(())
        }
    }

    impl Capture {
        fn take_datagrams(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            std::mem::take(&mut *self.datagrams.lock())
        }
    }

    fn peer(public_key: PublicKey, endpoint: Option<SocketAddr>, allowed: &str) -> PeerInit {
        PeerInit {
            public_key,
            preshared_key: None,
            allowed_ips: vec![allowed.parse().unwrap()],
            endpoint,
            persistent_keepalive: None,
        }
    }

    fn ipv4_packet(source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[8] = 64;
        packet[9] = 17;
        packet[12..16].copy_from_slice(&source.octets());
        packet[16..20].copy_from_slice(&destination.octets());
        packet
    }

    #[test]
    fn rejects_use_before_init() {
        let engine = BoringEngine::new();
        let (_, public) = x25519::keypair();
        assert_eq!(
            engine.add_peer(peer(public, None, "0.0.0.0/0")).unwrap_err(),
            EngineError::NotInitialized
        );

        let (secret, _) = x25519::keypair();
        engine.init(secret.clone(), 0).unwrap();
        assert_eq!(engine.init(secret, 0), Err(EngineError::AlreadyInitialized));
        assert_eq!(engine.listen_port(), Some(0));
    }

    #[test]
    fn connect_without_endpoint_sends_nothing() {
        let engine = BoringEngine::new();
        let (secret, _) = x25519::keypair();
        let (_, public) = x25519::keypair();
        engine.init(secret, 51820).unwrap();
        let index = engine.add_peer(peer(public, None, "0.0.0.0/0")).unwrap();

        let capture = Capture::default();
        engine.connect(index, &capture).unwrap();
        assert!(capture.take_datagrams().is_empty());
        assert_eq!(
            engine.connect(PeerIndex(index.0 ^ 1), &capture),
            Err(EngineError::UnknownPeer(PeerIndex(index.0 ^ 1)))
        );
    }

    #[test]
    fn garbage_is_dropped() {
        let engine = BoringEngine::new();
        let (secret, _) = x25519::keypair();
        engine.init(secret, 0).unwrap();

        let capture = Capture::default();
        let sender = SocketAddr::from(([192, 0, 2, 1], 4000));
        engine.inbound(&capture, &[], sender).unwrap();
        engine.inbound(&capture, &[1, 2, 3, 4, 5], sender).unwrap();
        assert!(capture.take_datagrams().is_empty());
        assert!(capture.packets.lock().is_empty());
    }

    #[test]
    fn handshake_then_data_between_two_engines() {
        let client_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000));
        let server_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 51820));
        let (client_secret, client_public) = x25519::keypair();
        let (server_secret, server_public) = x25519::keypair();

        let client = BoringEngine::new();
        client.init(client_secret, 40000).unwrap();
        let server_index = client
            .add_peer(peer(server_public, Some(server_addr), "0.0.0.0/0"))
            .unwrap();

        let server = BoringEngine::new();
        server.init(server_secret, 51820).unwrap();
        let client_index = server
            .add_peer(peer(client_public, None, "10.1.1.100/32"))
            .unwrap();

        let to_server = Capture::default();
        let to_client = Capture::default();

        client.connect(server_index, &to_server).unwrap();
        let initiation = to_server.take_datagrams();
        assert_eq!(initiation.len(), 1);
        assert_eq!(initiation[0].1, server_addr);

        server
            .inbound(&to_client, &initiation[0].0, client_addr)
            .unwrap();
        assert_eq!(server.endpoint(client_index), Some(client_addr));
        let response = to_client.take_datagrams();
        assert_eq!(response.len(), 1);
        assert_eq!(response[0].1, client_addr);

        client
            .inbound(&to_server, &response[0].0, server_addr)
            .unwrap();
        for (datagram, _) in to_server.take_datagrams() {
            server.inbound(&to_client, &datagram, client_addr).unwrap();
        }

        let packet = ipv4_packet(Ipv4Addr::new(10, 1, 1, 100), Ipv4Addr::new(10, 1, 1, 1));
        client
            .outbound(&to_server, &packet, Ipv4Addr::new(10, 1, 1, 1).into())
            .unwrap();
        let sealed = to_server.take_datagrams();
        assert_eq!(sealed.len(), 1);
        server.inbound(&to_client, &sealed[0].0, client_addr).unwrap();

        assert_eq!(to_client.packets.lock().as_slice(), &[packet]);
    }
}
