//! The UDP socket WireGuard messages travel over.

use std::{
    io,
    net::{SocketAddr, SocketAddrV4},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::{
    config,
    error::{Error, Result},
};

#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl Endpoint {
    /// Open the socket, non-blocking and registered with the current tokio
    /// runtime.
    ///
    /// When `listen_port` is `0` the OS picks the port; [`Endpoint::local_port`]
    /// reports the one it picked.
    pub fn open(config: &config::Interface) -> Result<Self> {
        debug!("creating the UDP socket");
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::transport("could not create the socket"))?;
        socket
            .set_nonblocking(true)
            .map_err(Error::transport("could not set non-blocking mode"))?;

        if let Some(name) = &config.bind_interface {
            bind_device(&socket, name)?;
        }

        let address = SocketAddrV4::new(config.local_address, config.listen_port);
        socket
            .bind(&SockAddr::from(address))
            .map_err(Error::transport("could not bind the socket"))?;

        let local_addr = bound_address(&socket)?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(Error::transport("could not register the socket"))?;
        info!(%local_addr, "UDP socket opened");

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.try_recv_from(buf)
    }

    pub fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.try_send_to(buf, target)
    }
}

fn bound_address(socket: &Socket) -> Result<SocketAddrV4> {
    let address = socket
        .local_addr()
        .map_err(Error::transport("could not read the bound address"))?;
    address.as_socket_ipv4().ok_or_else(|| Error::Transport {
        context: "socket is not bound to an IPv4 address",
        source: io::Error::from(io::ErrorKind::AddrNotAvailable),
    })
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &Socket, name: &str) -> Result<()> {
    if name.len() > config::MAX_IFNAME_LEN {
        return Err(Error::Transport {
            context: "interface name is too long",
            source: io::Error::from(io::ErrorKind::InvalidInput),
        });
    }
    socket
        .bind_device(Some(name.as_bytes()))
        .map_err(Error::transport("could not bind the socket to the interface"))?;
    debug!(interface = name, "socket bound to interface");
    Ok(())
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_: &Socket, name: &str) -> Result<()> {
    Err(Error::Transport {
        context: "binding to an interface is not supported on this platform",
        source: io::Error::new(io::ErrorKind::Unsupported, name.to_owned()),
    })
}
