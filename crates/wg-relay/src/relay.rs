//! The two relay directions.
//!
//! Each loop waits for its descriptor with a bounded timeout, so a
//! triggered [`Shutdown`] is noticed within one poll interval even when no
//! traffic flows. The loops never wait on each other.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use boringtun::noise::Tunn;
use tokio::time;
use tracing::{debug, trace};

use crate::{
    engine::{Egress, Engine},
    error::{Error, Result},
    shutdown::Shutdown,
    transport::Endpoint,
    tun::TunDevice,
};

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65535;

/// Engine output routed to the real socket and tunnel device
#[derive(Debug, Clone)]
pub struct Wire {
    endpoint: Arc<Endpoint>,
    tun: Arc<TunDevice>,
}

impl Wire {
    pub fn new(endpoint: Arc<Endpoint>, tun: Arc<TunDevice>) -> Self {
        Self { endpoint, tun }
    }
}

impl Egress for Wire {
    fn send_datagram(&self, datagram: &[u8], target: SocketAddr) {
        if let Err(err) = self.endpoint.try_send_to(datagram, target) {
            debug!(%target, "could not send datagram: {err}");
        }
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        match self.tun.send(packet) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(device = self.tun.name(), "tunnel queue full, dropping packet");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Peer to tunnel: drain every pending datagram into the engine
pub async fn socket_loop<E: Engine>(
    engine: Arc<E>,
    wire: Wire,
    shutdown: Shutdown,
    poll_interval: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !shutdown.is_triggered() {
        match time::timeout(poll_interval, wire.endpoint.socket().readable()).await {
            Err(_) => continue,
            Ok(Err(err)) => {
                debug!("socket readiness: {err}");
                continue;
            }
            Ok(Ok(())) => {}
        }

        loop {
            match wire.endpoint.try_recv_from(&mut buf) {
                Ok((len, sender)) => {
                    trace!(%sender, len, "datagram");
                    engine
                        .inbound(&wire, &buf[..len], sender)
                        .map_err(Error::DeviceIo)?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!("receive failed: {err}");
                    break;
                }
            }
        }
    }

    debug!("socket loop finished");
    Ok(())
}

/// Tunnel to peer: one frame per wakeup into the engine
pub async fn tunnel_loop<E: Engine>(
    engine: Arc<E>,
    wire: Wire,
    shutdown: Shutdown,
    poll_interval: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while !shutdown.is_triggered() {
        let len = match time::timeout(poll_interval, wire.tun.recv(&mut buf)).await {
            Err(_) => continue,
            Ok(result) => result.map_err(Error::DeviceIo)?,
        };
        let frame = &buf[..len];

        let Some(destination) = Tunn::dst_address(frame) else {
            trace!(len, "dropping frame without an IP destination");
            continue;
        };
        trace!(%destination, len, "frame");
        engine
            .outbound(&wire, frame, destination)
            .map_err(Error::DeviceIo)?;
    }

    debug!("tunnel loop finished");
    Ok(())
}
