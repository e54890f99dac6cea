//! The client interface and its lifecycle.
//!
//! ```text
//! Init -> SocketReady -> TunnelReady -> Relaying -> Draining -> Terminated
//! ```
//!
//! Each step acquires one resource. [`Interface::teardown`] releases them
//! in reverse order and skips whatever was never acquired, so it is safe to
//! call after a failure at any step.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::{
    config::Settings,
    engine::{Engine, PeerIndex, PeerInit},
    error::{Error, Result},
    relay::{self, Wire},
    script::{CommandRunner, Scripts},
    shutdown::Shutdown,
    timer::ProtocolTimer,
    transport::Endpoint,
    tun::TunDevice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    SocketReady,
    TunnelReady,
    Relaying,
    Draining,
    Terminated,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Options {
    /// Upper bound on each relay loop's readiness wait, and so on how long
    /// a loop takes to notice a shutdown
    pub poll_interval: Duration,
    /// Period of the protocol timer
    pub timer_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timer_interval: Duration::from_millis(100),
        }
    }
}

impl Options {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timer_interval(mut self, timer_interval: Duration) -> Self {
        self.timer_interval = timer_interval;
        self
    }
}

pub struct Interface<E: Engine> {
    settings: Arc<Settings>,
    engine: Arc<E>,
    options: Options,
    scripts: Scripts,
    endpoint: Option<Arc<Endpoint>>,
    tun: Option<Arc<TunDevice>>,
    timer: Option<ProtocolTimer>,
    peer: Option<PeerIndex>,
    shutdown: Shutdown,
    state: State,
}

impl<E: Engine> Interface<E> {
    pub fn new(
        settings: Arc<Settings>,
        engine: Arc<E>,
        runner: Arc<dyn CommandRunner>,
        options: Options,
    ) -> Self {
        Self {
            scripts: Scripts::new(settings.clone(), runner),
            settings,
            engine,
            options,
            endpoint: None,
            tun: None,
            timer: None,
            peer: None,
            shutdown: Shutdown::new(),
            state: State::Init,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Token that stops [`Interface::run`] when triggered
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn device_name(&self) -> Option<&str> {
        self.tun.as_deref().map(TunDevice::name)
    }

    /// Open the UDP socket, then bring up the engine with the port it
    /// actually bound to and register the peer.
    pub fn open_socket(&mut self) -> Result<u16> {
        self.expect(State::Init, "open the socket")?;

        let endpoint = Arc::new(Endpoint::open(&self.settings.interface)?);
        let port = endpoint.local_port();
        self.endpoint = Some(endpoint);
        self.scripts.set_local_port(port);

        self.engine
            .init(self.settings.interface.private_key.clone(), port)?;
        let peer = PeerInit::from_config(&self.settings.peer);
        debug!(?peer, "registering peer");
        self.peer = Some(self.engine.add_peer(peer)?);

        self.transition(State::SocketReady);
        Ok(port)
    }

    /// Allocate the TUN device and run the up-scripts
    pub fn open_tunnel(&mut self) -> Result<()> {
        self.expect(State::SocketReady, "open the tunnel")?;
        let device = TunDevice::open(self.settings.interface.tun_device.as_deref())?;
        self.attach_tunnel(device)
    }

    /// Use an already opened device in place of allocating one
    pub fn attach_tunnel(&mut self, device: TunDevice) -> Result<()> {
        self.expect(State::SocketReady, "attach a tunnel")?;

        let failures = self.scripts.up(device.name());
        if failures > 0 {
            info!(
                device = device.name(),
                failures, "up-scripts failed, the tunnel may be degraded"
            );
        }

        self.tun = Some(Arc::new(device));
        self.transition(State::TunnelReady);
        Ok(())
    }

    /// Relay until the shutdown token is triggered or a loop fails.
    ///
    /// Both loops are joined before this returns. A tunnel device failure
    /// is returned as [`Error::DeviceIo`].
    pub async fn run(&mut self) -> Result<()> {
        self.expect(State::TunnelReady, "run")?;
        let (Some(endpoint), Some(tun), Some(peer)) =
            (self.endpoint.clone(), self.tun.clone(), self.peer)
        else {
            return Err(Error::State {
                operation: "run",
                state: self.state,
            });
        };
        let wire = Wire::new(endpoint, tun);

        self.engine.connect(peer, &wire)?;

        let timer = {
            let engine = self.engine.clone();
            let wire = wire.clone();
            let shutdown = self.shutdown.clone();
            ProtocolTimer::start(
                self.options.timer_interval,
                self.shutdown.clone(),
                move || {
                    if let Err(err) = engine.update_timers(&wire) {
                        error!("tunnel device write failed: {err}");
                        shutdown.trigger();
                    }
                },
            )?
        };
        self.timer = Some(timer);
        self.transition(State::Relaying);

        let poll = self.options.poll_interval;
        let socket = spawn_loop(
            self.shutdown.clone(),
            relay::socket_loop(self.engine.clone(), wire.clone(), self.shutdown.clone(), poll),
        );
        let tunnel = spawn_loop(
            self.shutdown.clone(),
            relay::tunnel_loop(self.engine.clone(), wire, self.shutdown.clone(), poll),
        );

        self.shutdown.triggered().await;
        self.transition(State::Draining);

        let (socket, tunnel) = tokio::join!(socket, tunnel);
        joined(socket).and(joined(tunnel))
    }

    /// Release everything that was acquired, newest first: timer, tunnel
    /// device (running the down-scripts), socket, engine.
    pub fn teardown(mut self) {
        self.shutdown.trigger();

        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        if let Some(tun) = self.tun.take() {
            tun.close(&self.scripts);
        }
        if self.endpoint.take().is_some() {
            debug!("socket closed");
        }
        self.peer = None;

        self.transition(State::Terminated);
    }

    fn expect(&self, state: State, operation: &'static str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::State {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, state: State) {
        info!(from = ?self.state, to = ?state, "interface state");
        self.state = state;
    }
}

impl<E: Engine> std::fmt::Debug for Interface<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("state", &self.state)
            .field("endpoint", &self.endpoint)
            .field("tun", &self.tun)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Triggers the token when the loop ends, including by panic, so the
/// controller never waits on a loop that is gone.
struct TriggerOnExit(Shutdown);

impl Drop for TriggerOnExit {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

fn spawn_loop<F>(shutdown: Shutdown, relay: F) -> tokio::task::JoinHandle<Result<()>>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let _exit = TriggerOnExit(shutdown);
        let result = relay.await;
        if let Err(err) = &result {
            error!("{err}");
        }
        result
    })
}

fn joined(result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Cancelled along with the runtime.
        Err(_) => Ok(()),
    }
}
