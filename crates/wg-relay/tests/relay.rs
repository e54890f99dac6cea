use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::unix::net::UnixDatagram as StdUnixDatagram,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    net::{UdpSocket, UnixDatagram},
    task::JoinHandle,
    time::timeout,
};
use wg_relay::{
    engine::{Egress, EngineError, PeerIndex, PeerInit},
    script::CommandRunner,
    tun::TunDevice,
    x25519::{self, StaticSecret},
    Engine, Error, Interface, Options, ScriptError, Settings, State,
};

const POLL: Duration = Duration::from_millis(50);

/// Delivers every datagram to the tunnel as-is and sends every frame to the
/// peer endpoint unchanged.
#[derive(Default)]
struct Loopback {
    peer: Mutex<Option<SocketAddr>>,
    inbound: AtomicUsize,
    outbound: AtomicUsize,
    connects: AtomicUsize,
}

impl Engine for Loopback {
    fn init(&self, _: StaticSecret, _: u16) -> Result<(), EngineError> {
        Ok(())
    }

    fn add_peer(&self, peer: PeerInit) -> Result<PeerIndex, EngineError> {
        *self.peer.lock() = peer.endpoint;
        Ok(PeerIndex(1))
    }

    fn connect(&self, _: PeerIndex, _: &dyn Egress) -> Result<(), EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn inbound(&self, egress: &dyn Egress, payload: &[u8], _: SocketAddr) -> io::Result<()> {
        self.inbound.fetch_add(1, Ordering::SeqCst);
        egress.write_packet(payload)
    }

    fn outbound(&self, egress: &dyn Egress, packet: &[u8], _: IpAddr) -> io::Result<()> {
        self.outbound.fetch_add(1, Ordering::SeqCst);
        if let Some(peer) = *self.peer.lock() {
            egress.send_datagram(packet, peer);
        }
        Ok(())
    }

    fn update_timers(&self, _: &dyn Egress) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<String>>,
    failing: Vec<&'static str>,
}

impl CommandRunner for Recorder {
    fn run(&self, command: &str) -> Result<(), ScriptError> {
        self.commands.lock().push(command.to_owned());
        if self.failing.iter().any(|f| *f == command) {
            return Err(ScriptError::Status {
                command: command.to_owned(),
                status: 1,
            });
        }
        Ok(())
    }
}

struct Harness {
    interface: JoinHandle<(Interface<Loopback>, wg_relay::Result<()>)>,
    shutdown: wg_relay::Shutdown,
    engine: Arc<Loopback>,
    /// Host side of the tunnel device
    host: UnixDatagram,
    /// The remote WireGuard peer
    peer: UdpSocket,
    local: SocketAddr,
}

fn settings(peer_port: u16, extra: &str) -> Arc<Settings> {
    let (secret, _) = x25519::keypair();
    let (_, public) = x25519::keypair();
    let text = format!(
        "local_ip_address=127.0.0.1\nlocal_wg_port=0\n\
         endpoint_ip_address=127.0.0.1\npeer_wg_port={peer_port}\n\
         local_wg_private_key={}\npeer_wg_public_key={}\n{extra}",
        x25519::encode(&secret.to_bytes()),
        x25519::encode(public.as_bytes()),
    );
    Arc::new(text.parse().unwrap())
}

fn frame(seq: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 28];
    frame[0] = 0x45;
    frame[12..16].copy_from_slice(&[10, 1, 1, 100]);
    frame[16..20].copy_from_slice(&[192, 168, 10, 7]);
    frame[27] = seq;
    frame
}

async fn start(runner: Arc<Recorder>, extra: &str) -> Harness {
    let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let settings = settings(peer.local_addr().unwrap().port(), extra);
    let engine = Arc::new(Loopback::default());

    let mut interface = Interface::new(
        settings,
        engine.clone(),
        runner,
        Options::default()
            .with_poll_interval(POLL)
            .with_timer_interval(Duration::from_millis(20)),
    );
    let port = interface.open_socket().unwrap();

    let (device, host) = StdUnixDatagram::pair().unwrap();
    interface
        .attach_tunnel(TunDevice::from_fd(device.into(), "tun-test").unwrap())
        .unwrap();
    assert_eq!(interface.state(), State::TunnelReady);

    host.set_nonblocking(true).unwrap();
    let host = UnixDatagram::from_std(host).unwrap();
    let shutdown = interface.shutdown().clone();

    let interface = tokio::spawn(async move {
        let result = interface.run().await;
        (interface, result)
    });
    connected(&engine).await;

    Harness {
        interface,
        shutdown,
        engine,
        host,
        peer,
        local: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
    }
}

/// Wait until `run` has started the handshake
async fn connected(engine: &Loopback) {
    timeout(Duration::from_secs(2), async {
        while engine.connects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

async fn stop(harness: Harness) -> (Interface<Loopback>, wg_relay::Result<()>) {
    harness.shutdown.trigger();
    timeout(POLL * 4, harness.interface).await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_burst_reaches_the_tunnel() {
    let harness = start(Arc::default(), "").await;

    for seq in 0..8 {
        harness.peer.send_to(&frame(seq), harness.local).await.unwrap();
    }

    let mut buf = [0u8; 128];
    for seq in 0..8 {
        let len = timeout(Duration::from_secs(2), harness.host.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &frame(seq)[..]);
    }
    assert_eq!(harness.engine.inbound.load(Ordering::SeqCst), 8);
    assert_eq!(harness.engine.outbound.load(Ordering::SeqCst), 0);

    let (interface, result) = stop(harness).await;
    result.unwrap();
    interface.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbound_frames_reach_the_peer() {
    let harness = start(Arc::default(), "").await;
    assert_eq!(harness.engine.connects.load(Ordering::SeqCst), 1);

    for seq in 0..8 {
        harness.host.send(&frame(seq)).await.unwrap();
    }

    let mut buf = [0u8; 128];
    for seq in 0..8 {
        let (len, from) = timeout(Duration::from_secs(2), harness.peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, harness.local);
        assert_eq!(&buf[..len], &frame(seq)[..]);
    }
    assert_eq!(harness.engine.outbound.load(Ordering::SeqCst), 8);

    let (interface, result) = stop(harness).await;
    result.unwrap();
    interface.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_without_an_ip_destination_are_dropped() {
    let harness = start(Arc::default(), "").await;

    harness.host.send(&[]).await.unwrap();
    harness.host.send(&[0x45; 12]).await.unwrap();
    harness.host.send(&[0x15; 64]).await.unwrap();
    harness.host.send(&frame(3)).await.unwrap();

    let mut buf = [0u8; 128];
    let (len, _) = timeout(Duration::from_secs(2), harness.peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], &frame(3)[..]);
    assert_eq!(harness.engine.outbound.load(Ordering::SeqCst), 1);

    let (interface, result) = stop(harness).await;
    result.unwrap();
    interface.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn directions_do_not_wait_on_each_other() {
    let harness = start(Arc::default(), "").await;

    // Keep the socket side busy while the tunnel side sends.
    for seq in 0..4 {
        harness.peer.send_to(&frame(seq), harness.local).await.unwrap();
    }
    harness.host.send(&frame(100)).await.unwrap();

    let mut buf = [0u8; 128];
    let (len, _) = timeout(Duration::from_secs(2), harness.peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], &frame(100)[..]);

    for seq in 0..4 {
        let len = timeout(Duration::from_secs(2), harness.host.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &frame(seq)[..]);
    }

    let (interface, result) = stop(harness).await;
    result.unwrap();
    interface.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_converges_within_a_poll_interval() {
    let Harness {
        interface,
        shutdown,
        engine,
        host,
        peer,
        local,
    } = start(Arc::default(), "").await;
    tokio::time::sleep(POLL).await;

    let started = Instant::now();
    shutdown.trigger();
    let (interface, result) = timeout(POLL * 10, interface).await.unwrap().unwrap();
    assert!(started.elapsed() < POLL * 4);
    result.unwrap();
    assert_eq!(interface.state(), State::Draining);

    // Nothing is read from either side any more.
    host.send(&frame(1)).await.unwrap();
    peer.send_to(&frame(2), local).await.unwrap();
    tokio::time::sleep(POLL * 2).await;
    assert_eq!(engine.inbound.load(Ordering::SeqCst), 0);
    assert_eq!(engine.outbound.load(Ordering::SeqCst), 0);

    interface.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_up_script_leaves_a_usable_tunnel() {
    let runner = Arc::new(Recorder {
        failing: vec!["two"],
        ..Default::default()
    });
    let harness = start(runner.clone(), "exec_up=one;two;three\nexec_down=down %D\n").await;
    assert_eq!(*runner.commands.lock(), ["one", "two", "three"]);

    harness.host.send(&frame(9)).await.unwrap();
    let mut buf = [0u8; 128];
    let (len, _) = timeout(Duration::from_secs(2), harness.peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], &frame(9)[..]);

    let (interface, result) = stop(harness).await;
    result.unwrap();
    interface.teardown();
    assert_eq!(
        *runner.commands.lock(),
        ["one", "two", "three", "down 'tun-test'"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tunnel_write_failure_stops_the_interface() {
    let harness = start(Arc::default(), "").await;
    let Harness {
        interface,
        host,
        peer,
        local,
        ..
    } = harness;
    drop(host);

    peer.send_to(&frame(0), local).await.unwrap();

    let (interface, result) = timeout(Duration::from_secs(2), interface)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::DeviceIo(_))));
    assert!(interface.shutdown().is_triggered());
    interface.teardown();
}
