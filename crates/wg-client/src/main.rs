use std::{ffi::CStr, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use syslog_tracing::{Facility, Options as SyslogOptions, Syslog};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wg_relay::{config, script::ShellRunner, shutdown, BoringEngine, Interface, Options, Settings};

mod process;

#[derive(Debug, Parser)]
#[command(name = "wg-client")]
#[command(about = "Userspace WireGuard VPN client", version)]
struct Args {
    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,
    /// Debug mode, implies --verbose
    #[arg(short, long)]
    debug: bool,
    /// Fork in background
    #[arg(short = 'D', long)]
    daemon: bool,
    /// Lock the memory into RAM
    #[arg(short, long)]
    mlock: bool,
    /// Write the pid into FILE when running in background
    #[arg(short, long, value_name = "FILE")]
    pidfile: Option<PathBuf>,
    /// Configuration file
    #[arg(default_value = config::DEFAULT_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            err.print().ok();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if args.mlock {
        if let Err(err) = process::lock_memory() {
            eprintln!("unable to lock the memory: {err}");
            return ExitCode::FAILURE;
        }
    }

    let settings = Settings::load(&args.config);
    let debug = args.debug || matches!(&settings, Ok(s) if s.debug);

    if args.daemon {
        println!("Going in background...");
        if let Err(err) = process::daemonize() {
            eprintln!("unable to daemonize: {err}");
            return ExitCode::FAILURE;
        }
    }

    init_logging(args.daemon, log_level(args.daemon, debug, args.verbose));

    let settings = match settings {
        Ok(settings) => settings,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let _pidfile = if args.daemon {
        let path = args
            .pidfile
            .unwrap_or_else(|| PathBuf::from(process::DEFAULT_PID_FILE));
        process::PidFile::create(&path)
            .map_err(|err| warn!(path = %path.display(), "could not write the pid file: {err}"))
            .ok()
    } else {
        None
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("could not start the runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<wg_relay::Error>()
                .and_then(wg_relay::Error::raw_os_error);
            error!(code = ?code, "{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn log_level(daemon: bool, debug: bool, verbose: bool) -> &'static str {
    match (daemon, debug, verbose) {
        (true, _, _) => "warn",
        (false, true, _) => "debug",
        (false, false, true) => "info",
        (false, false, false) => "warn",
    }
}

/// Stdout is gone once daemonized, so a daemon logs to syslog
fn init_logging(daemon: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match daemon.then(syslog).flatten() {
        Some(writer) => subscriber
            .with_ansi(false)
            .without_time()
            .with_writer(writer)
            .init(),
        None => subscriber.init(),
    }
}

fn syslog() -> Option<Syslog> {
    let identity = CStr::from_bytes_with_nul(b"wg-client\0").ok()?;
    Syslog::new(identity, SyslogOptions::LOG_PID, Facility::Daemon)
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let mut interface = Interface::new(
        Arc::new(settings),
        Arc::new(BoringEngine::new()),
        Arc::new(ShellRunner),
        Options::default(),
    );
    let listener = shutdown::listen(interface.shutdown().clone())
        .context("could not install the signal handlers")?;

    let result = start(&mut interface).await;

    interface.teardown();
    listener.await.ok();
    result
}

async fn start(interface: &mut Interface<BoringEngine>) -> anyhow::Result<()> {
    let port = interface
        .open_socket()
        .context("could not set up the UDP socket")?;
    info!(port, "UDP socket ready");

    interface
        .open_tunnel()
        .context("could not create the TUN device")?;

    info!("starting WireGuard VPN");
    interface.run().await.context("relay stopped")
}
