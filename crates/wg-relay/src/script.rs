//! Up and down scripts run around the lifetime of the tunnel device.
//!
//! Command templates may contain `%` markers:
//!
//! | marker | expands to |
//! |---|---|
//! | `%D` | device name, single-quoted |
//! | `%V` | VPN address |
//! | `%M` | MTU |
//! | `%N` | VPN network string, single-quoted |
//! | `%n` | VPN netmask |
//! | `%P` | local UDP port |
//! | `%I` | local address |
//! | `%%` | `%` |
//!
//! Any other marker is kept as written.

use std::{fmt::Write, process::Command, sync::Arc};

use tracing::{debug, warn};

use crate::{config::Settings, error::ScriptError};

/// Runs one rendered command
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<(), ScriptError>;
}

/// Hands commands to `/bin/sh -c`
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<(), ScriptError> {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .status()
            .map_err(|source| ScriptError::Spawn {
                command: command.to_owned(),
                source,
            })?;

        match status.code() {
            Some(0) => Ok(()),
            Some(status) => Err(ScriptError::Status {
                command: command.to_owned(),
                status,
            }),
            None => Err(ScriptError::Signaled {
                command: command.to_owned(),
            }),
        }
    }
}

/// Values the markers expand to
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub device: &'a str,
    pub settings: &'a Settings,
    /// The port the socket actually bound to
    pub local_port: u16,
}

pub fn render(template: &str, ctx: &ScriptContext<'_>) -> String {
    let interface = &ctx.settings.interface;
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        // Writing into a String cannot fail.
        let _ = match chars.next() {
            Some('%') => write!(out, "%"),
            Some('D') => write!(out, "'{}'", ctx.device),
            Some('V') => write!(out, "{}", interface.address),
            Some('M') => write!(out, "{}", interface.mtu),
            Some('N') => write!(out, "'{}'", interface.network),
            Some('n') => write!(out, "{}", interface.netmask),
            Some('P') => write!(out, "{}", ctx.local_port),
            Some('I') => write!(out, "{}", interface.local_address),
            Some(other) => write!(out, "%{other}"),
            None => write!(out, "%"),
        };
    }

    out
}

/// Address the interface, route the VPN subnet and every allowed network
/// through the peer, then bring the link up.
pub fn default_up(ctx: &ScriptContext<'_>) -> Vec<String> {
    let interface = &ctx.settings.interface;
    let peer = &ctx.settings.peer;

    let mut commands = vec![
        format!(
            "ifconfig {} {} netmask {} up > /dev/null 2>&1",
            ctx.device, interface.address, interface.netmask
        ),
        format!(
            "route add -net {}/{} gw {} > /dev/null 2>&1",
            interface.subnet(),
            interface.prefix_len,
            peer.address
        ),
    ];
    commands.extend(
        peer.allowed_ips
            .iter()
            .map(|net| format!("route add -net {net} gw {} > /dev/null 2>&1", peer.address)),
    );
    commands.push(format!(
        "ip link set dev {} mtu {} up > /dev/null 2>&1",
        ctx.device, interface.mtu
    ));
    commands
}

/// Only the address assignment is undone. Routes go away with the device.
pub fn default_down(ctx: &ScriptContext<'_>) -> Vec<String> {
    let interface = &ctx.settings.interface;
    vec![format!(
        "ip addr del {}/{} dev {} > /dev/null 2>&1",
        interface.address, interface.prefix_len, ctx.device
    )]
}

/// The configured up and down sequences bound to a runner
#[derive(Clone)]
pub struct Scripts {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
    local_port: u16,
}

impl Scripts {
    pub fn new(settings: Arc<Settings>, runner: Arc<dyn CommandRunner>) -> Self {
        let local_port = settings.interface.listen_port;
        Self {
            settings,
            runner,
            local_port,
        }
    }

    /// Record the port the socket resolved to, for `%P`
    pub fn set_local_port(&mut self, port: u16) {
        self.local_port = port;
    }

    /// Run the up sequence for `device`. Returns how many commands failed.
    pub fn up(&self, device: &str) -> usize {
        let ctx = self.context(device);
        let commands = match &self.settings.interface.exec_up {
            Some(templates) => templates.iter().map(|t| render(t, &ctx)).collect(),
            None => default_up(&ctx),
        };
        self.run_all("up", &commands)
    }

    /// Run the down sequence for `device`. Returns how many commands failed.
    pub fn down(&self, device: &str) -> usize {
        let ctx = self.context(device);
        let commands = match &self.settings.interface.exec_down {
            Some(templates) => templates.iter().map(|t| render(t, &ctx)).collect(),
            None => default_down(&ctx),
        };
        self.run_all("down", &commands)
    }

    fn context<'a>(&'a self, device: &'a str) -> ScriptContext<'a> {
        ScriptContext {
            device,
            settings: &self.settings,
            local_port: self.local_port,
        }
    }

    fn run_all(&self, phase: &'static str, commands: &[String]) -> usize {
        let mut failures = 0;
        for command in commands {
            debug!(phase, command = command.as_str(), "running");
            if let Err(err) = self.runner.run(command) {
                warn!(phase, "{err}");
                failures += 1;
            }
        }
        failures
    }
}

impl std::fmt::Debug for Scripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts")
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}
