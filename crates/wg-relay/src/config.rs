//! Client settings and the `key=value` file they are read from.

use std::{
    fmt, fs, io,
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    str::FromStr,
};

use ipnet::Ipv4Net;

use crate::x25519::{self, PublicKey, StaticSecret, KEY_LEN};

pub const DEFAULT_PATH: &str = "/etc/wireguard.conf";
pub const DEFAULT_PORT: u16 = 51820;
pub const DEFAULT_MTU: u16 = 1420;
pub const DEFAULT_TUN_DEVICE: &str = "tun0";

/// Longest interface name the kernel accepts, without the trailing nul
pub const MAX_IFNAME_LEN: usize = libc::IFNAMSIZ - 1;

const MIN_MTU: u16 = 576;

#[derive(Debug)]
pub struct Settings {
    pub interface: Interface,
    pub peer: Peer,
    pub debug: bool,
}

pub struct Interface {
    /// Address the UDP socket binds to
    pub local_address: Ipv4Addr,
    /// UDP port, `0` lets the OS choose
    pub listen_port: u16,
    pub bind_interface: Option<String>,
    pub private_key: StaticSecret,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub prefix_len: u8,
    /// Rendered verbatim by the `%N` script marker
    pub network: String,
    pub mtu: u16,
    /// `None` lets the kernel pick a `tunN` name
    pub tun_device: Option<String>,
    pub exec_up: Option<Vec<String>>,
    pub exec_down: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub address: Ipv4Addr,
    pub endpoint: SocketAddrV4,
    pub public_key: PublicKey,
    pub preshared_key: Option<[u8; KEY_LEN]>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<Ipv4Net>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: invalid value for `{key}`: {reason}")]
    Invalid {
        line: usize,
        key: String,
        reason: String,
    },
    #[error("missing required key `{0}`")]
    Missing(&'static str),
}

impl Interface {
    /// Network address of the VPN subnet
    pub fn subnet(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask))
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        contents.parse()
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut builder = Builder::default();

        for (index, line) in s.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            builder.set(index + 1, key.trim(), value.trim())?;
        }

        builder.finish()
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("local_address", &self.local_address)
            .field("listen_port", &self.listen_port)
            .field("bind_interface", &self.bind_interface)
            .field("address", &self.address)
            .field("netmask", &self.netmask)
            .field("prefix_len", &self.prefix_len)
            .field("network", &self.network)
            .field("mtu", &self.mtu)
            .field("tun_device", &self.tun_device)
            .field("exec_up", &self.exec_up)
            .field("exec_down", &self.exec_down)
            .finish_non_exhaustive()
    }
}

struct Builder {
    debug: bool,
    local_address: Ipv4Addr,
    listen_port: u16,
    bind_interface: Option<String>,
    private_key: Option<StaticSecret>,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    prefix_len: u8,
    network: String,
    mtu: u16,
    tun_device: Option<String>,
    exec_up: Option<Vec<String>>,
    exec_down: Option<Vec<String>>,
    peer_address: Ipv4Addr,
    endpoint_address: Ipv4Addr,
    endpoint_port: u16,
    public_key: Option<PublicKey>,
    preshared_key: Option<[u8; KEY_LEN]>,
    persistent_keepalive: Option<u16>,
    allowed_ips: Vec<Ipv4Net>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            debug: false,
            local_address: Ipv4Addr::UNSPECIFIED,
            listen_port: DEFAULT_PORT,
            bind_interface: None,
            private_key: None,
            address: Ipv4Addr::new(10, 1, 1, 100),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            prefix_len: 24,
            network: String::from("10.1.1.0/24"),
            mtu: DEFAULT_MTU,
            tun_device: Some(String::from(DEFAULT_TUN_DEVICE)),
            exec_up: None,
            exec_down: None,
            peer_address: Ipv4Addr::UNSPECIFIED,
            endpoint_address: Ipv4Addr::UNSPECIFIED,
            endpoint_port: DEFAULT_PORT,
            public_key: None,
            preshared_key: None,
            persistent_keepalive: None,
            allowed_ips: Vec::new(),
        }
    }
}

impl Builder {
    fn set(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "debug" => self.debug = parse::<i64>(line, key, value)? != 0,
            "local_ip_address" => self.local_address = parse(line, key, value)?,
            "local_wg_port" => self.listen_port = parse(line, key, value)?,
            "bind_interface" => {
                self.bind_interface = interface_name(value).map_err(|e| invalid(line, key, e))?
            }
            "local_wg_private_key" => {
                let key_bytes = x25519::decode(value).map_err(|e| invalid(line, key, e))?;
                self.private_key = Some(StaticSecret::from(key_bytes));
            }
            "my_vpn_ip_address" => self.address = parse(line, key, value)?,
            "my_vpn_netmask" => self.netmask = parse(line, key, value)?,
            "my_vpn_netmask_CIDR" => {
                let prefix_len: u8 = parse(line, key, value)?;
                if prefix_len > 32 {
                    return Err(invalid(line, key, "prefix length must be <= 32"));
                }
                self.prefix_len = prefix_len;
            }
            "my_vpn_network" => self.network = value.to_owned(),
            "tun_mtu" => {
                let mtu: u16 = parse(line, key, value)?;
                if mtu < MIN_MTU {
                    return Err(invalid(line, key, format!("mtu must be >= {MIN_MTU}")));
                }
                self.mtu = mtu;
            }
            "tun_device" => {
                self.tun_device = interface_name(value).map_err(|e| invalid(line, key, e))?
            }
            "exec_up" => self.exec_up = Some(commands(value)),
            "exec_down" => self.exec_down = Some(commands(value)),
            "peer_vpn_ip_address" => self.peer_address = parse(line, key, value)?,
            "endpoint_ip_address" => self.endpoint_address = parse(line, key, value)?,
            "peer_wg_port" => self.endpoint_port = parse(line, key, value)?,
            "peer_wg_public_key" => {
                let key_bytes = x25519::decode(value).map_err(|e| invalid(line, key, e))?;
                self.public_key = Some(PublicKey::from(key_bytes));
            }
            "peer_wg_preshared_key" => {
                self.preshared_key = Some(x25519::decode(value).map_err(|e| invalid(line, key, e))?)
            }
            "persistent_keepalive" => {
                let seconds: u16 = parse(line, key, value)?;
                self.persistent_keepalive = (seconds != 0).then_some(seconds);
            }
            "allowed_ips" => {
                self.allowed_ips = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Ipv4Net::from_str)
                    .collect::<Result<_, _>>()
                    .map_err(|e| invalid(line, key, e))?
            }
            _ => tracing::debug!(line, key, "ignoring unknown configuration key"),
        }
        Ok(())
    }

    fn finish(self) -> Result<Settings, ConfigError> {
        let private_key = self
            .private_key
            .ok_or(ConfigError::Missing("local_wg_private_key"))?;
        let public_key = self
            .public_key
            .ok_or(ConfigError::Missing("peer_wg_public_key"))?;

        Ok(Settings {
            interface: Interface {
                local_address: self.local_address,
                listen_port: self.listen_port,
                bind_interface: self.bind_interface,
                private_key,
                address: self.address,
                netmask: self.netmask,
                prefix_len: self.prefix_len,
                network: self.network,
                mtu: self.mtu,
                tun_device: self.tun_device,
                exec_up: self.exec_up,
                exec_down: self.exec_down,
            },
            peer: Peer {
                address: self.peer_address,
                endpoint: SocketAddrV4::new(self.endpoint_address, self.endpoint_port),
                public_key,
                preshared_key: self.preshared_key,
                persistent_keepalive: self.persistent_keepalive,
                allowed_ips: self.allowed_ips,
            },
            debug: self.debug,
        })
    }
}

fn parse<T>(line: usize, key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e| invalid(line, key, e))
}

fn invalid(line: usize, key: &str, reason: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        line,
        key: key.to_owned(),
        reason: reason.to_string(),
    }
}

fn interface_name(value: &str) -> Result<Option<String>, String> {
    match value.len() {
        0 => Ok(None),
        len if len > MAX_IFNAME_LEN => Err(format!(
            "interface name is {len} bytes, at most {MAX_IFNAME_LEN} allowed"
        )),
        _ => Ok(Some(value.to_owned())),
    }
}

fn commands(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
