//! Linux TUN device.

use std::{
    ffi::CStr,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::Arc,
};

use libc::{c_char, c_short, c_ulong, c_void, IFF_NO_PI, IFF_TUN, IFNAMSIZ, O_NONBLOCK, O_RDWR};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use crate::{
    config,
    error::{Error, Result},
    script::Scripts,
};

/// `_IOW('T', 202, int)`
const TUNSETIFF: c_ulong = 0x400454ca;
/// `_IOW('T', 200, int)`
const TUNSETNOCSUM: c_ulong = 0x400454c8;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Allocate a TUN interface from `/dev/net/tun`.
    ///
    /// Frames carry no packet information header and the kernel is told not
    /// to verify checksums. With no `name` the kernel picks the next free
    /// `tunN`.
    pub fn open(name: Option<&str>) -> Result<Self> {
        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
            _pad: [0; 22],
        };
        if let Some(name) = name {
            if name.len() > config::MAX_IFNAME_LEN || name.as_bytes().contains(&0) {
                return Err(Error::Tunnel {
                    context: "invalid interface name",
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                });
            }
            for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
                *dst = src as c_char;
            }
        }

        let fd = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const c_char,
                O_RDWR | O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::Tunnel {
                context: "could not open /dev/net/tun",
                source: io::Error::last_os_error(),
            });
        }
        // From here on the descriptor is closed on every early return.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut _ as *mut c_void) }
            < 0
        {
            return Err(Error::Tunnel {
                context: "ioctl TUNSETIFF",
                source: io::Error::last_os_error(),
            });
        }
        if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETNOCSUM as _, 1 as libc::c_ulong) } < 0 {
            return Err(Error::Tunnel {
                context: "ioctl TUNSETNOCSUM",
                source: io::Error::last_os_error(),
            });
        }

        let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        info!(device = %name, "TUN interface created");

        Self::from_fd(fd, name).map_err(Error::tunnel("could not register the device"))
    }

    /// Wrap an already configured descriptor. It is switched to
    /// non-blocking mode and must preserve frame boundaries.
    pub fn from_fd(fd: OwnedFd, name: impl Into<String>) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(raw, libc::F_SETFL, flags | O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: name.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one frame, waiting for the device to become readable
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| read(fd.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one frame without waiting
    pub fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.fd.get_ref().as_raw_fd(),
                frame.as_ptr() as *const c_void,
                frame.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Run the down-scripts, then release the descriptor. The kernel
    /// removes the interface once its last descriptor is closed.
    pub fn close(self: Arc<Self>, scripts: &Scripts) {
        scripts.down(&self.name);
        if let Err(device) = Arc::try_unwrap(self) {
            debug!(device = %device.name, "TUN device still referenced at close");
        }
    }
}

fn read(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("fd", &self.fd.get_ref().as_raw_fd())
            .finish()
    }
}
