//! Linux TUN device
//!
//! Opens `/dev/net/tun` in non-blocking mode and drives the descriptor
//! through tokio's reactor. Address, MTU and link state are set with `ip`.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{TunDevice, TunFactory};
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int)
// PowerPC encodes ioctl direction bits differently from x86/ARM:
//   x86/ARM: _IOC_WRITE = 1  → TUNSETIFF = 0x400454ca
//   PowerPC: _IOC_WRITE = 4  → TUNSETIFF = 0x800454ca
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A Linux TUN device
pub struct LinuxTun {
    fd: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
    name: String,
}

impl LinuxTun {
    /// Create a new TUN device with the given name (`%d` patterns allowed)
    pub fn create(name: &str) -> Result<Self> {
        let raw = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(Error::Device(format!(
                "failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }
        // From here on the descriptor is closed on every early return
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF as _, &mut req as *mut Ifreq) };
        if ret < 0 {
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let actual_name = String::from_utf8_lossy(&req.ifr_name)
            .trim_end_matches('\0')
            .to_string();
        let fd = AsyncFd::new(owned)?;
        info!("TUN device {} created", actual_name);

        Ok(Self {
            fd: Mutex::new(Some(Arc::new(fd))),
            name: actual_name,
        })
    }

    /// Assign the address, set the MTU and bring the link up
    pub async fn configure(&self, address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<()> {
        run_ip(&["addr", "add", &format!("{}/{}", address, prefix_len), "dev", &self.name]).await?;

        if let Err(e) = run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()]).await {
            warn!("Failed to set MTU on {}: {}", self.name, e);
        }

        run_ip(&["link", "set", "dev", &self.name, "up"]).await?;
        info!("TUN device {} up with {}/{} (mtu {})", self.name, address, prefix_len, mtu);
        Ok(())
    }

    fn handle(&self) -> Result<Arc<AsyncFd<OwnedFd>>> {
        self.fd
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(Error::Closed)
    }
}

fn sys_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sys_write(fd: RawFd, data: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.handle()?;
        loop {
            let mut guard = fd.readable().await?;
            match guard.try_io(|inner| sys_read(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, packet: &[u8]) -> Result<()> {
        let fd = self.handle()?;
        loop {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| sys_write(inner.get_ref().as_raw_fd(), packet)) {
                Ok(Ok(written)) if written == packet.len() => return Ok(()),
                Ok(Ok(written)) => {
                    return Err(Error::ShortWrite { written, expected: packet.len() });
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        let taken = self
            .fd
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if taken.is_some() {
            debug!("TUN device {} closed", self.name);
        }
    }
}

/// Creates [`LinuxTun`] devices with a fixed name and MTU
#[derive(Debug, Clone)]
pub struct LinuxTunFactory {
    name: String,
    mtu: u16,
}

impl LinuxTunFactory {
    pub fn new(name: impl Into<String>, mtu: u16) -> Self {
        Self { name: name.into(), mtu }
    }
}

#[async_trait]
impl TunFactory for LinuxTunFactory {
    async fn open(&self, address: Ipv4Addr, prefix_len: u8) -> Result<Arc<dyn TunDevice>> {
        let tun = LinuxTun::create(&self.name)?;
        if let Err(e) = tun.configure(address, prefix_len, self.mtu).await {
            tun.close();
            return Err(e);
        }
        let tun: Arc<dyn TunDevice> = Arc::new(tun);
        Ok(tun)
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip").args(args).status().await?;
    if !status.success() {
        return Err(Error::Device(format!("`ip {}` failed: {}", args.join(" "), status)));
    }
    Ok(())
}
