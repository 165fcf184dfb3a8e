//! Tunnel interface acquisition
//!
//! The worker asks an [`InterfaceProvider`] for a [`TunnelInterface`] before
//! starting the engine. The handle owns the device descriptor; dropping it
//! closes the descriptor, which removes a non-persistent TUN device.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;
use crate::error::{ChimneyError, ChimneyResult};
use crate::profile::ConnectionProfile;
use crate::validation;

/// Network interface the tunnel engine runs on
#[derive(Debug)]
pub struct TunnelInterface {
    name: String,
    mtu: u32,
    fd: Option<OwnedFd>,
}

impl TunnelInterface {
    /// Wrap an open device descriptor
    pub fn new(name: impl Into<String>, mtu: u32, fd: OwnedFd) -> Self {
        Self { name: name.into(), mtu, fd: Some(fd) }
    }

    /// An interface without a descriptor, for engines that open the device themselves
    pub fn detached(name: impl Into<String>, mtu: u32) -> Self {
        Self { name: name.into(), mtu, fd: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Raw descriptor, valid for as long as the interface is alive
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

impl Drop for TunnelInterface {
    fn drop(&mut self) {
        debug!("Releasing interface {}", self.name);
    }
}

/// Source of tunnel interfaces
///
/// Called on the worker thread only; implementations may block.
#[cfg_attr(test, mockall::automock)]
pub trait InterfaceProvider: Send + Sync {
    fn acquire(&self, profile: &ConnectionProfile) -> ChimneyResult<TunnelInterface>;
}

/// Linux TUN device provider
///
/// Opens `/dev/net/tun`, then configures address, MTU, link state, the
/// optional route and DNS through `ip` and `resolvectl`.
pub struct TunDeviceProvider {
    settings: TunnelSettings,
}

impl TunDeviceProvider {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    fn configure(&self, interface: &TunnelInterface, profile: &ConnectionProfile) -> ChimneyResult<()> {
        let name = interface.name();
        let address = format!("{}/{}", self.settings.address, self.settings.prefix_len);
        let mtu = interface.mtu().to_string();

        run_command("ip", &["addr", "add", &address, "dev", name])?;
        run_command("ip", &["link", "set", "dev", name, "mtu", &mtu])?;
        run_command("ip", &["link", "set", "dev", name, "up"])?;

        if let Some(route) = &self.settings.route {
            validation::validate_cidr(route)?;
            run_command("ip", &["route", "replace", route, "dev", name])?;
        }

        if self.settings.apply_dns {
            let dns = self.dns_server(profile);
            // Resolver integration is optional on many systems
            if let Err(e) = run_command("resolvectl", &["dns", name, &dns]) {
                warn!("Could not set DNS {} on {}: {}", dns, name, e);
            }
        }

        Ok(())
    }

    /// DNS server for the interface: the profile's, or the configured fallback
    pub fn dns_server(&self, profile: &ConnectionProfile) -> String {
        let dns = profile.dns_address.trim();
        match validation::validate_ip_address(dns) {
            Ok(addr) => addr.to_string(),
            Err(_) => {
                if !dns.is_empty() {
                    warn!("Ignoring DNS address '{}', using {}", dns, self.settings.fallback_dns);
                }
                self.settings.fallback_dns.clone()
            }
        }
    }
}

impl InterfaceProvider for TunDeviceProvider {
    fn acquire(&self, profile: &ConnectionProfile) -> ChimneyResult<TunnelInterface> {
        validation::validate_interface_template(&self.settings.name_template)?;
        validation::validate_mtu(self.settings.mtu)?;

        let (fd, name) = sys::open_tun(&self.settings.name_template)?;
        let interface = TunnelInterface::new(name, self.settings.mtu, fd);
        info!("Opened TUN device {}", interface.name());

        // On error the interface is dropped here and the device goes with it
        self.configure(&interface, profile)?;
        info!(
            "Configured {} with {}/{} mtu {}",
            interface.name(), self.settings.address, self.settings.prefix_len, interface.mtu()
        );
        Ok(interface)
    }
}

fn run_command(program: &str, args: &[&str]) -> ChimneyResult<()> {
    let cmd_str = format!("{} {}", program, args.join(" "));
    debug!("Running {}", cmd_str);

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ChimneyError::CommandFailed {
            cmd: cmd_str.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ChimneyError::CommandFailed {
            cmd: cmd_str,
            code: output.status.code(),
            stderr,
        });
    }

    Ok(())
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CStr;
    use std::fs::OpenOptions;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    use crate::error::{ChimneyError, ChimneyResult};

    const TUN_DEVICE: &str = "/dev/net/tun";
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;

    /// `struct ifreq` as far as TUNSETIFF reads it
    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub fn open_tun(template: &str) -> ChimneyResult<(OwnedFd, String)> {
        if template.len() >= libc::IFNAMSIZ {
            return Err(ChimneyError::InvalidParameter(format!("Interface name '{}' is too long", template)));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|e| ChimneyError::InterfaceAcquisitionFailed(format!("{}: {}", TUN_DEVICE, e)))?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(template.bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: `req` is a properly sized, NUL-terminated ifreq and the
        // descriptor is open for the duration of the call
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
        if rc < 0 {
            return Err(ChimneyError::InterfaceAcquisitionFailed(format!(
                "TUNSETIFF {}: {}", template, io::Error::last_os_error()
            )));
        }

        // SAFETY: the kernel writes back a NUL-terminated name
        let name = unsafe { CStr::from_ptr(req.name.as_ptr()) }.to_string_lossy().into_owned();
        Ok((OwnedFd::from(file), name))
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::os::fd::OwnedFd;

    use crate::error::{ChimneyError, ChimneyResult};

    pub fn open_tun(_template: &str) -> ChimneyResult<(OwnedFd, String)> {
        Err(ChimneyError::NotSupported("TUN devices are only supported on Linux".to_string()))
    }
}
