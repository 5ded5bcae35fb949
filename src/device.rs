#![cfg(unix)]

use crate::{Error, Result};

/// MTU bounds accepted from the host. Below 576 IPv4 fragmentation
/// guarantees break; 65535 is the IP total-length ceiling.
pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = u16::MAX;

/// Wrap a platform-owned TUN file descriptor into an async device.
///
/// The host keeps ownership of `tun_fd`; we dup it and close only the
/// duplicate on drop, so the core closes its descriptor exactly once and
/// the host's own close never races ours. Packets written back to the
/// device must carry checksums computed in user space: the host TUN
/// validates them and silently drops zero-checksum frames, so no offload
/// path may exist anywhere in this crate.
pub fn open(tun_fd: i32, mtu: u16) -> Result<tun::AsyncDevice> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(Error::Device(format!("mtu {mtu} out of range")));
    }

    let fd = unsafe { libc::dup(tun_fd) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return Err(Error::Device(format!("dup tun fd {tun_fd}: {err}")));
    }

    let mut config = tun::Configuration::default();
    config.raw_fd(fd);
    config.close_fd_on_drop(true);
    config.mtu(mtu);

    let device = tun::create_as_async(&config).map_err(|e| {
        unsafe { libc::close(fd) };
        Error::Device(format!("tun device from fd {fd}: {e}"))
    })?;

    log::info!("[TUN] device ready, fd {fd} (dup of {tun_fd}), mtu {mtu}");
    Ok(device)
}
