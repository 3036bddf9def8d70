//! Raw TAP device creation via the `/dev/net/tun` ioctl interface.

use std::io;

use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::close;

use crate::error::ComposeError;

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
const IFF_VNET_HDR: i16 = 0x4000;

#[repr(C)]
#[derive(Default)]
struct IfReq {
    ifr_name: [u8; 16],
    ifr_flags: i16,
    _padding: [u8; 22],
}

/// Create (or reuse) a persistent TAP device named `name`, owned by the
/// invoking UID/GID. Idempotent on name collision: an existing TAP with
/// this name is left as-is.
pub fn create_persistent_tap(name: &str) -> Result<(), ComposeError> {
    if name.len() > 15 {
        return Err(ComposeError::Validation {
            message: format!("tap name '{name}' exceeds the 15-octet interface name limit"),
        });
    }

    if get_if_index(name).is_ok() {
        return Ok(());
    }

    let tun_fd = open(c"/dev/net/tun", OFlag::O_RDWR, Mode::empty()).map_err(|e| {
        if matches!(e, nix::errno::Errno::EPERM | nix::errno::Errno::EACCES) {
            ComposeError::MissingCapability {
                message: "opening /dev/net/tun requires root or CAP_NET_ADMIN".into(),
            }
        } else {
            ComposeError::Io {
                context: "opening /dev/net/tun".into(),
                source: io::Error::from_raw_os_error(e as i32),
            }
        }
    })?;

    let mut ifreq = IfReq::default();
    let name_bytes = name.as_bytes();
    ifreq.ifr_name[..name_bytes.len()].copy_from_slice(name_bytes);
    ifreq.ifr_flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR;

    let ret = unsafe { libc::ioctl(tun_fd, TUNSETIFF as libc::Ioctl, &mut ifreq) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        let _ = close(tun_fd);
        return Err(ComposeError::Io {
            context: format!("creating tap device '{name}' (TUNSETIFF)"),
            source: err,
        });
    }

    let ret = unsafe { libc::ioctl(tun_fd, TUNSETPERSIST as libc::Ioctl, 1i32) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        let _ = close(tun_fd);
        return Err(ComposeError::Io {
            context: format!("making tap device '{name}' persistent (TUNSETPERSIST)"),
            source: err,
        });
    }

    let _ = close(tun_fd);
    Ok(())
}

fn get_if_index(name: &str) -> io::Result<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name has a NUL byte"))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_over_15_octets() {
        let result = create_persistent_tap("this-name-is-way-too-long");
        assert!(matches!(result, Err(ComposeError::Validation { .. })));
    }
}
