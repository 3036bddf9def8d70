//! Precondition/capability checklist run by `qemu-compose doctor` and
//! consulted (non-fatally) before `up`.

use std::path::Path;

use crate::subprocess;

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

const REQUIRED_BINARIES: &[&str] = &[
    "qemu-system-x86_64",
    "qemu-img",
    "qemu-nbd",
    "mkfs.ext4",
    "dnsmasq",
    "iptables",
    "sysctl",
    "systemd-run",
    "systemctl",
    "journalctl",
];

const OPTIONAL_BINARIES: &[&str] = &["genisoimage", "mkisofs"];

fn check_binary(name: &str) -> CheckResult {
    let ok = subprocess::is_on_path(name);
    CheckResult {
        name: format!("binary: {name}"),
        ok,
        detail: if ok {
            "found on PATH".to_string()
        } else {
            "not found on PATH".to_string()
        },
    }
}

fn check_kvm() -> CheckResult {
    let path = Path::new("/dev/kvm");
    let ok = path.exists()
        && std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .is_ok();
    CheckResult {
        name: "kvm acceleration".to_string(),
        ok,
        detail: if ok {
            "/dev/kvm is accessible".to_string()
        } else {
            "/dev/kvm missing or not writable; VMs will run under TCG emulation".to_string()
        },
    }
}

fn check_net_admin() -> CheckResult {
    let ok = unsafe { libc::geteuid() } == 0;
    CheckResult {
        name: "network administration".to_string(),
        ok,
        detail: if ok {
            "running as root".to_string()
        } else {
            "not running as root; bridge/TAP/iptables operations will fail without CAP_NET_ADMIN".to_string()
        },
    }
}

fn check_tun_device() -> CheckResult {
    let ok = Path::new("/dev/net/tun").exists();
    CheckResult {
        name: "tun/tap device node".to_string(),
        ok,
        detail: if ok {
            "/dev/net/tun present".to_string()
        } else {
            "/dev/net/tun missing; load the tun kernel module".to_string()
        },
    }
}

/// Run every precondition check and return the full list, in the order a
/// human would want to read them (binaries, then kernel/capability checks).
pub fn run_checks() -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = REQUIRED_BINARIES.iter().map(|b| check_binary(b)).collect();

    let has_iso_tool = OPTIONAL_BINARIES.iter().any(|b| subprocess::is_on_path(b));
    results.push(CheckResult {
        name: "binary: genisoimage/mkisofs".to_string(),
        ok: has_iso_tool,
        detail: if has_iso_tool {
            "found at least one ISO builder".to_string()
        } else {
            "neither genisoimage nor mkisofs found; cloud-init seed generation will fail".to_string()
        },
    });

    results.push(check_kvm());
    results.push(check_net_admin());
    results.push(check_tun_device());
    results
}

pub fn all_ok(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_checks_returns_every_binary() {
        let results = run_checks();
        assert!(results.len() >= REQUIRED_BINARIES.len());
    }
}
