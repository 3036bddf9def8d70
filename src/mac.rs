//! Deterministic naming derived from `(project, vm, interface-index)` via
//! MD5 — the single call site used by both the QEMU argv builder and the
//! cloud-init seed builder, so the two never drift apart.

use md5::{Digest, Md5};

fn identifier(project: &str, vm: &str, index: usize) -> String {
    format!("{project}-{vm}-{index}")
}

fn digest(project: &str, vm: &str, index: usize) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(identifier(project, vm, index).as_bytes());
    hasher.finalize().into()
}

/// `52:54:00:<b0>:<b1>:<b2>` where the trailing bytes are the first three
/// bytes of MD5 over `"<project>-<vm>-<index>"`.
pub fn generate_mac(project: &str, vm: &str, index: usize) -> String {
    let d = digest(project, vm, index);
    format!("52:54:00:{:02x}:{:02x}:{:02x}", d[0], d[1], d[2])
}

/// TAP device name: `tap-<4 hex octets of MD5>-<vm truncated to 6>`.
pub fn tap_name(project: &str, vm: &str, index: usize) -> String {
    let d = digest(project, vm, index);
    let hex: String = d[..2].iter().map(|b| format!("{b:02x}")).collect();
    let vm_trunc: String = vm.chars().take(6).collect();
    format!("tap-{hex}-{vm_trunc}")
}

/// Bridge name: `qc-<project>-<network>`, truncated to the 15-octet Linux
/// interface-name limit.
pub fn bridge_name(project: &str, network: &str) -> String {
    let full = format!("qc-{project}-{network}");
    full.chars().take(15).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_deterministic() {
        let a = generate_mac("myproj", "web", 0);
        let b = generate_mac("myproj", "web", 0);
        assert_eq!(a, b);
    }

    #[test]
    fn mac_has_locally_administered_prefix() {
        let mac = generate_mac("myproj", "web", 0);
        assert!(mac.starts_with("52:54:00:"));
    }

    #[test]
    fn mac_differs_per_index() {
        let a = generate_mac("myproj", "web", 0);
        let b = generate_mac("myproj", "web", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn tap_name_is_within_interface_name_limit() {
        let name = tap_name("a-very-long-project-name", "a-very-long-vm-name", 3);
        assert!(name.len() <= 15, "tap name '{name}' exceeds 15 octets");
    }

    #[test]
    fn bridge_name_is_truncated() {
        let name = bridge_name("a-very-long-project-name", "a-very-long-network-name");
        assert!(name.len() <= 15, "bridge name '{name}' exceeds 15 octets");
    }
}
