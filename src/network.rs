use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::config::SubnetSpec;
use crate::error::ComposeError;
use crate::mac;
use crate::netlink::NetlinkHandle;
use crate::supervisor;
use crate::{subprocess, tap};

const POOL_BASE: u8 = 16;
const POOL_SIZE: u32 = 4096;
const DHCP_RANGE_START: &str = "10";
const DHCP_RANGE_END: &str = "250";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub subnet: String,
    pub driver: String,
    pub dhcp_unit: String,
    pub dhcp_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworksState {
    #[serde(flatten)]
    pub networks: HashMap<String, NetworkRecord>,
}

pub fn load_state(path: &Path) -> NetworksState {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_state(path: &Path, state: &NetworksState) -> Result<(), ComposeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    let json = serde_json::to_string_pretty(state).expect("NetworksState is serializable");
    std::fs::write(path, json).map_err(|e| ComposeError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

/// subnet(i) = 172.<16 + i/256>.<i mod 256>.0/24
fn subnet_for_index(i: u32) -> Ipv4Net {
    let third = POOL_BASE as u32 + i / 256;
    let fourth = i % 256;
    let addr = Ipv4Addr::new(172, third as u8, fourth as u8, 0);
    Ipv4Net::new(addr, 24).expect("always a valid /24")
}

/// Scan the pool for the first /24 not already present in `state`.
fn allocate_pool_subnet(state: &NetworksState) -> Result<Ipv4Net, ComposeError> {
    let taken: std::collections::HashSet<&str> =
        state.networks.values().map(|r| r.subnet.as_str()).collect();
    for i in 0..POOL_SIZE {
        let candidate = subnet_for_index(i);
        let candidate_str = candidate.to_string();
        if !taken.contains(candidate_str.as_str()) {
            return Ok(candidate);
        }
    }
    Err(ComposeError::SubnetPoolExhausted)
}

fn resolve_subnet(
    state: &NetworksState,
    network_name: &str,
    spec: &SubnetSpec,
) -> Result<Ipv4Net, ComposeError> {
    // Reuse a previously persisted subnet across restarts.
    if let Some(existing) = state.networks.get(network_name) {
        return existing.subnet.parse().map_err(|_| ComposeError::Validation {
            message: format!("stored subnet for '{network_name}' is corrupt"),
        });
    }
    match spec {
        SubnetSpec::Explicit(net) => Ok(*net),
        SubnetSpec::Auto => allocate_pool_subnet(state),
    }
}

fn gateway_addr(subnet: &Ipv4Net) -> Ipv4Addr {
    let octets = subnet.network().octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], 1)
}

/// Best-effort: a failure here leaves forwarding off and NAT installation
/// will likely also fail, but the VM itself can still come up with
/// degraded (LAN-only) egress.
async fn ensure_ip_forwarding() {
    let current = std::fs::read_to_string("/proc/sys/net/ipv4/ip_forward")
        .unwrap_or_else(|_| "0".into());
    if current.trim() == "1" {
        return;
    }
    subprocess::run_best_effort("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await;
}

fn nat_comment(project: &str, network: &str) -> String {
    format!("qemu-compose-{project}-{network}")
}

/// Best-effort: NAT/FORWARD rule installation never aborts fabric setup —
/// the VM may still run with degraded egress if this fails.
async fn install_nat_rules(project: &str, network: &str, bridge: &str, subnet: &Ipv4Net) {
    ensure_ip_forwarding().await;
    let comment = nat_comment(project, network);
    let subnet_str = subnet.to_string();

    let masquerade_args = [
        "-t", "nat", "-A", "POSTROUTING", "-s", &subnet_str, "-j", "MASQUERADE",
        "-m", "comment", "--comment", &comment,
    ];
    let check_args: Vec<&str> = std::iter::once("-t")
        .chain(std::iter::once("nat"))
        .chain(std::iter::once("-C"))
        .chain(masquerade_args.iter().skip(3).copied())
        .collect();
    if subprocess::run("iptables", &check_args).await.is_err() {
        subprocess::run_best_effort("iptables", &masquerade_args).await;
    }

    for (direction_flag, direction_iface) in [("-i", bridge), ("-o", bridge)] {
        let forward_args = [
            "-A", "FORWARD", direction_flag, direction_iface, "-j", "ACCEPT",
            "-m", "comment", "--comment", &comment,
        ];
        let check_args: Vec<&str> = std::iter::once("-C")
            .chain(forward_args.iter().skip(1).copied())
            .collect();
        if subprocess::run("iptables", &check_args).await.is_err() {
            subprocess::run_best_effort("iptables", &forward_args).await;
        }
    }
}

async fn remove_nat_rules(project: &str, network: &str, bridge: &str, subnet: &Ipv4Net) {
    let comment = nat_comment(project, network);
    let subnet_str = subnet.to_string();

    subprocess::run_best_effort(
        "iptables",
        &[
            "-t", "nat", "-D", "POSTROUTING", "-s", &subnet_str, "-j", "MASQUERADE",
            "-m", "comment", "--comment", &comment,
        ],
    )
    .await;

    for (direction_flag, direction_iface) in [("-i", bridge), ("-o", bridge)] {
        subprocess::run_best_effort(
            "iptables",
            &[
                "-D", "FORWARD", direction_flag, direction_iface, "-j", "ACCEPT",
                "-m", "comment", "--comment", &comment,
            ],
        )
        .await;
    }
}

fn dhcp_unit_name(project: &str, network: &str) -> String {
    format!("qemu-compose-dnsmasq-{project}-{network}")
}

async fn start_dhcp(project: &str, network: &str, bridge: &str, subnet: &Ipv4Net) -> Result<String, ComposeError> {
    let gateway = gateway_addr(subnet);
    let octets = subnet.network().octets();
    let range_start = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], DHCP_RANGE_START);
    let range_end = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], DHCP_RANGE_END);

    let unit = dhcp_unit_name(project, network);
    let cmd_args = vec![
        "dnsmasq".to_string(),
        "--no-daemon".to_string(),
        format!("--interface={bridge}"),
        "--bind-interfaces".to_string(),
        "--port=0".to_string(),
        format!("--dhcp-range={range_start},{range_end},12h"),
        format!("--dhcp-option=option:router,{gateway}"),
        format!("--dhcp-option=option:dns-server,{gateway}"),
    ];
    supervisor::start_system_unit(&unit, &cmd_args).await?;
    Ok(unit)
}

/// Ensure a network's fabric (bridge, address, DHCP, NAT) is fully realized.
/// Idempotent — safe to call on every `up`.
pub async fn ensure_network(
    project: &str,
    network_name: &str,
    subnet_spec: &SubnetSpec,
    state_path: &Path,
) -> Result<NetworkRecord, ComposeError> {
    let mut state = load_state(state_path);
    let subnet = resolve_subnet(&state, network_name, subnet_spec)?;
    let bridge = mac::bridge_name(project, network_name);

    let nl = NetlinkHandle::new().await?;
    let bridge_idx = nl.ensure_bridge(&bridge).await?;
    nl.set_link_up(bridge_idx).await?;
    nl.add_address_v4(bridge_idx, gateway_addr(&subnet), 24).await?;

    let dhcp_unit = start_dhcp(project, network_name, &bridge, &subnet).await?;
    install_nat_rules(project, network_name, &bridge, &subnet).await;

    let record = NetworkRecord {
        subnet: subnet.to_string(),
        driver: "bridge".into(),
        dhcp_unit,
        dhcp_active: true,
    };
    state.networks.insert(network_name.to_string(), record.clone());
    save_state(state_path, &state)?;

    tracing::info!(network = network_name, bridge = %bridge, subnet = %subnet, "network fabric ready");
    Ok(record)
}

/// Create (or reuse) a TAP device for `(vm, index)` and attach it to the
/// network's bridge.
pub async fn attach_tap(
    project: &str,
    vm_name: &str,
    index: usize,
    network_name: &str,
) -> Result<String, ComposeError> {
    let tap = mac::tap_name(project, vm_name, index);
    tap::create_persistent_tap(&tap)?;

    let bridge = mac::bridge_name(project, network_name);
    let nl = NetlinkHandle::new().await?;
    let bridge_idx = nl
        .link_index(&bridge)
        .await?
        .ok_or_else(|| ComposeError::NetworkNotFound {
            name: network_name.to_string(),
        })?;
    let tap_idx = nl
        .link_index(&tap)
        .await?
        .ok_or_else(|| ComposeError::Netlink {
            message: format!("tap '{tap}' missing right after creation"),
        })?;
    nl.set_link_up(tap_idx).await?;
    nl.set_master(tap_idx, bridge_idx).await?;

    Ok(tap)
}

/// Delete a VM's TAP devices. Bridges, DHCP, and NAT are left in place —
/// they belong to the network, not the VM.
pub async fn detach_taps(project: &str, vm_name: &str, interface_count: usize) -> Result<(), ComposeError> {
    let nl = NetlinkHandle::new().await?;
    for index in 0..interface_count {
        let tap = mac::tap_name(project, vm_name, index);
        nl.delete_link(&tap).await?;
    }
    Ok(())
}

/// Tear down a network's bridge, DHCP side-car, and NAT rules, and erase
/// its persisted record.
pub async fn teardown_network(project: &str, network_name: &str, state_path: &Path) -> Result<(), ComposeError> {
    let mut state = load_state(state_path);
    let Some(record) = state.networks.get(network_name).cloned() else {
        return Ok(());
    };
    let bridge = mac::bridge_name(project, network_name);
    let subnet: Ipv4Net = record.subnet.parse().map_err(|_| ComposeError::Validation {
        message: format!("stored subnet for '{network_name}' is corrupt"),
    })?;

    supervisor::stop_system_unit(&record.dhcp_unit).await;
    remove_nat_rules(project, network_name, &bridge, &subnet).await;

    // A failure to delete the bridge link still leaves the network
    // unusable for this project; dropping the persisted record is more
    // useful than leaving it pointing at a half-torn-down network.
    match NetlinkHandle::new().await {
        Ok(nl) => {
            if let Err(e) = nl.delete_link(&bridge).await {
                tracing::warn!(network = network_name, bridge = %bridge, error = %e, "failed to delete bridge link, continuing");
            }
        }
        Err(e) => {
            tracing::warn!(network = network_name, error = %e, "failed to open netlink handle for teardown, continuing");
        }
    }

    state.networks.remove(network_name);
    save_state(state_path, &state)?;
    Ok(())
}

/// Look up the DHCP-assigned IPv4 address for a VM's interface on
/// `network_name` by scanning that network's DHCP unit journal for the
/// latest lease matching its MAC.
pub async fn get_vm_ip_address(
    project: &str,
    vm_name: &str,
    index: usize,
    network_name: &str,
    state_path: &Path,
) -> Result<Option<Ipv4Addr>, ComposeError> {
    let state = load_state(state_path);
    let Some(record) = state.networks.get(network_name) else {
        return Ok(None);
    };
    let mac = mac::generate_mac(project, vm_name, index);
    let output = subprocess::run(
        "journalctl",
        &["--unit", &record.dhcp_unit, "--no-pager", "-n", "500"],
    )
    .await?;
    let text = String::from_utf8_lossy(&output.stdout);
    let mac_lower = mac.to_ascii_lowercase();
    for line in text.lines().rev() {
        if (line.contains("DHCPACK") || line.contains("DHCPREPLY")) && line.to_ascii_lowercase().contains(&mac_lower) {
            if let Some(ip) = line.split_whitespace().find_map(|tok| tok.parse::<Ipv4Addr>().ok()) {
                return Ok(Some(ip));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_formula_matches_spec() {
        assert_eq!(subnet_for_index(0).to_string(), "172.16.0.0/24");
        assert_eq!(subnet_for_index(1).to_string(), "172.16.1.0/24");
        assert_eq!(subnet_for_index(256).to_string(), "172.17.0.0/24");
        assert_eq!(subnet_for_index(4095).to_string(), "172.31.255.0/24");
    }

    #[test]
    fn gateway_is_dot_one() {
        let net: Ipv4Net = "172.16.5.0/24".parse().unwrap();
        assert_eq!(gateway_addr(&net), Ipv4Addr::new(172, 16, 5, 1));
    }

    #[test]
    fn allocate_pool_subnet_skips_taken() {
        let mut state = NetworksState::default();
        state.networks.insert(
            "net0".into(),
            NetworkRecord {
                subnet: "172.16.0.0/24".into(),
                driver: "bridge".into(),
                dhcp_unit: "x".into(),
                dhcp_active: false,
            },
        );
        let next = allocate_pool_subnet(&state).unwrap();
        assert_eq!(next.to_string(), "172.16.1.0/24");
    }

    #[test]
    fn dhcp_unit_name_is_deterministic() {
        assert_eq!(
            dhcp_unit_name("proj", "net0"),
            "qemu-compose-dnsmasq-proj-net0"
        );
    }
}
