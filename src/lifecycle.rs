use std::collections::HashSet;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cloudinit::{self, MountPlanEntry, MountTarget};
use crate::config::{NetworkConfig, Project, VmConfig};
use crate::error::ComposeError;
use crate::mac;
use crate::qemuargv::{self, QemuArgvInputs};
use crate::{disk, image, network, paths, sshkeys, subprocess, supervisor, volume};

/// Advisory, non-blocking lock on the project workspace. Acquired for the
/// duration of a mutating operation; read-only operations never take it.
pub struct WorkspaceLock {
    _file: std::fs::File,
}

impl WorkspaceLock {
    pub fn acquire(workspace: &Path) -> Result<Self, ComposeError> {
        std::fs::create_dir_all(workspace).map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", workspace.display()),
            source: e,
        })?;
        let lock_path = paths::lock_path(workspace);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ComposeError::Io {
                context: format!("opening {}", lock_path.display()),
                source: e,
            })?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(ComposeError::WorkspaceLocked);
        }
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    NotCreated,
    Stopped,
    Starting,
    Ready,
    Active,
    Unknown,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::NotCreated => "not-created",
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Ready => "ready",
            VmStatus::Active => "active",
            VmStatus::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Per-VM outcome of a set operation — the controller never aborts a whole
/// `up`/`stop`/`destroy` because one VM failed.
pub struct VmOutcome {
    pub vm: String,
    pub result: Result<(), ComposeError>,
}

fn select_vms<'a>(project: &'a Project, names: &[String]) -> Vec<&'a VmConfig> {
    if names.is_empty() {
        let mut all: Vec<&VmConfig> = project.vms.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    } else {
        names.iter().filter_map(|n| project.vms.get(n)).collect()
    }
}

fn build_mount_plan(compose_dir: &Path, vm: &VmConfig) -> Result<Vec<MountPlanEntry>, ComposeError> {
    let mut plan = Vec::with_capacity(vm.volumes.len());
    // Named-volume guest device letters start at 'b' (the primary disk is 'a').
    let mut next_letter = b'b';
    let mut next_tag = 0usize;

    for mount in &vm.volumes {
        let target = if mount.is_named_volume {
            let device = format!("/dev/vd{}", next_letter as char);
            next_letter += 1;
            MountTarget::NamedVolume { device }
        } else {
            let host_path = volume::resolve_bind_mount_path(&mount.source, compose_dir)?;
            let tag = format!("mount{next_tag}");
            next_tag += 1;
            MountTarget::BindMount { tag, host_path }
        };
        plan.push(MountPlanEntry {
            target,
            guest_path: mount.target.clone(),
            read_only: mount.read_only,
            automount: mount.automount,
            mount_options: mount.mount_options.clone(),
        });
    }
    Ok(plan)
}

fn volume_disk_paths(workspace: &Path, vm: &VmConfig) -> Vec<PathBuf> {
    vm.volumes
        .iter()
        .filter(|m| m.is_named_volume)
        .map(|m| paths::volume_disk_path(workspace, &m.source))
        .collect()
}

async fn bring_up_one(project: &Project, vm: &VmConfig, claimed_ports: &HashSet<u16>) -> Result<(), ComposeError> {
    let cache_dir = paths::cache_dir();
    let workspace = &project.workspace;
    let vm_dir = paths::vm_dir(workspace, &vm.name);
    std::fs::create_dir_all(&vm_dir).map_err(|e| ComposeError::Io {
        context: format!("creating directory {}", vm_dir.display()),
        source: e,
    })?;

    let base_image = image::ensure_base_image(&vm.image, &cache_dir, false, &image::NullProgress).await?;

    let overlay_path = paths::overlay_path(workspace, &vm.name);
    let metadata_path = paths::disk_metadata_path(workspace, &vm.name);
    disk::ensure_overlay(&vm.name, &base_image, &overlay_path, &metadata_path, &vm.disk_size).await?;

    let networks_state_path = paths::networks_state_path(workspace);
    let mut network_taps = Vec::new();
    for (index, net_name) in vm.networks.iter().enumerate() {
        let net_cfg = project
            .networks
            .get(net_name)
            .expect("validated at load time");
        network::ensure_network(&project.name, net_name, &net_cfg.subnet, &networks_state_path).await?;
        let tap = network::attach_tap(&project.name, &vm.name, index, net_name).await?;
        let net_mac = mac::generate_mac(&project.name, &vm.name, index);
        network_taps.push((tap, net_mac));
    }

    for mount in vm.volumes.iter().filter(|m| m.is_named_volume) {
        let vol_cfg = project
            .volumes
            .get(&mount.source)
            .expect("validated at load time");
        let disk_path = paths::volume_disk_path(workspace, &mount.source);
        let volumes_state_path = paths::volumes_state_path(workspace);
        volume::ensure_volume(&volumes_state_path, &mount.source, &disk_path, &vol_cfg.size).await?;
    }

    let ssh_dir = paths::ssh_dir(workspace);
    sshkeys::ensure_keypair(&ssh_dir).await?;

    let ports_path = paths::ports_path(workspace, &vm.name);
    let ssh_port = sshkeys::ensure_port(&ports_path, vm.ssh_port, claimed_ports)?;
    let ssh_mac = mac::generate_mac(&project.name, &vm.name, vm.networks.len());

    let mounts = build_mount_plan(&project.compose_dir, vm)?;
    let mut all_macs: Vec<String> = network_taps.iter().map(|(_, m)| m.clone()).collect();
    all_macs.push(ssh_mac.clone());

    let cloudinit_dir = paths::cloudinit_dir(workspace, &vm.name);
    let seed_path = paths::seed_iso_path(workspace, &vm.name);
    cloudinit::generate_seed_iso(
        &cloudinit_dir,
        &seed_path,
        &vm.name,
        &vm.image,
        &ssh_dir,
        &mounts,
        &all_macs,
    )
    .await?;

    let volume_disks = volume_disk_paths(workspace, vm);
    let volume_disk_refs: Vec<&Path> = volume_disks.iter().map(PathBuf::as_path).collect();
    let console_socket = paths::console_socket_path(workspace, &vm.name);

    let argv = qemuargv::build_argv(&QemuArgvInputs {
        vm_name: &vm.name,
        cpu: vm.cpu,
        memory_mb: vm.memory_mb,
        overlay_path: &overlay_path,
        console_socket: &console_socket,
        mounts: &mounts,
        volume_disks: &volume_disk_refs,
        network_taps: &network_taps,
        ssh_hostfwd: Some((ssh_port, ssh_mac)),
        seed_iso_path: &seed_path,
        kvm_available: Path::new("/dev/kvm").exists(),
    });

    let mut full_argv = vec!["qemu-system-x86_64".to_string()];
    full_argv.extend(argv);

    supervisor::start_vm_unit(&project.name, &vm.name, &full_argv).await?;

    tracing::info!(vm = %vm.name, ssh_port, "vm brought up");
    Ok(())
}

/// Bring up the selected VMs (empty `names` means all). Already-active VMs
/// are skipped. Returns one outcome per selected VM; the overall caller
/// should treat any `Err` outcome as a non-zero exit.
pub async fn up(project: &Project, names: &[String]) -> Result<Vec<VmOutcome>, ComposeError> {
    let _lock = WorkspaceLock::acquire(&project.workspace)?;
    let mut outcomes = Vec::new();
    // Ports already allocated to VMs processed earlier in this run. QEMU
    // binds a forwarded port only once the unit actually starts, so two
    // VMs brought up back to back could otherwise both pick the same port.
    let mut claimed_ports: HashSet<u16> = HashSet::new();
    for vm in select_vms(project, names) {
        let unit = supervisor::vm_unit(&project.name, &vm.name);
        if supervisor::is_active(&unit, true).await {
            let ports_path = paths::ports_path(&project.workspace, &vm.name);
            if let Ok(port) = sshkeys::ensure_port(&ports_path, vm.ssh_port, &claimed_ports) {
                claimed_ports.insert(port);
            }
            outcomes.push(VmOutcome {
                vm: vm.name.clone(),
                result: Ok(()),
            });
            continue;
        }
        let result = bring_up_one(project, vm, &claimed_ports).await;
        if result.is_ok() {
            let ports_path = paths::ports_path(&project.workspace, &vm.name);
            if let Ok(port) = sshkeys::ensure_port(&ports_path, vm.ssh_port, &claimed_ports) {
                claimed_ports.insert(port);
            }
        }
        if let Err(e) = &result {
            tracing::error!(vm = %vm.name, error = %e, "failed to bring up vm");
        }
        outcomes.push(VmOutcome {
            vm: vm.name.clone(),
            result,
        });
    }
    Ok(outcomes)
}

pub async fn stop(project: &Project, names: &[String]) -> Result<Vec<VmOutcome>, ComposeError> {
    let _lock = WorkspaceLock::acquire(&project.workspace)?;
    let mut outcomes = Vec::new();
    for vm in select_vms(project, names) {
        let unit = supervisor::vm_unit(&project.name, &vm.name);
        let result = if supervisor::is_active(&unit, true).await {
            let r = supervisor::stop_vm_unit(&project.name, &vm.name).await;
            if r.is_ok() {
                let _ = network::detach_taps(&project.name, &vm.name, vm.networks.len()).await;
            }
            r
        } else {
            tracing::warn!(vm = %vm.name, "vm is not running");
            Ok(())
        };
        outcomes.push(VmOutcome {
            vm: vm.name.clone(),
            result,
        });
    }
    Ok(outcomes)
}

pub async fn destroy(project: &Project, names: &[String]) -> Result<Vec<VmOutcome>, ComposeError> {
    let selected_all = names.is_empty();
    let stop_outcomes = stop(project, names).await?;

    let mut outcomes = Vec::new();
    for outcome in stop_outcomes {
        let vm_dir = paths::vm_dir(&project.workspace, &outcome.vm);
        let result = std::fs::remove_dir_all(&vm_dir)
            .or_else(|e| if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
            .map_err(|e| ComposeError::Io {
                context: format!("removing {}", vm_dir.display()),
                source: e,
            });
        outcomes.push(VmOutcome {
            vm: outcome.vm,
            result,
        });
    }

    if selected_all {
        let networks_state_path = paths::networks_state_path(&project.workspace);
        let names: Vec<String> = project.networks.keys().cloned().collect();
        for net_name in names {
            // Network teardown never aborts destroy: a stuck bridge or a
            // missing iptables rule shouldn't leave the rest of the
            // project's networks (or VM directory cleanup above) undone.
            if let Err(e) = network::teardown_network(&project.name, &net_name, &networks_state_path).await {
                tracing::warn!(network = %net_name, error = %e, "failed to tear down network, continuing");
            }
        }
    }

    Ok(outcomes)
}

async fn ssh_probe(addr: &str, port: u16, identity: &Path) -> bool {
    let result = subprocess::run(
        "ssh",
        &[
            "-o", "BatchMode=yes",
            "-o", "ConnectTimeout=2",
            "-o", "StrictHostKeyChecking=no",
            "-o", "UserKnownHostsFile=/dev/null",
            "-i", &identity.display().to_string(),
            "-p", &port.to_string(),
            &format!("root@{addr}"),
            "true",
        ],
    )
    .await;
    result.is_ok()
}

pub async fn status(project: &Project, vm: &VmConfig) -> VmStatus {
    let overlay_path = paths::overlay_path(&project.workspace, &vm.name);
    if !overlay_path.exists() {
        return VmStatus::NotCreated;
    }

    let unit = supervisor::vm_unit(&project.name, &vm.name);
    if !supervisor::is_active(&unit, true).await {
        return VmStatus::Stopped;
    }

    let ports_path = paths::ports_path(&project.workspace, &vm.name);
    let ssh_dir = paths::ssh_dir(&project.workspace);
    let identity = sshkeys::private_key_path(&ssh_dir);

    let target: Option<(String, u16)> = if let Ok(port) = sshkeys::ensure_port(&ports_path, vm.ssh_port, &HashSet::new()) {
        Some(("127.0.0.1".to_string(), port))
    } else {
        None
    };

    let Some((addr, port)) = target else {
        return VmStatus::Active;
    };

    if ssh_probe(&addr, port, &identity).await {
        VmStatus::Ready
    } else {
        VmStatus::Starting
    }
}

const WAIT_TIMEOUT_S: u64 = 300;

/// Poll `status` every 2s up to a 5-minute outer timeout, for `ps --wait`.
/// Times out with `SshTimeout` unless the VM reaches `Ready` or is found to
/// never have been created.
pub async fn wait_until_ready(project: &Project, vm: &VmConfig) -> Result<VmStatus, ComposeError> {
    let deadline = std::time::Instant::now() + Duration::from_secs(WAIT_TIMEOUT_S);
    loop {
        let s = status(project, vm).await;
        if matches!(s, VmStatus::Ready | VmStatus::NotCreated) {
            return Ok(s);
        }
        if std::time::Instant::now() >= deadline {
            return Err(ComposeError::SshTimeout {
                name: vm.name.clone(),
                timeout_s: WAIT_TIMEOUT_S,
            });
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

pub struct VmInspection {
    pub status: VmStatus,
    pub overlay_path: PathBuf,
    pub image: String,
    pub macs: Vec<String>,
    /// One entry per attached network, in `vm.networks` order.
    pub ips: Vec<(String, Option<Ipv4Addr>)>,
    pub networks: Vec<NetworkConfig>,
    pub volumes: Vec<MountPlanEntry>,
    pub recent_logs: Vec<String>,
}

pub async fn inspect(project: &Project, vm: &VmConfig) -> Result<VmInspection, ComposeError> {
    let s = status(project, vm).await;
    let overlay_path = paths::overlay_path(&project.workspace, &vm.name);
    let macs: Vec<String> = (0..vm.networks.len())
        .map(|i| mac::generate_mac(&project.name, &vm.name, i))
        .collect();
    let networks_state_path = paths::networks_state_path(&project.workspace);
    let mut ips = Vec::with_capacity(vm.networks.len());
    for (index, net_name) in vm.networks.iter().enumerate() {
        let ip = network::get_vm_ip_address(&project.name, &vm.name, index, net_name, &networks_state_path).await?;
        ips.push((net_name.clone(), ip));
    }
    let networks = vm
        .networks
        .iter()
        .filter_map(|n| project.networks.get(n).cloned())
        .collect();
    let volumes = build_mount_plan(&project.compose_dir, vm)?;
    let unit = supervisor::vm_unit(&project.name, &vm.name);
    let recent_logs = supervisor::recent_logs(&unit, 50).await;

    Ok(VmInspection {
        status: s,
        overlay_path,
        image: vm.image.clone(),
        macs,
        ips,
        networks,
        volumes,
        recent_logs,
    })
}
