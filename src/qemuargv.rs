use std::path::Path;

use crate::cloudinit::{MountPlanEntry, MountTarget};

pub struct QemuArgvInputs<'a> {
    pub vm_name: &'a str,
    pub cpu: u32,
    pub memory_mb: u64,
    pub overlay_path: &'a Path,
    pub console_socket: &'a Path,
    pub mounts: &'a [MountPlanEntry],
    pub volume_disks: &'a [&'a Path],
    pub network_taps: &'a [(String, String)],
    pub ssh_hostfwd: Option<(u16, String)>,
    pub seed_iso_path: &'a Path,
    pub kvm_available: bool,
}

/// Build the `qemu-system-x86_64` argv per the fixed/declared-order rules.
pub fn build_argv(inputs: &QemuArgvInputs) -> Vec<String> {
    let mut args = vec![
        "-name".to_string(),
        inputs.vm_name.to_string(),
        "-m".to_string(),
        inputs.memory_mb.to_string(),
        "-smp".to_string(),
        inputs.cpu.to_string(),
        "-drive".to_string(),
        format!(
            "file={},format=qcow2,if=virtio",
            inputs.overlay_path.display()
        ),
        "-nographic".to_string(),
        "-serial".to_string(),
        format!("unix:{},server,nowait", inputs.console_socket.display()),
    ];

    for m in &inputs.mounts {
        if let MountTarget::BindMount { tag, host_path } = &m.target {
            args.push("-virtfs".to_string());
            args.push(virtfs_arg(host_path, tag));
        }
    }

    for disk in inputs.volume_disks {
        args.push("-drive".to_string());
        args.push(format!("file={},format=qcow2,if=virtio", disk.display()));
    }

    let mut net_index = 0;
    for (tap, mac) in inputs.network_taps {
        args.push("-netdev".to_string());
        args.push(format!("tap,id=net{net_index},ifname={tap},script=no,downscript=no"));
        args.push("-device".to_string());
        args.push(format!("virtio-net-pci,netdev=net{net_index},mac={mac}"));
        net_index += 1;
    }

    if let Some((port, mac)) = &inputs.ssh_hostfwd {
        args.push("-netdev".to_string());
        args.push(format!(
            "user,id=net{net_index},hostfwd=tcp:127.0.0.1:{port}-:22"
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-net-pci,netdev=net{net_index},mac={mac}"));
    }

    if inputs.kvm_available {
        args.push("-enable-kvm".to_string());
        args.push("-cpu".to_string());
        args.push("host".to_string());
    } else {
        tracing::warn!("/dev/kvm not accessible, falling back to TCG emulation");
    }

    args.push("-drive".to_string());
    args.push(format!(
        "file={},format=raw,if=virtio,media=cdrom",
        inputs.seed_iso_path.display()
    ));

    args
}

fn virtfs_arg(host_path: &Path, tag: &str) -> String {
    format!(
        "local,path={},mount_tag={tag},security_model=passthrough,id={tag}",
        host_path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_drive_comes_before_nographic() {
        let inputs = QemuArgvInputs {
            vm_name: "web",
            cpu: 2,
            memory_mb: 1024,
            overlay_path: Path::new("/tmp/disk.qcow2"),
            console_socket: Path::new("/tmp/console.sock"),
            mounts: &[],
            volume_disks: &[],
            network_taps: &[],
            ssh_hostfwd: None,
            seed_iso_path: Path::new("/tmp/seed.iso"),
            kvm_available: true,
        };
        let args = build_argv(&inputs);
        let drive_idx = args.iter().position(|a| a == "-drive").unwrap();
        let nographic_idx = args.iter().position(|a| a == "-nographic").unwrap();
        assert!(drive_idx < nographic_idx);
    }

    #[test]
    fn seed_iso_is_last_drive() {
        let inputs = QemuArgvInputs {
            vm_name: "web",
            cpu: 1,
            memory_mb: 512,
            overlay_path: Path::new("/tmp/disk.qcow2"),
            console_socket: Path::new("/tmp/console.sock"),
            mounts: &[],
            volume_disks: &[],
            network_taps: &[],
            ssh_hostfwd: None,
            seed_iso_path: Path::new("/tmp/seed.iso"),
            kvm_available: false,
        };
        let args = build_argv(&inputs);
        assert!(args.last().unwrap().contains("media=cdrom"));
    }

    #[test]
    fn kvm_flag_present_when_available() {
        let inputs = QemuArgvInputs {
            vm_name: "web",
            cpu: 1,
            memory_mb: 512,
            overlay_path: Path::new("/tmp/disk.qcow2"),
            console_socket: Path::new("/tmp/console.sock"),
            mounts: &[],
            volume_disks: &[],
            network_taps: &[],
            ssh_hostfwd: None,
            seed_iso_path: Path::new("/tmp/seed.iso"),
            kvm_available: true,
        };
        let args = build_argv(&inputs);
        assert!(args.iter().any(|a| a == "-enable-kvm"));
    }
}
