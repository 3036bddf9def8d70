use std::path::{Path, PathBuf};

/// Global image cache: `~/.cache/qemu-compose/images/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("qemu-compose")
        .join("images")
}

/// The project name is the basename of the directory containing the compose file.
pub fn project_name(compose_path: &Path) -> String {
    compose_path
        .parent()
        .and_then(|p| p.canonicalize().ok().or_else(|| Some(p.to_path_buf())))
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".to_string())
}

/// Project-local mutable state directory, adjacent to the compose file.
pub fn workspace_dir(compose_path: &Path) -> PathBuf {
    compose_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(".qemu-compose")
}

pub fn lock_path(workspace: &Path) -> PathBuf {
    workspace.join(".lock")
}

pub fn networks_state_path(workspace: &Path) -> PathBuf {
    workspace.join("networks.json")
}

pub fn volumes_state_path(workspace: &Path) -> PathBuf {
    workspace.join("volumes.json")
}

pub fn ssh_dir(workspace: &Path) -> PathBuf {
    workspace.join("ssh")
}

pub fn vm_dir(workspace: &Path, vm_name: &str) -> PathBuf {
    workspace.join(vm_name)
}

pub fn overlay_path(workspace: &Path, vm_name: &str) -> PathBuf {
    vm_dir(workspace, vm_name).join("disk.qcow2")
}

pub fn disk_metadata_path(workspace: &Path, vm_name: &str) -> PathBuf {
    vm_dir(workspace, vm_name).join("disk.metadata.json")
}

pub fn ports_path(workspace: &Path, vm_name: &str) -> PathBuf {
    vm_dir(workspace, vm_name).join("ports.json")
}

pub fn seed_iso_path(workspace: &Path, vm_name: &str) -> PathBuf {
    vm_dir(workspace, vm_name).join("cloud-init.iso")
}

pub fn cloudinit_dir(workspace: &Path, vm_name: &str) -> PathBuf {
    vm_dir(workspace, vm_name).join("cloud-init")
}

pub fn console_socket_path(workspace: &Path, vm_name: &str) -> PathBuf {
    vm_dir(workspace, vm_name).join("console.sock")
}

pub fn volumes_dir(workspace: &Path) -> PathBuf {
    workspace.join("volumes")
}

pub fn volume_disk_path(workspace: &Path, volume_name: &str) -> PathBuf {
    volumes_dir(workspace)
        .join(volume_name)
        .join("volume.qcow2")
}

/// Resolve the compose file per the documented search order: `-f` flag,
/// then `QEMU_COMPOSE_FILE`, then `qemu-compose.yaml`/`qemu-compose.yml`
/// in the current directory.
pub fn resolve_compose_file(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = flag {
        return Some(p.to_path_buf());
    }
    if let Ok(env) = std::env::var("QEMU_COMPOSE_FILE") {
        return Some(PathBuf::from(env));
    }
    for candidate in ["qemu-compose.yaml", "qemu-compose.yml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_is_parent_basename() {
        let p = PathBuf::from("/home/alice/myproj/qemu-compose.yaml");
        assert_eq!(project_name(&p), "myproj");
    }

    #[test]
    fn workspace_dir_is_adjacent() {
        let p = PathBuf::from("/home/alice/myproj/qemu-compose.yaml");
        assert_eq!(
            workspace_dir(&p),
            PathBuf::from("/home/alice/myproj/.qemu-compose")
        );
    }

    #[test]
    fn resolve_compose_file_prefers_flag() {
        let flag = PathBuf::from("explicit.yaml");
        assert_eq!(
            resolve_compose_file(Some(&flag)),
            Some(PathBuf::from("explicit.yaml"))
        );
    }
}
