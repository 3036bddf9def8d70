use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ComposeError;
use crate::subprocess;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub size: String,
    pub disk: PathBuf,
    pub created: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumesState {
    #[serde(flatten)]
    pub volumes: HashMap<String, VolumeRecord>,
}

pub fn load_state(path: &Path) -> VolumesState {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_state(path: &Path, state: &VolumesState) -> Result<(), ComposeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    let json = serde_json::to_string_pretty(state).expect("VolumesState is serializable");
    std::fs::write(path, json).map_err(|e| ComposeError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

/// Find a free `/dev/nbdN` device (probing the default 16-device range) by
/// attempting a connect; "already connected" means busy. The device is
/// always disconnected again by the caller once formatting is done.
async fn find_free_nbd_device() -> Result<PathBuf, ComposeError> {
    for i in 0..16 {
        let dev = PathBuf::from(format!("/dev/nbd{i}"));
        if !dev.exists() {
            continue;
        }
        let size_sysfs = format!("/sys/class/block/nbd{i}/size");
        let busy = std::fs::read_to_string(&size_sysfs)
            .map(|s| s.trim() != "0")
            .unwrap_or(false);
        if !busy {
            return Ok(dev);
        }
    }
    Err(ComposeError::NbdPoolExhausted)
}

/// Create and ext4-format a named volume's backing disk, then persist its
/// record. Idempotent: a volume already present in `volumes.json` is a
/// no-op.
pub async fn ensure_volume(
    state_path: &Path,
    volume_name: &str,
    disk_path: &Path,
    size: &str,
) -> Result<(), ComposeError> {
    let mut state = load_state(state_path);
    if state.volumes.contains_key(volume_name) {
        return Ok(());
    }

    if let Some(parent) = disk_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }

    subprocess::run(
        "qemu-img",
        &["create", "-f", "qcow2", &disk_path.display().to_string(), size],
    )
    .await?;

    format_via_nbd(disk_path).await?;

    state.volumes.insert(
        volume_name.to_string(),
        VolumeRecord {
            size: size.to_string(),
            disk: disk_path.to_path_buf(),
            created: "unknown".into(),
        },
    );
    save_state(state_path, &state)?;

    tracing::info!(volume = volume_name, path = %disk_path.display(), "created named volume");
    Ok(())
}

async fn format_via_nbd(disk_path: &Path) -> Result<(), ComposeError> {
    let nbd_dev = find_free_nbd_device().await?;
    let nbd_str = nbd_dev.display().to_string();

    subprocess::run(
        "qemu-nbd",
        &["--connect", &nbd_str, &disk_path.display().to_string()],
    )
    .await?;

    let format_result = subprocess::run("mkfs.ext4", &["-F", &nbd_str]).await;

    // Always disconnect, even if mkfs failed, so the device isn't leaked.
    subprocess::run_best_effort("qemu-nbd", &["--disconnect", &nbd_str]).await;

    format_result.map(|_| ())
}

/// Resolve a bind mount's host path relative to the compose file's
/// directory, rejecting paths that don't exist.
pub fn resolve_bind_mount_path(source: &str, compose_dir: &Path) -> Result<PathBuf, ComposeError> {
    let path = Path::new(source);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        compose_dir.join(path)
    };
    if !resolved.exists() {
        return Err(ComposeError::MountSourceNotFound {
            path: resolved.display().to_string(),
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_bind_mount_path_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("data");
        std::fs::create_dir(&sub).unwrap();
        let resolved = resolve_bind_mount_path(sub.to_str().unwrap(), dir.path()).unwrap();
        assert_eq!(resolved, sub);
    }

    #[test]
    fn resolve_bind_mount_path_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let resolved = resolve_bind_mount_path("./data", dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("data"));
    }

    #[test]
    fn resolve_bind_mount_path_rejects_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_bind_mount_path("./nope", dir.path()).is_err());
    }

    #[test]
    fn volumes_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volumes.json");
        let mut state = VolumesState::default();
        state.volumes.insert(
            "data".into(),
            VolumeRecord {
                size: "10G".into(),
                disk: PathBuf::from("/tmp/data.qcow2"),
                created: "now".into(),
            },
        );
        save_state(&path, &state).unwrap();
        let loaded = load_state(&path);
        assert!(loaded.volumes.contains_key("data"));
    }
}
