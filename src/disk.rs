use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ComposeError;
use crate::subprocess;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetadata {
    pub size: String,
}

fn read_metadata(path: &Path) -> Option<DiskMetadata> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_metadata(path: &Path, metadata: &DiskMetadata) -> Result<(), ComposeError> {
    let json = serde_json::to_string_pretty(metadata).expect("DiskMetadata is serializable");
    std::fs::write(path, json).map_err(|e| ComposeError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

/// Ensure `overlay_path` exists as a qcow2 overlay over `base_image`, sized
/// to `declared_size` on first creation. On later calls, a size that no
/// longer matches the stored metadata is a non-fatal drift: the existing
/// overlay is left untouched and booted as-is, since resizing in place
/// could corrupt an in-use disk.
pub async fn ensure_overlay(
    vm_name: &str,
    base_image: &Path,
    overlay_path: &Path,
    metadata_path: &Path,
    declared_size: &str,
) -> Result<(), ComposeError> {
    if overlay_path.exists() {
        match read_metadata(metadata_path) {
            Some(meta) if meta.size != declared_size => {
                tracing::warn!(
                    vm = vm_name,
                    stored = %meta.size,
                    declared = %declared_size,
                    "disk size changed while an overlay already exists; booting the existing disk unchanged. Run `qemu-compose destroy {vm_name}` and `up` again to apply the new size.",
                );
            }
            Some(_) => {}
            None => {
                // Grandfather an existing disk with no metadata onto the
                // currently declared size.
                write_metadata(
                    metadata_path,
                    &DiskMetadata {
                        size: declared_size.to_string(),
                    },
                )?;
            }
        }
        return Ok(());
    }

    if let Some(parent) = overlay_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }

    subprocess::run(
        "qemu-img",
        &[
            "create",
            "-f",
            "qcow2",
            "-b",
            &base_image.display().to_string(),
            "-F",
            "qcow2",
            &overlay_path.display().to_string(),
        ],
    )
    .await?;

    subprocess::run(
        "qemu-img",
        &[
            "resize",
            &overlay_path.display().to_string(),
            declared_size,
        ],
    )
    .await?;

    write_metadata(
        metadata_path,
        &DiskMetadata {
            size: declared_size.to_string(),
        },
    )?;

    tracing::info!(vm = vm_name, path = %overlay_path.display(), "created qcow2 overlay");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.metadata.json");
        write_metadata(
            &path,
            &DiskMetadata {
                size: "20G".into(),
            },
        )
        .unwrap();
        let loaded = read_metadata(&path).unwrap();
        assert_eq!(loaded.size, "20G");
    }

    #[test]
    fn missing_metadata_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_metadata(&dir.path().join("nope.json")).is_none());
    }
}
