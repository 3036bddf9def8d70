use std::collections::HashSet;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use ssh_key::{Ed25519Keypair, LineEnding, PrivateKey};

use crate::error::ComposeError;

const PORT_RANGE_START: u16 = 2222;
const PORT_RANGE_END: u16 = 2322;

/// Create the project's SSH keypair under `ssh_dir` if it doesn't already
/// exist: `id_ed25519` (mode 0600) and `id_ed25519.pub`, directory mode 0700.
pub async fn ensure_keypair(ssh_dir: &Path) -> Result<(), ComposeError> {
    let private_path = ssh_dir.join("id_ed25519");
    if private_path.exists() {
        return Ok(());
    }

    tokio::fs::create_dir_all(ssh_dir)
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", ssh_dir.display()),
            source: e,
        })?;
    tokio::fs::set_permissions(ssh_dir, std::fs::Permissions::from_mode(0o700))
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("setting permissions on {}", ssh_dir.display()),
            source: e,
        })?;

    let keypair = Ed25519Keypair::random(&mut rand_core::OsRng);
    let private = PrivateKey::from(keypair);

    let openssh_private = private.to_openssh(LineEnding::LF).map_err(|e| ComposeError::Io {
        context: format!("encoding SSH private key: {e}"),
        source: std::io::Error::other(e.to_string()),
    })?;
    tokio::fs::write(&private_path, openssh_private.as_bytes())
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("writing {}", private_path.display()),
            source: e,
        })?;
    tokio::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("setting permissions on {}", private_path.display()),
            source: e,
        })?;

    let public = private.public_key();
    let openssh_public = public.to_openssh().map_err(|e| ComposeError::Io {
        context: format!("encoding SSH public key: {e}"),
        source: std::io::Error::other(e.to_string()),
    })?;
    tokio::fs::write(ssh_dir.join("id_ed25519.pub"), openssh_public.as_bytes())
        .await
        .map_err(|e| ComposeError::Io {
            context: "writing id_ed25519.pub".into(),
            source: e,
        })?;

    tracing::info!(dir = %ssh_dir.display(), "generated project SSH keypair");
    Ok(())
}

pub async fn read_public_key(ssh_dir: &Path) -> Result<String, ComposeError> {
    let path = ssh_dir.join("id_ed25519.pub");
    tokio::fs::read_to_string(&path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| ComposeError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        })
}

pub fn private_key_path(ssh_dir: &Path) -> std::path::PathBuf {
    ssh_dir.join("id_ed25519")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsRecord {
    pub ssh: Option<u16>,
}

fn load_ports(path: &Path) -> PortsRecord {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_ports(path: &Path, record: &PortsRecord) -> Result<(), ComposeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    let json = serde_json::to_string_pretty(record).expect("PortsRecord is serializable");
    std::fs::write(path, json).map_err(|e| ComposeError::Io {
        context: format!("writing {}", path.display()),
        source: e,
    })
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Allocate (or reuse) a host port for a user-mode NIC. A pinned port in
/// the VM config is used verbatim if free; otherwise the port persisted
/// from a previous run is reused if still free; otherwise the first free
/// port in `[2222, 2322]` not already claimed by another VM is chosen.
///
/// `claimed_by_siblings` holds ports already allocated to other VMs in the
/// same project during this run. QEMU only binds a forwarded port once the
/// unit actually starts, so a raw TCP-bind probe alone can't see a sibling
/// VM's port choice before it starts listening — the caller must track it.
pub fn ensure_port(
    ports_path: &Path,
    pinned: Option<u16>,
    claimed_by_siblings: &HashSet<u16>,
) -> Result<u16, ComposeError> {
    let mut record = load_ports(ports_path);

    if let Some(port) = pinned {
        if claimed_by_siblings.contains(&port) || !port_is_free(port) {
            return Err(ComposeError::Validation {
                message: format!("pinned SSH port {port} is already in use"),
            });
        }
        record.ssh = Some(port);
        save_ports(ports_path, &record)?;
        return Ok(port);
    }

    if let Some(existing) = record.ssh {
        if !claimed_by_siblings.contains(&existing) && port_is_free(existing) {
            return Ok(existing);
        }
    }

    for port in PORT_RANGE_START..=PORT_RANGE_END {
        if !claimed_by_siblings.contains(&port) && port_is_free(port) {
            record.ssh = Some(port);
            save_ports(ports_path, &record)?;
            return Ok(port);
        }
    }

    Err(ComposeError::PortPoolExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_keypair_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ssh_dir = dir.path().join("ssh");
        ensure_keypair(&ssh_dir).await.unwrap();
        let first = std::fs::read_to_string(private_key_path(&ssh_dir)).unwrap();
        ensure_keypair(&ssh_dir).await.unwrap();
        let second = std::fs::read_to_string(private_key_path(&ssh_dir)).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn private_key_has_0600_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let ssh_dir = dir.path().join("ssh");
        ensure_keypair(&ssh_dir).await.unwrap();
        let meta = std::fs::metadata(private_key_path(&ssh_dir)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn ensure_port_persists_choice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        let first = ensure_port(&path, None, &HashSet::new()).unwrap();
        let second = ensure_port(&path, None, &HashSet::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ensure_port_honors_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        let port = ensure_port(&path, Some(2399), &HashSet::new()).unwrap();
        assert_eq!(port, 2399);
    }

    #[test]
    fn ensure_port_skips_sibling_claims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        let mut claimed = HashSet::new();
        claimed.insert(PORT_RANGE_START);
        let port = ensure_port(&path, None, &claimed).unwrap();
        assert_ne!(port, PORT_RANGE_START);
    }
}
