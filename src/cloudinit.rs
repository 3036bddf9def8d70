use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::error::ComposeError;
use crate::sshkeys;
use crate::subprocess;

/// A volume mount already resolved to its guest-side device or 9p tag.
#[derive(Debug, Clone)]
pub enum MountTarget {
    /// A named volume attached as `/dev/vd<letter>`.
    NamedVolume { device: String },
    /// A bind mount attached via 9p under this mount tag.
    BindMount { tag: String, host_path: std::path::PathBuf },
}

#[derive(Debug, Clone)]
pub struct MountPlanEntry {
    pub target: MountTarget,
    pub guest_path: String,
    pub read_only: bool,
    pub automount: bool,
    pub mount_options: Option<String>,
}

/// Heuristic default login user, derived from the image URL.
pub fn default_user(image_url: &str) -> &'static str {
    let lower = image_url.to_ascii_lowercase();
    if lower.contains("fedora") {
        "fedora"
    } else if lower.contains("ubuntu") {
        "ubuntu"
    } else if lower.contains("debian") {
        "debian"
    } else if lower.contains("centos") {
        "centos"
    } else if lower.contains("rhel") {
        "cloud-user"
    } else {
        "ubuntu"
    }
}

fn build_user_data(user: &str, public_key: &str, mounts: &[MountPlanEntry]) -> String {
    let user_entry = value!({
        "name": (user),
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "shell": "/bin/bash",
        "ssh_authorized_keys": [(public_key)],
        "lock_passwd": false,
    });

    let has_bind_mounts = mounts
        .iter()
        .any(|m| matches!(m.target, MountTarget::BindMount { .. }));

    let mut bootcmd = VArray::new();
    if has_bind_mounts {
        bootcmd.push(value!(["modprobe", "9p"]));
        bootcmd.push(value!(["modprobe", "9pnet_virtio"]));
    }
    for m in mounts {
        bootcmd.push(Value::from(VArray::from_iter([
            Value::from("mkdir"),
            Value::from("-p"),
            Value::from(m.guest_path.as_str()),
        ])));
    }

    let mut config = value!({
        "growpart": {"mode": "auto", "devices": ["/"]},
        "resizefs": true,
        "users": [(user_entry)],
        "chpasswd": {"expire": false, "list": (format!("{user}:password"))},
        "ssh_pwauth": true,
    });

    if let Some(obj) = config.as_object_mut() {
        if !bootcmd.is_empty() {
            obj.insert("bootcmd", Value::from(bootcmd));
        }
        if has_bind_mounts {
            obj.insert("packages", Value::from(VArray::from_iter([Value::from("9base")])));
        }
        if !mounts.is_empty() {
            let mut mount_entries = VArray::new();
            for m in mounts {
                let (device_or_tag, fstype, options): (String, &str, String) = match &m.target {
                    MountTarget::NamedVolume { device } => {
                        let opts = if m.read_only { "ro" } else { "defaults" };
                        (device.clone(), "ext4", opts.to_string())
                    }
                    MountTarget::BindMount { tag, .. } => {
                        let opts = m.mount_options.clone().unwrap_or_else(|| {
                            format!("trans=virtio,version=9p2000.L{}", if m.read_only { ",ro" } else { "" })
                        });
                        (tag.clone(), "9p", opts)
                    }
                };
                if !m.automount {
                    continue;
                }
                let entry = VArray::from_iter([
                    Value::from(device_or_tag.as_str()),
                    Value::from(m.guest_path.as_str()),
                    Value::from(fstype),
                    Value::from(options.as_str()),
                    Value::from("0"),
                    Value::from(if matches!(m.target, MountTarget::NamedVolume { .. }) { "2" } else { "0" }),
                ]);
                mount_entries.push(Value::from(entry));
            }
            if !mount_entries.is_empty() {
                obj.insert("mounts", Value::from(mount_entries));
            }
        }
    }

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}

fn build_meta_data(vm_name: &str) -> String {
    format!("instance-id: {vm_name}\nlocal-hostname: {vm_name}\n")
}

fn build_network_config(macs: &[String]) -> Option<String> {
    if macs.is_empty() {
        return None;
    }
    let mut out = String::from("version: 2\nethernets:\n");
    for (i, mac) in macs.iter().enumerate() {
        out.push_str(&format!(
            "  net{i}:\n    match:\n      macaddress: \"{mac}\"\n    dhcp4: true\n    set-name: net{i}\n"
        ));
    }
    Some(out)
}

/// Write `user-data`/`meta-data`/`network-config` into `cloudinit_dir` and
/// pack them into `seed_path` as a `cidata`-labelled ISO via genisoimage
/// (falling back to mkisofs).
pub async fn generate_seed_iso(
    cloudinit_dir: &Path,
    seed_path: &Path,
    vm_name: &str,
    image_url: &str,
    ssh_dir: &Path,
    mounts: &[MountPlanEntry],
    macs: &[String],
) -> Result<(), ComposeError> {
    tokio::fs::create_dir_all(cloudinit_dir)
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("creating directory {}", cloudinit_dir.display()),
            source: e,
        })?;

    let public_key = sshkeys::read_public_key(ssh_dir).await?;
    let user = default_user(image_url);

    let user_data = build_user_data(user, &public_key, mounts);
    let meta_data = build_meta_data(vm_name);
    let network_config = build_network_config(macs);

    tokio::fs::write(cloudinit_dir.join("user-data"), user_data)
        .await
        .map_err(|e| ComposeError::Io {
            context: "writing user-data".into(),
            source: e,
        })?;
    tokio::fs::write(cloudinit_dir.join("meta-data"), meta_data)
        .await
        .map_err(|e| ComposeError::Io {
            context: "writing meta-data".into(),
            source: e,
        })?;
    if let Some(network_config) = &network_config {
        tokio::fs::write(cloudinit_dir.join("network-config"), network_config)
            .await
            .map_err(|e| ComposeError::Io {
                context: "writing network-config".into(),
                source: e,
            })?;
    }

    let dir_str = cloudinit_dir.display().to_string();
    let seed_str = seed_path.display().to_string();
    let args = ["-output", &seed_str, "-volid", "cidata", "-joliet", "-rock", &dir_str];

    if subprocess::is_on_path("genisoimage") {
        subprocess::run("genisoimage", &args).await?;
    } else {
        subprocess::run("mkisofs", &args).await?;
    }

    tracing::info!(path = %seed_path.display(), "generated cloud-init seed ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_detects_fedora() {
        assert_eq!(default_user("https://example.com/fedora-cloud.qcow2"), "fedora");
    }

    #[test]
    fn default_user_falls_back_to_ubuntu() {
        assert_eq!(default_user("https://example.com/something-else.img"), "ubuntu");
    }

    #[test]
    fn user_data_is_valid_cloud_config() {
        let ud = build_user_data("ubuntu", "ssh-ed25519 AAAA key", &[]);
        assert!(ud.starts_with("#cloud-config\n"));
        assert!(ud.contains("name: ubuntu"));
    }

    #[test]
    fn user_data_includes_named_volume_mount() {
        let mounts = vec![MountPlanEntry {
            target: MountTarget::NamedVolume { device: "/dev/vdb".into() },
            guest_path: "/data".into(),
            read_only: false,
            automount: true,
            mount_options: None,
        }];
        let ud = build_user_data("ubuntu", "key", &mounts);
        assert!(ud.contains("/dev/vdb"));
        assert!(ud.contains("/data"));
        assert!(ud.contains("ext4"));
    }

    #[test]
    fn user_data_includes_bind_mount_with_9p_options() {
        let mounts = vec![MountPlanEntry {
            target: MountTarget::BindMount { tag: "mount0".into(), host_path: "/home/user/src".into() },
            guest_path: "/src".into(),
            read_only: true,
            automount: true,
            mount_options: None,
        }];
        let ud = build_user_data("ubuntu", "key", &mounts);
        assert!(ud.contains("mount0"));
        assert!(ud.contains("9p"));
        assert!(ud.contains("ro"));
        assert!(ud.contains("modprobe"));
    }

    #[test]
    fn network_config_is_none_without_macs() {
        assert!(build_network_config(&[]).is_none());
    }

    #[test]
    fn network_config_lists_each_mac() {
        let cfg = build_network_config(&["52:54:00:aa:bb:cc".into()]).unwrap();
        assert!(cfg.contains("52:54:00:aa:bb:cc"));
        assert!(cfg.contains("dhcp4: true"));
    }

    #[test]
    fn meta_data_has_hostname() {
        let md = build_meta_data("web");
        assert!(md.contains("local-hostname: web"));
    }
}
