use std::collections::HashMap;
use std::path::{Path, PathBuf};

use facet::Facet;
use facet_value::Value;
use ipnet::Ipv4Net;

use crate::error::ComposeError;
use crate::paths;

/// Raw shape of the compose document, parsed straight off the YAML.
#[derive(Debug, Clone, Facet)]
pub struct ComposeFile {
    pub version: String,
    #[facet(default)]
    pub networks: HashMap<String, RawNetwork>,
    #[facet(default)]
    pub volumes: HashMap<String, RawVolume>,
    pub vms: HashMap<String, RawVm>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct RawNetwork {
    #[facet(default = "bridge")]
    pub driver: String,
    #[facet(default = "auto")]
    pub subnet: String,
}

impl Default for RawNetwork {
    fn default() -> Self {
        Self {
            driver: "bridge".into(),
            subnet: "auto".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct RawVolume {
    #[facet(default = "10G")]
    pub size: String,
}

impl Default for RawVolume {
    fn default() -> Self {
        Self { size: "10G".into() }
    }
}

#[derive(Debug, Clone, Facet)]
pub struct RawDisk {
    #[facet(default = "10G")]
    pub size: String,
}

#[derive(Debug, Clone, Facet)]
pub struct RawSsh {
    pub port: u16,
}

#[derive(Debug, Clone, Facet)]
pub struct RawVm {
    pub image: String,
    pub cpu: u32,
    pub memory: u64,
    #[facet(default)]
    pub disk: Option<RawDisk>,
    #[facet(default)]
    pub networks: Vec<String>,
    #[facet(default)]
    pub volumes: Vec<Value>,
    // Parsed but not consumed by the controller — see the Open Question
    // decisions in DESIGN.md.
    #[facet(default)]
    pub ports: Vec<String>,
    #[facet(default)]
    pub environment: HashMap<String, String>,
    #[facet(default)]
    pub depends_on: Vec<String>,
    #[facet(default)]
    pub provision: Option<Value>,
    #[facet(default)]
    pub healthcheck: Option<Value>,
    #[facet(default)]
    pub ssh: Option<RawSsh>,
}

/// A single entry of a VM's `volumes` list, normalized from either the
/// short (`"source:target[:ro]"`) or long (mapping) form.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    pub automount: bool,
    pub mount_options: Option<String>,
    pub is_named_volume: bool,
}

/// Subnet specifier for a declared network.
#[derive(Debug, Clone)]
pub enum SubnetSpec {
    Auto,
    Explicit(Ipv4Net),
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub driver: String,
    pub subnet: SubnetSpec,
}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub name: String,
    pub size: String,
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub name: String,
    pub image: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_size: String,
    pub networks: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub ssh_port: Option<u16>,
    pub ports: Vec<String>,
    pub environment: HashMap<String, String>,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub compose_path: PathBuf,
    pub compose_dir: PathBuf,
    pub workspace: PathBuf,
    pub networks: HashMap<String, NetworkConfig>,
    pub volumes: HashMap<String, VolumeConfig>,
    pub vms: HashMap<String, VmConfig>,
}

fn is_bind_mount_source(source: &str) -> bool {
    source.contains('/') || source.contains('\\') || source.starts_with('.')
}

fn parse_short_volume(spec: &str) -> Result<VolumeMount, ComposeError> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(ComposeError::Validation {
            message: format!("invalid volume short form '{spec}' (expected source:target[:flags])"),
        });
    }
    let source = parts[0].to_string();
    let target = parts[1].to_string();
    let mut read_only = false;
    if let Some(flags) = parts.get(2) {
        for flag in flags.split(',').filter(|f| !f.is_empty()) {
            match flag {
                "ro" => read_only = true,
                other => {
                    return Err(ComposeError::Validation {
                        message: format!("unknown volume flag '{other}' in '{spec}'"),
                    });
                }
            }
        }
    }
    Ok(VolumeMount {
        source,
        target,
        read_only,
        automount: true,
        mount_options: None,
        is_named_volume: false,
    })
}

fn parse_long_volume(value: &Value) -> Result<VolumeMount, ComposeError> {
    let obj = value.as_object().ok_or_else(|| ComposeError::Validation {
        message: "volume entry must be a string or a mapping".into(),
    })?;

    let source = obj
        .get("source")
        .and_then(Value::as_str)
        .ok_or_else(|| ComposeError::Validation {
            message: "volume mapping missing 'source'".into(),
        })?
        .to_string();
    let target = obj
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| ComposeError::Validation {
            message: "volume mapping missing 'target'".into(),
        })?
        .to_string();
    let read_only = obj
        .get("read_only")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let automount = obj
        .get("automount")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let mount_options = obj
        .get("mount_options")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(VolumeMount {
        source,
        target,
        read_only,
        automount,
        mount_options,
        is_named_volume: false,
    })
}

fn parse_volume_entry(value: &Value) -> Result<VolumeMount, ComposeError> {
    if let Some(s) = value.as_str() {
        parse_short_volume(s)
    } else {
        parse_long_volume(value)
    }
}

fn valid_vm_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn normalize(raw: ComposeFile, compose_path: &Path) -> Result<Project, ComposeError> {
    let compose_dir = compose_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut networks = HashMap::new();
    for (name, net) in raw.networks {
        if net.driver != "bridge" {
            return Err(ComposeError::Validation {
                message: format!("network '{name}': unsupported driver '{}' (only 'bridge' is accepted)", net.driver),
            });
        }
        let subnet = if net.subnet == "auto" {
            SubnetSpec::Auto
        } else {
            let parsed: Ipv4Net = net.subnet.parse().map_err(|_| ComposeError::Validation {
                message: format!("network '{name}': invalid subnet '{}'", net.subnet),
            })?;
            if parsed.prefix_len() != 24 {
                return Err(ComposeError::Validation {
                    message: format!(
                        "network '{name}': subnet '{}' must have a /24 prefix",
                        net.subnet
                    ),
                });
            }
            SubnetSpec::Explicit(parsed)
        };
        networks.insert(
            name.clone(),
            NetworkConfig {
                name,
                driver: net.driver,
                subnet,
            },
        );
    }

    let volumes: HashMap<String, VolumeConfig> = raw
        .volumes
        .into_iter()
        .map(|(name, v)| {
            (
                name.clone(),
                VolumeConfig {
                    name,
                    size: v.size,
                },
            )
        })
        .collect();

    let mut vms = HashMap::new();
    for (name, vm) in raw.vms {
        if !valid_vm_name(&name) {
            return Err(ComposeError::Validation {
                message: format!("vm name must match [a-zA-Z0-9][a-zA-Z0-9-]* (got '{name}')"),
            });
        }
        if vm.cpu < 1 {
            return Err(ComposeError::Validation {
                message: format!("vm '{name}': cpu must be at least 1"),
            });
        }
        for net_name in &vm.networks {
            if !networks.contains_key(net_name) {
                return Err(ComposeError::Validation {
                    message: format!(
                        "vm '{name}': references undeclared network '{net_name}'"
                    ),
                });
            }
        }

        let mut mounts = Vec::with_capacity(vm.volumes.len());
        for entry in &vm.volumes {
            let mut mount = parse_volume_entry(entry)?;
            if !mount.target.starts_with('/') {
                return Err(ComposeError::Validation {
                    message: format!(
                        "vm '{name}': volume target '{}' must be an absolute path",
                        mount.target
                    ),
                });
            }
            if is_bind_mount_source(&mount.source) {
                mount.is_named_volume = false;
                mount.automount = mount.automount && true;
            } else {
                if !volumes.contains_key(&mount.source) {
                    return Err(ComposeError::Validation {
                        message: format!(
                            "vm '{name}': references undeclared volume '{}'",
                            mount.source
                        ),
                    });
                }
                mount.is_named_volume = true;
                // Named volumes are always auto-mounted regardless of what was declared.
                mount.automount = true;
                mount.mount_options = None;
            }
            mounts.push(mount);
        }

        vms.insert(
            name.clone(),
            VmConfig {
                name,
                image: vm.image,
                cpu: vm.cpu,
                memory_mb: vm.memory,
                disk_size: vm.disk.map(|d| d.size).unwrap_or_else(|| "10G".into()),
                networks: vm.networks,
                volumes: mounts,
                ssh_port: vm.ssh.map(|s| s.port),
                ports: vm.ports,
                environment: vm.environment,
                depends_on: vm.depends_on,
            },
        );
    }

    let name = paths::project_name(compose_path);
    let workspace = paths::workspace_dir(compose_path);

    Ok(Project {
        name,
        compose_path: compose_path.to_path_buf(),
        compose_dir,
        workspace,
        networks,
        volumes,
        vms,
    })
}

pub fn load_project(compose_path: &Path) -> Result<Project, ComposeError> {
    let contents =
        std::fs::read_to_string(compose_path).map_err(|source| ComposeError::ConfigLoad {
            path: compose_path.display().to_string(),
            source,
        })?;

    let raw: ComposeFile = facet_yaml::from_str(&contents).map_err(|e| ComposeError::ConfigParse {
        path: compose_path.display().to_string(),
        message: e.to_string(),
    })?;

    normalize(raw, compose_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compose(vms_yaml: &str) -> String {
        format!("version: \"1\"\nvms:\n{vms_yaml}")
    }

    #[test]
    fn valid_vm_names() {
        for n in ["myvm", "test-vm", "a", "VM01"] {
            assert!(valid_vm_name(n), "expected '{n}' to be valid");
        }
    }

    #[test]
    fn invalid_vm_names() {
        for n in ["", "-bad", "vm.dev", "vm_bad", "a/b"] {
            assert!(!valid_vm_name(n), "expected '{n}' to be rejected");
        }
    }

    #[test]
    fn short_volume_parses_source_target() {
        let m = parse_short_volume("data:/mnt/data").unwrap();
        assert_eq!(m.source, "data");
        assert_eq!(m.target, "/mnt/data");
        assert!(!m.read_only);
    }

    #[test]
    fn short_volume_parses_ro_flag() {
        let m = parse_short_volume("./host:/mnt:ro").unwrap();
        assert!(m.read_only);
    }

    #[test]
    fn short_volume_rejects_unknown_flag() {
        assert!(parse_short_volume("data:/mnt:bogus").is_err());
    }

    #[test]
    fn classifies_bind_mount_vs_named_volume() {
        assert!(is_bind_mount_source("./relative/path"));
        assert!(is_bind_mount_source("/abs/path"));
        assert!(!is_bind_mount_source("myvolume"));
    }

    #[test]
    fn load_project_accepts_empty_vms() {
        let body = "version: \"1\"\nvms: {}\n";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu-compose.yaml");
        std::fs::write(&path, body).unwrap();
        let project = load_project(&path).unwrap();
        assert!(project.vms.is_empty());
    }

    #[test]
    fn load_project_rejects_undeclared_network() {
        let body = compose(
            "  web:\n    image: https://example.com/img.qcow2\n    cpu: 1\n    memory: 512\n    networks: [nope]\n",
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu-compose.yaml");
        std::fs::write(&path, body).unwrap();
        assert!(load_project(&path).is_err());
    }
}
