use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "qemu-compose", about = "Declarative QEMU/KVM VM orchestration from a compose file")]
pub struct Cli {
    /// Path to the compose file (default: search order documented in the
    /// README — `-f`, then `QEMU_COMPOSE_FILE`, then `qemu-compose.yaml`).
    #[arg(short = 'f', long = "file", global = true)]
    pub file: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and start VMs (all VMs if none are named).
    Up {
        /// VM names to bring up; empty means all.
        vms: Vec<String>,
    },

    /// Stop running VMs (all VMs if none are named).
    Stop {
        vms: Vec<String>,
    },

    /// Stop and remove VMs' overlay disks and workspace state.
    Destroy {
        vms: Vec<String>,
    },

    /// List VMs and their status.
    Ps {
        /// Block until every selected VM reports ready (or times out).
        #[arg(long)]
        wait: bool,
    },

    /// Show detailed information about one VM.
    Inspect {
        vm: String,
        #[arg(long, default_value = "text")]
        format: InspectFormat,
    },

    /// Download (or re-download with --force) a VM's base image into the cache.
    Pull {
        vms: Vec<String>,
        #[arg(long)]
        force: bool,
    },

    /// Run environment precondition checks.
    Doctor,

    /// Attach to a VM's serial console.
    Console {
        vm: String,
    },

    /// SSH into a VM using the project's generated keypair.
    Ssh {
        vm: String,
        /// Extra arguments passed through to `ssh`.
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Manage the base image cache.
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },

    /// Manage project networks.
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List cached base images.
    Ls,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// List the project's networks.
    Ls,
    /// Tear down networks (all if none named).
    Down {
        networks: Vec<String>,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum InspectFormat {
    Text,
    Json,
}
