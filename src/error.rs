use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ComposeError {
    #[error("failed to load compose file from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse compose file {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("failed to download image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("image '{url}' is not pulled")]
    #[diagnostic(help("run `qemu-compose pull` first"))]
    ImageNotPulled { url: String },

    #[error("{command} failed: {message}")]
    #[diagnostic(help("ensure {command} is installed and on PATH"))]
    ExternalCommand { command: String, message: String },

    #[error("{command} is not installed or not on PATH")]
    #[diagnostic(help("install {command} or run `qemu-compose doctor` for the full checklist"))]
    MissingBinary { command: String },

    #[error("missing capability: {message}")]
    #[diagnostic(help("run as root, or grant CAP_NET_ADMIN to this binary"))]
    MissingCapability { message: String },

    #[error("netlink error: {message}")]
    Netlink { message: String },

    #[error("no free /24 subnet left in the 172.16.0.0/12 pool")]
    SubnetPoolExhausted,

    #[error("no free SSH host port in [2222, 2322]")]
    PortPoolExhausted,

    #[error("no free network block device for volume formatting")]
    NbdPoolExhausted,

    #[error("VM '{name}' not found in this project")]
    #[diagnostic(help("run `qemu-compose up {name}` to create it first"))]
    VmNotFound { name: String },

    #[error("network '{name}' not found in this project")]
    NetworkNotFound { name: String },

    #[error("mount source not found: {path}")]
    #[diagnostic(help("check that the directory exists relative to the compose file"))]
    MountSourceNotFound { path: String },

    #[error("another operation is already in progress on this project")]
    #[diagnostic(help("wait for the other `qemu-compose` invocation to finish, or remove workspace/.lock if it is stale"))]
    WorkspaceLocked,

    #[error("timed out waiting for SSH on '{name}' after {timeout_s}s")]
    SshTimeout { name: String, timeout_s: u64 },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}
