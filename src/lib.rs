pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod console;
pub mod disk;
pub mod doctor;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod logging;
pub mod mac;
pub mod netlink;
pub mod network;
pub mod paths;
pub mod qemuargv;
pub mod sshkeys;
pub mod subprocess;
pub mod supervisor;
pub mod tap;
pub mod util;
pub mod volume;
