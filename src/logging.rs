use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `debug` forces the crate's own target to `debug`; otherwise `RUST_LOG`
/// wins if set, falling back to `qemu_compose=info`.
pub fn init(debug: bool) {
    let filter = if debug {
        EnvFilter::new("qemu_compose=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qemu_compose=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
