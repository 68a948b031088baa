use tracing_subscriber::{fmt, EnvFilter};

/// Installs the stderr subscriber for both binaries. `RUST_LOG` overrides the
/// default `info` filter. Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
