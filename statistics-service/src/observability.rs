use tracing_subscriber::EnvFilter;

/// Honours `RUST_LOG`; defaults to `statistics_service=info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("statistics_service=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
