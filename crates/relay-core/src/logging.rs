use crate::Result;

/// Initialize tracing for the relay.
///
/// Default: info for our crates, warn for everything else. Can be overridden
/// with `RUST_LOG`.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,relay=info,relay_core=info,relay_bridge=info,relay_groq=info,relay_telegram=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init()
        .map_err(|e| crate::Error::Config(format!("failed to init tracing: {e}")))?;

    install_panic_hook();
    Ok(())
}

/// Last-resort logger for panics in spawned tasks. It does not recover
/// anything; tokio already isolates the panicking task.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "unhandled panic");
        previous(info);
    }));
}
