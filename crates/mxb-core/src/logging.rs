use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for the bot.
pub fn init(service_name: &str) {
    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,mxb=info,mxb_core=info,mxb_http=info,mxb_store=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .init();
}
