use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::LogFormat, errors::Error, Result};

/// Initialize tracing for the gateway.
///
/// Default: info for our crates, warn for everything else. Can be overridden
/// with `RUST_LOG`.
pub fn init(service_name: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,cgw=info,cgw_core=info,cgw_http=info,cgw_telegram=info,cgw_supabase=info,{service_name}=info"
        ))
    });

    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init(),
    };

    installed.map_err(|e| Error::External(format!("failed to install tracing subscriber: {e}")))
}
