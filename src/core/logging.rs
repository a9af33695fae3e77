use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;
use crate::core::config::Config;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `Config::log_level`. Calling this more than
/// once keeps the first subscriber.
pub fn init(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(env_filter)
        .with_thread_ids(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
