use tracing_subscriber::{prelude::*, util::SubscriberInitExt, EnvFilter};

/// Default directive when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "zk_tracer=info";

/// Installs the global subscriber.
///
/// Logs go to stderr so that tools printing results on stdout stay
/// machine-readable.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}
