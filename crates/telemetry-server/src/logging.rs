use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `log` records from the engine are bridged
/// through tracing-subscriber's `tracing-log` integration.
pub fn init_logging(debug: bool, log_level: Option<&str>) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = log_level
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true))
        .try_init();

    if let Err(error) = result {
        eprintln!("logging already initialised: {error}");
    }
}
