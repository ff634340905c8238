use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "warn,kafka_cli=debug"
    } else {
        "warn"
    }
}

/// Log to stderr so stdout only carries command output.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    // a second initialization only happens in tests
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
