//! Information about the build.

/// Client ID sent with every request unless configured otherwise.
pub const DEFAULT_CLIENT_ID: &str = "kafka-cli";

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
