//! Tracing initialization for the binary entrypoint.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(verbosity: &str) {
    fmt()
        .with_env_filter(EnvFilter::new(verbosity))
        .init();
}
