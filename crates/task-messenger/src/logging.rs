//! Tracing subscriber setup for the binaries.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

/// Install a compact fmt subscriber filtered to `level`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: Level) {
    let filters = filter::Targets::new().with_default(level);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}
