use std::{str::FromStr, sync::atomic::AtomicBool};

use tracing::Level;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter, Layer};

static IS_TRACING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install a subscriber driven by the `TRACE` environment variable.
///
/// `TRACE` is either a bare level (`debug`), which enables that level for the
/// whole engine, or a full `tracing-subscriber` directive string. Unset means
/// no subscriber at all; calling this more than once is a no-op.
pub fn enable_tracing_by_env() {
    let Ok(trace_var) = std::env::var("TRACE") else {
        return
    };

    if !IS_TRACING_ENABLED.swap(true, std::sync::atomic::Ordering::SeqCst) {
        use tracing_subscriber::{fmt, prelude::*};
        let filter = filter_layer(&trace_var);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_file(true).with_span_events(FmtSpan::CLOSE))
            .init();
        tracing::trace!("enable_tracing_by_env");
    }
}

fn filter_layer(trace_var: &str) -> Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> {
    if let Ok(default_level) = Level::from_str(trace_var) {
        tracing_subscriber::filter::Targets::new()
            .with_targets([("packsync", default_level)])
            .boxed()
    } else {
        EnvFilter::builder()
            .with_regex(true)
            .parse(trace_var)
            .expect("TRACE does not parse as a level or a tracing directive")
            .boxed()
    }
}
