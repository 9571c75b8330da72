use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter,
    filter::Directive,
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::eviction::METRIC_EVICTED_ROWS_TOTAL;
use crate::cache::manager::METRIC_READ_TOTAL;
use crate::cache::refresh::{METRIC_REFRESH_JOINED_TOTAL, METRIC_REFRESH_MS, METRIC_REFRESH_TOTAL};
use crate::cache::sync::METRIC_SYNC_RUNS_TOTAL;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Applied only when `RUST_LOG` is unset; sqlx logs every statement at info.
const QUIET_DEPENDENCIES: &[&str] = &["sqlx=warn", "hyper_util=warn", "reqwest=warn"];

/// Install the global tracing subscriber. Logs go to stderr so command output
/// on stdout stays machine-readable.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter(logging))
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn env_filter(logging: &LoggingSettings) -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
        for directive in QUIET_DEPENDENCIES {
            if let Ok(directive) = directive.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

/// Register descriptions for every metric the cache core emits. Safe to call
/// more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_READ_TOTAL,
            Unit::Count,
            "Cache reads, labelled by the freshness of the stored rows."
        );
        describe_counter!(
            METRIC_REFRESH_TOTAL,
            Unit::Count,
            "Network refreshes that ran to completion, labelled by result."
        );
        describe_counter!(
            METRIC_REFRESH_JOINED_TOTAL,
            Unit::Count,
            "Refresh requests that joined a refresh already in flight."
        );
        describe_histogram!(
            METRIC_REFRESH_MS,
            Unit::Milliseconds,
            "Refresh latency from fetch start to commit, in milliseconds."
        );
        describe_counter!(
            METRIC_EVICTED_ROWS_TOTAL,
            Unit::Count,
            "Rows removed by eviction or clear-all, labelled by table."
        );
        describe_counter!(
            METRIC_SYNC_RUNS_TOTAL,
            Unit::Count,
            "Background sync runs, labelled by outcome."
        );
    });
}
