use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;

/// Output shape of the runtime's log stream. Text for operators at a
/// terminal, JSON for log pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(UnknownLogFormat {
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown log format: {value} (expected \"text\" or \"json\")")]
pub struct UnknownLogFormat {
    value: String,
}

/// Install the global tracing subscriber for a floodgate process. Fails if
/// some other subscriber was installed first.
pub fn init_tracing(
    log_level: LevelFilter,
    format: LogFormat,
) -> Result<(), SetGlobalDefaultError> {
    let registry = tracing_subscriber::Registry::default().with(log_level);

    match format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true);
            tracing::subscriber::set_global_default(registry.with(fmt_layer))
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_span_list(false);
            tracing::subscriber::set_global_default(registry.with(fmt_layer))
        }
    }
}
