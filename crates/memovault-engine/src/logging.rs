use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;

use crate::config::{LogFormat, Logging};

/// Initialize the logging system from the engine configuration.
///
/// The `MEMOVAULT_LOG` environment variable overrides the configured level
/// with a full filter directive. Calling this more than once is a no-op.
pub fn init(config: &Logging) {
    let filter = EnvFilter::builder()
        .with_env_var("MEMOVAULT_LOG")
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let format = match config.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        other => other,
    };

    let builder = fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_env_filter(filter);

    let result = match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Auto | LogFormat::Simplified => builder.compact().with_ansi(false).try_init(),
    };
    result.ok();
}
