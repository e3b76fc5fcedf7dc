//! Tracing subscriber setup.

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt::MakeWriter, util::SubscriberInitExt};

use crate::{config::LogFormat, error::BoxError};

/// Install the global subscriber.
///
/// Reads the `RUST_LOG` environment variable (defaults to "info" level).
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init(format: LogFormat) -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    subscriber(format, filter, std::io::stdout).try_init()?;
    Ok(())
}

/// Subscriber writing `format` lines to `writer`.
///
/// JSON lines carry event fields at the top level, next to `message`.
pub(crate) fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    match format {
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
        LogFormat::Json => Box::new(builder.json().flatten_event(true).finish()),
    }
}
