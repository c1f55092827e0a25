use tracing_subscriber::EnvFilter;

use crate::Error;

/// Install the global subscriber. Logs go to stderr; stdout carries JSON
/// command output.
pub fn init() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,credlease_core=debug"))
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}
