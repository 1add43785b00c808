// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::errors::AttributionError;

/// Installs the global `fmt` subscriber at `log_level`.
///
/// Transport crates are silenced; they log every request at debug level.
pub fn init_tracing(log_level: &str) -> Result<(), AttributionError> {
    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", log_level);
    let filter =
        EnvFilter::try_new(env_filter).map_err(|e| AttributionError::Logging(e.to_string()))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AttributionError::Logging(e.to_string()))?;

    debug!("Logging subsystem enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_directive_rejected() {
        let result = init_tracing("campaign_attribution=loud");
        assert!(matches!(result, Err(AttributionError::Logging(_))));
    }
}
