//! Settlement client implementations, selected by configuration.

pub mod fake;
pub mod http;

pub use fake::FakeSettlementClient;
pub use http::HttpSettlementClient;

use crate::config::SettlementConfig;
use settlement_core::environment::Clock;
use settlement_core::{SettlementClient, SettlementError};
use std::sync::Arc;
use std::time::Duration;

/// Build the configured settlement client.
///
/// # Errors
///
/// Returns [`SettlementError::ClientConstruction`] for an unknown provider
/// name or an incomplete HTTP configuration.
pub fn from_config(
    config: &SettlementConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SettlementClient>, SettlementError> {
    match config.provider.as_str() {
        "fake" => Ok(Arc::new(FakeSettlementClient::new(clock))),
        "http" => Ok(Arc::new(HttpSettlementClient::new(
            config.base_url.clone(),
            config.jwt.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )?)),
        other => Err(SettlementError::ClientConstruction(format!(
            "unknown settlement provider: {other:?}"
        ))),
    }
}
