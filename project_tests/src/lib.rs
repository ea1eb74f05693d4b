//! Shared helpers for the end-to-end tests.

use std::future::Future;
use std::time::Duration;

use lib_happening::HubConfig;

/// Hub settings for loopback tests: ephemeral ports and short poll intervals.
pub fn test_config() -> HubConfig {
    HubConfig {
        events_port: 0,
        clients_port: 0,
        accept_timeout_ms: 50,
        registration_timeout_ms: 500,
        archive_interval_ms: 50,
        ..HubConfig::default()
    }
}

/// Polls `check` every 10ms until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
