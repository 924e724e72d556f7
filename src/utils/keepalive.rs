use std::time::Duration;

use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::utils::http::{loggable_url, send_with_retry, OutboundRequest, RetryPolicy};

const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ping_once(client: &Client, url: &str) -> bool {
    let request = OutboundRequest::get(url, KEEPALIVE_TIMEOUT);
    let policy = RetryPolicy::new(1, Duration::ZERO);
    match send_with_retry(client, &request, &policy).await {
        Ok(response) => {
            debug!("Keep-alive ping to {} returned {}", loggable_url(url), response.status());
            true
        }
        Err(err) => {
            warn!("Keep-alive ping to {} failed: {err}", loggable_url(url));
            false
        }
    }
}

/// Pings `url` every `interval` so free-tier hosts don't idle the service.
pub fn spawn_keepalive(client: Client, url: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            ping_once(&client, &url).await;
        }
    })
}
