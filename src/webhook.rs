use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks::{axum_to_router, Options};
use teloxide::update_listeners::UpdateListener;
use tracing::{error, info};
use url::Url;

pub const HEALTH_TEXT: &str = "Zuh Assistant Bot is running.";

async fn health() -> &'static str {
    HEALTH_TEXT
}

pub fn health_router() -> Router {
    Router::new().route("/", get(health))
}

/// Telegram posts updates to `<base>/<bot token>`.
pub fn webhook_endpoint(base_url: &str, bot_token: &str) -> Result<Url> {
    let base = base_url.trim().trim_end_matches('/');
    Url::parse(&format!("{base}/{bot_token}"))
        .with_context(|| format!("WEBHOOK_URL is not a valid URL: {base_url}"))
}

/// Registers the webhook and serves it next to the health route on
/// `0.0.0.0:port`. Returns the update listener for the dispatcher; the HTTP
/// server runs in the background until the listener is stopped.
pub async fn start_webhook(
    bot: Bot,
    base_url: &str,
    bot_token: &str,
    port: u16,
) -> Result<impl UpdateListener<Err = Infallible>> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let url = webhook_endpoint(base_url, bot_token)?;
    let (listener, stop_flag, webhook_router) = axum_to_router(bot, Options::new(address, url))
        .await
        .context("failed to register the Telegram webhook")?;

    let app = webhook_router.merge(health_router());
    let tcp = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Webhook server listening on {address}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(tcp, app).with_graceful_shutdown(stop_flag).await {
            error!("Webhook server stopped with error: {err}");
        }
    });

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::http::get_http_client;

    #[test]
    fn endpoint_appends_the_token() {
        let url = webhook_endpoint("https://zuh.onrender.com/", "123:abc").unwrap();
        assert_eq!(url.as_str(), "https://zuh.onrender.com/123:abc");
        assert!(webhook_endpoint("not a url", "123:abc").is_err());
    }

    #[tokio::test]
    async fn health_route_answers_get() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, health_router()).await });

        let response = get_http_client()
            .get(format!("http://{address}/"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), HEALTH_TEXT);
    }
}
