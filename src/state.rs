use std::sync::Arc;

use reqwest::Client;
use teloxide::Bot;
use tracing::{info, warn};

use crate::config::Config;
use crate::generation::{ChatReporter, FanOut};
use crate::handlers::responses::{AdminNotifier, TelegramReporter};
use crate::providers::Providers;
use crate::session::SessionManager;
use crate::utils::http::{get_http_client, RetryPolicy};
use crate::utils::redact::Redactor;

/// Shared handles passed to every update handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionManager,
    pub fan_out: FanOut,
    pub reporter: Arc<TelegramReporter>,
    pub http: Client,
    pub retry: RetryPolicy,
}

impl AppState {
    pub fn new(bot: Bot, config: Config) -> Self {
        let redactor = Redactor::new(config.secrets());
        let admin = AdminNotifier::new(bot.clone(), config.admin_chat_id, redactor.clone());
        let reporter = Arc::new(TelegramReporter::new(bot, redactor, admin));
        let providers = Arc::new(Providers::from_config(&config));
        let stages = providers.configured_stages();
        if stages.is_empty() {
            warn!("No generation API keys are set; every prompt will report \"not configured\"");
        } else {
            info!("Generation stages with credentials: {stages:?}");
        }
        let fan_out = FanOut::new(providers, reporter.clone(), config.status_interval);

        AppState {
            sessions: SessionManager::new(config.session_ttl, config.slideshow_max_photos),
            fan_out,
            reporter,
            http: get_http_client().clone(),
            retry: config.retry_policy(),
            config: Arc::new(config),
        }
    }

    pub fn chat_reporter(&self) -> Arc<dyn ChatReporter> {
        self.reporter.clone()
    }
}
