use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::utils::http::RetryPolicy;

pub const DEFAULT_CHAT_API_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_IMAGE_API_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_VIDEO_API_URL: &str = "https://api.deepai.org/api/text2video";
pub const DEFAULT_PORT: u16 = 10000;
/// Ceiling for every interval, timeout and TTL read from the environment.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub chat_api_key: String,
    pub chat_api_base_url: String,
    pub chat_model: String,
    pub chat_max_tokens: u32,
    pub chat_temperature: f32,
    pub image_api_key: String,
    pub image_api_base_url: String,
    pub image_model: String,
    pub image_size: String,
    pub image_max_side: u32,
    pub video_api_key: String,
    pub video_api_url: String,
    pub api_timeout_short: Duration,
    pub api_timeout_long: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
    pub status_interval: Duration,
    pub admin_chat_id: Option<i64>,
    pub webhook_url: Option<String>,
    pub port: u16,
    pub keepalive_url: Option<String>,
    pub keepalive_interval: Duration,
    pub slideshow_max_photos: usize,
    pub slideshow_frame_duration: Duration,
    pub slideshow_width: u32,
    pub slideshow_height: u32,
    pub session_ttl: Duration,
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|value| value.trim().to_string())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn optional_string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|value| !value.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        match self.optional_string(name) {
            None => default,
            Some(value) => match value.parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!("Ignoring unparsable {name}={value:?}; using default");
                    default
                }
            },
        }
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        self.parsed(name, default)
    }

    fn u32(&self, name: &str, default: u32) -> u32 {
        self.parsed(name, default)
    }

    fn f32(&self, name: &str, default: f32) -> f32 {
        self.parsed(name, default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        self.parsed(name, default)
    }

    fn seconds(&self, name: &str, default: u64) -> Duration {
        self.bounded_seconds(name, default, 0)
    }

    fn bounded_seconds(&self, name: &str, default: u64, min_seconds: u64) -> Duration {
        let value = Duration::from_secs(self.u64(name, default));
        if value > MAX_CONFIG_DURATION {
            warn!("{name} is larger than {}s; capping it", MAX_CONFIG_DURATION.as_secs());
        }
        value.clamp(Duration::from_secs(min_seconds), MAX_CONFIG_DURATION)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let bot_token = env.string("BOT_TOKEN", "");
        if bot_token.is_empty() {
            return Err(anyhow!("BOT_TOKEN is required"));
        }

        let admin_chat_id = env.optional_string("ADMIN_CHAT_ID").and_then(|value| {
            value
                .parse::<i64>()
                .map_err(|_| warn!("Ignoring invalid ADMIN_CHAT_ID={value:?}"))
                .ok()
        });

        Ok(Config {
            bot_token,
            log_level: env.string("LOG_LEVEL", "info").to_lowercase(),
            chat_api_key: env.string("CHAT_API_KEY", ""),
            chat_api_base_url: env.string("CHAT_API_BASE_URL", DEFAULT_CHAT_API_BASE_URL),
            chat_model: env.string("CHAT_MODEL", "gpt-3.5-turbo"),
            chat_max_tokens: env.u32("CHAT_MAX_TOKENS", 300),
            chat_temperature: env.f32("CHAT_TEMPERATURE", 0.7),
            image_api_key: env.string("IMAGE_API_KEY", ""),
            image_api_base_url: env.string("IMAGE_API_BASE_URL", DEFAULT_IMAGE_API_BASE_URL),
            image_model: env.string("IMAGE_MODEL", ""),
            image_size: env.string("IMAGE_SIZE", "1024x1024"),
            image_max_side: env.u32("IMAGE_MAX_SIDE", 1280).max(1),
            video_api_key: env.string("VIDEO_API_KEY", ""),
            video_api_url: env.string("VIDEO_API_URL", DEFAULT_VIDEO_API_URL),
            api_timeout_short: env.seconds("API_TIMEOUT_SHORT_SECONDS", 15),
            api_timeout_long: env.seconds("API_TIMEOUT_LONG_SECONDS", 120),
            retry_max_attempts: env.u32("RETRY_MAX_ATTEMPTS", 4).max(1),
            retry_base_backoff: Duration::from_millis(env.u64("RETRY_BASE_BACKOFF_MS", 1000))
                .min(MAX_CONFIG_DURATION),
            status_interval: env.bounded_seconds("STATUS_INTERVAL_SECONDS", 30, 1),
            admin_chat_id,
            webhook_url: env.optional_string("WEBHOOK_URL"),
            port: env.parsed("PORT", DEFAULT_PORT),
            keepalive_url: env.optional_string("KEEPALIVE_URL"),
            keepalive_interval: env.bounded_seconds("KEEPALIVE_INTERVAL_SECONDS", 600, 10),
            slideshow_max_photos: env.usize("SLIDESHOW_MAX_PHOTOS", 10).max(1),
            slideshow_frame_duration: env.bounded_seconds("SLIDESHOW_FRAME_SECONDS", 2, 1),
            slideshow_width: env.u32("SLIDESHOW_WIDTH", 640).max(16),
            slideshow_height: env.u32("SLIDESHOW_HEIGHT", 640).max(16),
            session_ttl: env.seconds("SESSION_TTL_SECONDS", 900),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_base_backoff)
    }

    /// Values that must never reach a chat or the logs verbatim.
    pub fn secrets(&self) -> Vec<String> {
        [
            &self.bot_token,
            &self.chat_api_key,
            &self.image_api_key,
            &self.video_api_key,
        ]
        .into_iter()
        .filter(|secret| !secret.trim().is_empty())
        .cloned()
        .collect()
    }
}
