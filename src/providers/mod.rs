pub mod chat;
pub mod images;
pub mod media;
pub mod video;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;

use crate::config::Config;
use crate::generation::{GenerationError, Stage, StageOutput, StageRunner};
use crate::utils::http::{get_http_client, truncate_for_log, RetryPolicy};

pub use chat::ChatClient;
pub use images::ImageClient;
pub use video::VideoClient;

pub(crate) async fn read_json(response: Response, provider: &'static str) -> Result<Value, GenerationError> {
    let text = response.text().await.map_err(|err| {
        GenerationError::malformed(provider, format!("could not read response body: {err}"))
    })?;
    serde_json::from_str(&text).map_err(|_| {
        GenerationError::malformed(
            provider,
            format!("response is not JSON: {}", truncate_for_log(text.trim(), 200)),
        )
    })
}

/// Trimmed string at `value`, skipping blanks so callers can fall through
/// to the next candidate field.
pub(crate) fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Short description of a JSON value for error messages.
pub(crate) fn describe_shape(value: &Value) -> String {
    match value {
        Value::Object(map) if map.is_empty() => "empty JSON object".to_string(),
        Value::Object(map) => format!(
            "no usable field among [{}]",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
        other => format!("unexpected JSON: {}", truncate_for_log(&other.to_string(), 200)),
    }
}

/// The three upstream generators behind one retry policy and HTTP client.
#[derive(Debug, Clone)]
pub struct Providers {
    http: Client,
    retry: RetryPolicy,
    pub chat: ChatClient,
    pub image: ImageClient,
    pub video: VideoClient,
}

impl Providers {
    pub fn new(http: Client, retry: RetryPolicy, chat: ChatClient, image: ImageClient, video: VideoClient) -> Self {
        Providers {
            http,
            retry,
            chat,
            image,
            video,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Providers::new(
            get_http_client().clone(),
            config.retry_policy(),
            ChatClient {
                api_key: config.chat_api_key.clone(),
                base_url: config.chat_api_base_url.clone(),
                model: config.chat_model.clone(),
                max_tokens: config.chat_max_tokens,
                temperature: config.chat_temperature,
                timeout: config.api_timeout_short,
            },
            ImageClient {
                api_key: config.image_api_key.clone(),
                base_url: config.image_api_base_url.clone(),
                model: config.image_model.clone(),
                size: config.image_size.clone(),
                max_side: config.image_max_side,
                timeout: config.api_timeout_long,
            },
            VideoClient {
                api_key: config.video_api_key.clone(),
                url: config.video_api_url.clone(),
                timeout: config.api_timeout_long,
            },
        )
    }

    pub fn configured_stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        if self.chat.is_configured() {
            stages.push(Stage::Text);
        }
        if self.image.is_configured() {
            stages.push(Stage::Image);
        }
        if self.video.is_configured() {
            stages.push(Stage::Video);
        }
        stages
    }
}

#[async_trait]
impl StageRunner for Providers {
    async fn run_stage(&self, stage: Stage, prompt: &str) -> Result<StageOutput, GenerationError> {
        match stage {
            Stage::Text => self
                .chat
                .generate(&self.http, &self.retry, prompt)
                .await
                .map(StageOutput::Text),
            Stage::Image => self
                .image
                .generate(&self.http, &self.retry, prompt)
                .await
                .map(StageOutput::Image),
            Stage::Video => self
                .video
                .generate(&self.http, &self.retry, prompt)
                .await
                .map(StageOutput::Video),
        }
    }
}
