pub mod fanout;
pub mod progress;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::types::ChatId;
use thiserror::Error;

use crate::providers::media::{MediaError, PreparedImage};
use crate::utils::http::DispatchError;

pub use fanout::{FanOut, FanOutSummary, GenerationRequest, StageOutcome};
pub use progress::ProgressPinger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Text,
    Image,
    Video,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Text, Stage::Image, Stage::Video];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Text => "text",
            Stage::Image => "image",
            Stage::Video => "video",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub enum GeneratedImage {
    Url(String),
    Inline(PreparedImage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoResult {
    Url(String),
    JobId(String),
}

#[derive(Debug, Clone)]
pub enum StageOutput {
    Text(String),
    Image(GeneratedImage),
    Video(VideoResult),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{stage} generation is not configured ({variable} is not set)")]
    NotConfigured {
        stage: Stage,
        variable: &'static str,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("unexpected response from {provider}: {detail}")]
    MalformedResponse {
        provider: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("could not deliver the result: {0}")]
    Delivery(String),
    #[error("stage crashed: {0}")]
    Crashed(String),
}

impl GenerationError {
    pub fn malformed(provider: &'static str, detail: impl Into<String>) -> Self {
        GenerationError::MalformedResponse {
            provider,
            detail: detail.into(),
        }
    }

    pub fn is_not_configured(&self) -> bool {
        matches!(self, GenerationError::NotConfigured { .. })
    }
}

/// Produces the payload for one stage of a prompt.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, stage: Stage, prompt: &str) -> Result<StageOutput, GenerationError>;
}

/// Everything a background job tells the originating chat.
#[async_trait]
pub trait ChatReporter: Send + Sync {
    async fn stage_started(&self, chat_id: ChatId, stage: Stage) -> anyhow::Result<()>;

    async fn deliver(&self, chat_id: ChatId, stage: Stage, output: StageOutput) -> anyhow::Result<()>;

    async fn stage_failed(
        &self,
        chat_id: ChatId,
        stage: Stage,
        error: &GenerationError,
    ) -> anyhow::Result<()>;

    async fn still_working(&self, chat_id: ChatId, elapsed: Duration) -> anyhow::Result<()>;

    async fn all_finished(&self, chat_id: ChatId, summary: &FanOutSummary) -> anyhow::Result<()>;

    async fn internal_error(&self, chat_id: ChatId, detail: &str) -> anyhow::Result<()>;
}
