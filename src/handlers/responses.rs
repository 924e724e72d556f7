use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::InputFile;
use tracing::warn;
use url::Url;

use crate::generation::{
    ChatReporter, FanOutSummary, GeneratedImage, GenerationError, Stage, StageOutput, VideoResult,
};
use crate::utils::http::truncate_for_log;
use crate::utils::redact::Redactor;
use crate::utils::telegram::{send_text, with_telegram_retry};

pub const INTERNAL_ERROR_MESSAGE: &str =
    "❗ Something went wrong while processing your request. Please try again later.";

/// Forwards operational problems to the admin chat, when one is configured.
#[derive(Clone)]
pub struct AdminNotifier {
    bot: Bot,
    admin_chat: Option<ChatId>,
    redactor: Redactor,
}

impl AdminNotifier {
    pub fn new(bot: Bot, admin_chat_id: Option<i64>, redactor: Redactor) -> Self {
        AdminNotifier {
            bot,
            admin_chat: admin_chat_id.map(ChatId),
            redactor,
        }
    }

    pub async fn notify(&self, text: &str) {
        let Some(admin_chat) = self.admin_chat else {
            return;
        };
        let text = self.redactor.redact(text);
        if let Err(err) = send_text(&self.bot, admin_chat, &text).await {
            warn!("Failed to notify admin chat {}: {err}", admin_chat.0);
        }
    }
}

pub fn stage_title(stage: Stage) -> &'static str {
    match stage {
        Stage::Text => "Text",
        Stage::Image => "Image",
        Stage::Video => "Video",
    }
}

pub fn format_stage_failure(stage: Stage, error: &str) -> String {
    format!("⚠️ {} generation failed: {error}", stage_title(stage))
}

pub fn format_still_working(elapsed: Duration) -> String {
    format!("⏳ Still working... {}s elapsed.", elapsed.as_secs())
}

pub fn format_summary(summary: &FanOutSummary) -> String {
    let total = summary.outcomes.len();
    let succeeded = summary.succeeded_count();
    let seconds = summary.elapsed.as_secs();
    if succeeded == total {
        format!("🎯 All done in {seconds}s.")
    } else {
        format!("🎯 Finished in {seconds}s: {succeeded} of {total} results delivered.")
    }
}

pub fn format_admin_failure_report(chat_id: ChatId, summary: &FanOutSummary) -> String {
    let mut report = format!("Request from chat {} finished with failures:", chat_id.0);
    for (stage, message) in summary.failures() {
        report.push_str(&format!("\n- {stage}: {}", truncate_for_log(message, 300)));
    }
    report
}

/// Sends fan-out and slideshow progress to Telegram chats.
#[derive(Clone)]
pub struct TelegramReporter {
    bot: Bot,
    redactor: Redactor,
    admin: AdminNotifier,
}

impl TelegramReporter {
    pub fn new(bot: Bot, redactor: Redactor, admin: AdminNotifier) -> Self {
        TelegramReporter { bot, redactor, admin }
    }

    pub fn admin(&self) -> &AdminNotifier {
        &self.admin
    }

    pub fn redact(&self, text: &str) -> String {
        self.redactor.redact(text)
    }

    pub async fn say(&self, chat_id: ChatId, text: &str) -> Result<()> {
        send_text(&self.bot, chat_id, &self.redactor.redact(text)).await?;
        Ok(())
    }

    async fn send_image(&self, chat_id: ChatId, image: GeneratedImage) -> Result<()> {
        let bot = &self.bot;
        match image {
            GeneratedImage::Url(url) => {
                let url = Url::parse(&url).with_context(|| format!("invalid image URL: {url}"))?;
                with_telegram_retry("send_photo", || async {
                    bot.send_photo(chat_id, InputFile::url(url.clone())).await
                })
                .await?;
            }
            GeneratedImage::Inline(prepared) => {
                let file_name = prepared.file_name();
                let bytes = prepared.bytes;
                with_telegram_retry("send_photo", || async {
                    bot.send_photo(chat_id, InputFile::memory(bytes.clone()).file_name(file_name))
                        .await
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn send_video(&self, chat_id: ChatId, video: VideoResult) -> Result<()> {
        match video {
            VideoResult::Url(url) => {
                let parsed = Url::parse(&url).with_context(|| format!("invalid video URL: {url}"))?;
                let bot = &self.bot;
                let sent = with_telegram_retry("send_video", || async {
                    bot.send_video(chat_id, InputFile::url(parsed.clone())).await
                })
                .await;
                if let Err(err) = sent {
                    // Some hosts serve pages Telegram cannot fetch; the link still works.
                    warn!("send_video failed for chat {}, sending link instead: {err}", chat_id.0);
                    self.say(chat_id, &format!("🎬 Your video is ready: {url}")).await?;
                }
            }
            VideoResult::JobId(id) => {
                self.say(
                    chat_id,
                    &format!("🎬 Video generation was queued by the provider (job {id})."),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChatReporter for TelegramReporter {
    async fn stage_started(&self, chat_id: ChatId, stage: Stage) -> Result<()> {
        self.say(chat_id, &format!("🌀 Generating {stage}...")).await
    }

    async fn deliver(&self, chat_id: ChatId, _stage: Stage, output: StageOutput) -> Result<()> {
        match output {
            StageOutput::Text(text) => self.say(chat_id, &format!("✅ {text}")).await,
            StageOutput::Image(image) => self.send_image(chat_id, image).await,
            StageOutput::Video(video) => self.send_video(chat_id, video).await,
        }
    }

    async fn stage_failed(&self, chat_id: ChatId, stage: Stage, error: &GenerationError) -> Result<()> {
        self.say(chat_id, &format_stage_failure(stage, &error.to_string()))
            .await
    }

    async fn still_working(&self, chat_id: ChatId, elapsed: Duration) -> Result<()> {
        self.say(chat_id, &format_still_working(elapsed)).await
    }

    async fn all_finished(&self, chat_id: ChatId, summary: &FanOutSummary) -> Result<()> {
        if summary.failures().next().is_some() {
            self.admin
                .notify(&format_admin_failure_report(chat_id, summary))
                .await;
        }
        self.say(chat_id, &format_summary(summary)).await
    }

    async fn internal_error(&self, chat_id: ChatId, detail: &str) -> Result<()> {
        self.admin
            .notify(&format!("Internal error in chat {}: {detail}", chat_id.0))
            .await;
        self.say(chat_id, INTERNAL_ERROR_MESSAGE).await
    }
}

#[cfg(test)]
mod tests {
    use crate::generation::StageOutcome;

    use super::*;

    fn summary(failed: &[Stage]) -> FanOutSummary {
        FanOutSummary {
            outcomes: Stage::ALL
                .iter()
                .map(|stage| {
                    let outcome = if failed.contains(stage) {
                        StageOutcome::Failed(format!("{stage} provider returned 500"))
                    } else {
                        StageOutcome::Succeeded
                    };
                    (*stage, outcome)
                })
                .collect(),
            elapsed: Duration::from_secs(42),
        }
    }

    #[test]
    fn summary_mentions_partial_results() {
        assert_eq!(format_summary(&summary(&[])), "🎯 All done in 42s.");
        assert_eq!(
            format_summary(&summary(&[Stage::Image])),
            "🎯 Finished in 42s: 2 of 3 results delivered."
        );
    }

    #[test]
    fn admin_report_lists_failed_stages() {
        let report = format_admin_failure_report(ChatId(-100), &summary(&[Stage::Image, Stage::Video]));
        assert_eq!(
            report,
            "Request from chat -100 finished with failures:\n- image: image provider returned 500\n- video: video provider returned 500"
        );
    }

    #[test]
    fn stage_messages() {
        assert_eq!(
            format_stage_failure(Stage::Text, "text generation is not configured (CHAT_API_KEY is not set)"),
            "⚠️ Text generation failed: text generation is not configured (CHAT_API_KEY is not set)"
        );
        assert_eq!(format_still_working(Duration::from_secs(60)), "⏳ Still working... 60s elapsed.");
    }
}
