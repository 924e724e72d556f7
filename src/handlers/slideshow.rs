use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, ReplyParameters};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::generation::ProgressPinger;
use crate::handlers::responses::INTERNAL_ERROR_MESSAGE;
use crate::providers::media::{decode_image, encode_slideshow_gif, letterbox, SLIDESHOW_BACKGROUND};
use crate::session::{PhotoAdded, SessionError, SessionStart};
use crate::state::AppState;
use crate::utils::http::fetch_bytes;
use crate::utils::telegram::{get_file_url, start_chat_action_heartbeat, with_telegram_retry};
use crate::utils::timing::{complete_job_timer, start_job_timer};

async fn reply(bot: &Bot, message: &Message, text: &str) -> Result<()> {
    bot.send_message(message.chat.id, text.to_string())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub fn session_started_text(start: SessionStart, max_photos: usize) -> String {
    match start {
        SessionStart::Started => format!(
            "📸 Slideshow started. Send up to {max_photos} photos, then /done to build it or /cancel to drop it."
        ),
        SessionStart::AlreadyActive(count) => format!(
            "📸 A slideshow is already in progress with {count} photo(s). Send more photos or /done."
        ),
    }
}

pub async fn slideshow_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let start = state.sessions.start(message.chat.id, Instant::now());
    reply(&bot, &message, &session_started_text(start, state.sessions.max_photos())).await
}

pub async fn photo_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let chat_id = message.chat.id;
    if !state.sessions.is_active(chat_id, Instant::now()) {
        return reply(&bot, &message, "Nice photo! To turn photos into a slideshow, send /slideshow first.").await;
    }

    // Largest size is last.
    let Some(photo) = message.photo().and_then(|sizes| sizes.last()) else {
        return Ok(());
    };

    let text = match state
        .sessions
        .add_photo(chat_id, photo.file.id.clone(), Instant::now())
    {
        Ok(PhotoAdded::Added(count)) => format!("🖼 Photo {count} added."),
        Ok(PhotoAdded::Duplicate(count)) => format!("This photo is already in the slideshow ({count} so far)."),
        Err(err) => err.to_string(),
    };
    reply(&bot, &message, &text).await
}

pub async fn done_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let chat_id = message.chat.id;
    match state.sessions.finish(chat_id, Instant::now()) {
        Ok(photos) => {
            reply(
                &bot,
                &message,
                &format!("🎞 Building your slideshow from {} photo(s)...", photos.len()),
            )
            .await?;
            spawn_slideshow_job(bot, state, chat_id, photos);
            Ok(())
        }
        Err(err) => reply(&bot, &message, &err.to_string()).await,
    }
}

pub async fn cancel_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let text = if state.sessions.cancel(message.chat.id, Instant::now()) {
        "Slideshow cancelled.".to_string()
    } else {
        SessionError::NoSession.to_string()
    };
    reply(&bot, &message, &text).await
}

/// Detached slideshow build with the same supervision as a generation job.
pub fn spawn_slideshow_job(bot: Bot, state: AppState, chat_id: ChatId, photos: Vec<FileId>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = start_job_timer("slideshow", chat_id.0, None);
        let worker = {
            let bot = bot.clone();
            let state = state.clone();
            tokio::spawn(async move { build_and_send(&bot, &state, chat_id, &photos).await })
        };

        match worker.await {
            Ok(Ok(frames)) => {
                complete_job_timer(&mut timer, "success", Some(format!("frames={frames}")));
            }
            Ok(Err(err)) => {
                warn!(
                    "Slideshow for chat {} failed: {}",
                    chat_id.0,
                    state.reporter.redact(&format!("{err:#}"))
                );
                complete_job_timer(&mut timer, "error", Some(err.to_string()));
                if let Err(report_err) = state
                    .reporter
                    .say(chat_id, &format!("⚠️ Could not build the slideshow: {err}"))
                    .await
                {
                    warn!("Failed to report slideshow failure to chat {}: {report_err}", chat_id.0);
                }
            }
            Err(err) => {
                error!("Slideshow job for chat {} crashed: {err}", chat_id.0);
                complete_job_timer(&mut timer, "crashed", Some(err.to_string()));
                state
                    .reporter
                    .admin()
                    .notify(&format!("Slideshow job crashed in chat {}: {err}", chat_id.0))
                    .await;
                if let Err(report_err) = state.reporter.say(chat_id, INTERNAL_ERROR_MESSAGE).await {
                    error!("Failed to report internal error to chat {}: {report_err}", chat_id.0);
                }
            }
        }
    })
}

async fn build_and_send(bot: &Bot, state: &AppState, chat_id: ChatId, photos: &[FileId]) -> Result<usize> {
    let pinger = ProgressPinger::start(state.chat_reporter(), chat_id, state.config.status_interval);
    let _action = start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::UploadVideo);

    let rendered = render_slideshow(bot, state, photos).await;
    pinger.stop().await;
    let (gif, frames) = rendered?;

    info!(
        "Sending {frames}-frame slideshow ({} bytes) to chat {}",
        gif.len(),
        chat_id.0
    );
    with_telegram_retry("send_animation", || async {
        bot.send_animation(chat_id, InputFile::memory(gif.clone()).file_name("slideshow.gif"))
            .caption("🎞 Your slideshow is ready!")
            .await
    })
    .await?;
    Ok(frames)
}

async fn render_slideshow(bot: &Bot, state: &AppState, photos: &[FileId]) -> Result<(Vec<u8>, usize)> {
    let config = &state.config;
    let mut frames: Vec<RgbaImage> = Vec::with_capacity(photos.len());
    for (index, file_id) in photos.iter().enumerate() {
        let url = get_file_url(bot, &config.bot_token, file_id)
            .await
            .with_context(|| format!("could not look up photo {}", index + 1))?;
        let bytes = fetch_bytes(&state.http, &url, config.api_timeout_long, &state.retry)
            .await
            .map_err(|err| anyhow!("could not download photo {}: {err}", index + 1))?;
        let image = decode_image(&bytes).with_context(|| format!("photo {} is not a readable image", index + 1))?;
        frames.push(letterbox(
            &image,
            config.slideshow_width,
            config.slideshow_height,
            SLIDESHOW_BACKGROUND,
        ));
    }

    let frame_count = frames.len();
    let frame_duration = config.slideshow_frame_duration;
    let gif = tokio::task::spawn_blocking(move || encode_slideshow_gif(frames, frame_duration))
        .await
        .context("slideshow encoder stopped unexpectedly")??;
    Ok((gif, frame_count))
}
