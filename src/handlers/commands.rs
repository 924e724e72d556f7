use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::info;

use crate::generation::GenerationRequest;
use crate::state::AppState;

const START_TEXT: &str = "Hello! I am Zuh Assistant Bot. Send me a description of your product or \
service and I will write promo text, draw an image and make a short video for it. Use /help to see \
all commands.";

const PROMO_USAGE: &str = "Usage: /promo <description>\nExample: /promo Facade insulation in Tashkent, 3D style";

pub fn help_text(max_photos: usize) -> String {
    format!(
        "Commands:\n\
         /promo <description> - generate promo text, an image and a video\n\
         /slideshow - start collecting photos for a slideshow (up to {max_photos})\n\
         /done - build the slideshow from the collected photos\n\
         /cancel - drop the current slideshow\n\
         /help - show this message\n\n\
         Any plain text message is treated like /promo."
    )
}

/// Normalizes a prompt; `None` when nothing is left to generate from.
pub fn clean_prompt(raw: &str) -> Option<String> {
    let prompt = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if prompt.is_empty() {
        None
    } else {
        Some(prompt)
    }
}

async fn reply(bot: &Bot, message: &Message, text: &str) -> Result<()> {
    bot.send_message(message.chat.id, text.to_string())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    reply(&bot, &message, START_TEXT).await
}

pub async fn help_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    reply(&bot, &message, &help_text(state.sessions.max_photos())).await
}

/// Accepts a prompt and hands it to a detached fan-out job. Returns as soon
/// as the job is spawned.
pub async fn promo_handler(bot: Bot, state: AppState, message: Message, raw_prompt: &str) -> Result<()> {
    let Some(prompt) = clean_prompt(raw_prompt) else {
        return reply(&bot, &message, PROMO_USAGE).await;
    };

    info!(
        "Accepted prompt from chat {} ({} chars)",
        message.chat.id.0,
        prompt.chars().count()
    );
    reply(&bot, &message, "🌀 Got it! Working on your text, image and video.").await?;
    state
        .fan_out
        .spawn(GenerationRequest::new(message.chat.id, prompt));
    Ok(())
}

pub async fn voice_handler(bot: Bot, message: Message) -> Result<()> {
    reply(
        &bot,
        &message,
        "🎙 Voice messages are not supported yet. Please type your request as text.",
    )
    .await
}

pub async fn unknown_command_handler(bot: Bot, message: Message) -> Result<()> {
    reply(&bot, &message, "I don't know that command. Use /help to see what I can do.").await
}

pub fn looks_like_command(text: &str) -> bool {
    text.trim_start().starts_with('/')
}
