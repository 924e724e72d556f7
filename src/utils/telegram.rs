use std::future::Future;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId};
use teloxide::RequestError;
use tokio::task::JoinHandle;
use tracing::warn;

const CHAT_ACTION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
const TELEGRAM_RETRY_ATTEMPTS: usize = 3;
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

pub struct ChatActionHeartbeat {
    task_handle: Option<JoinHandle<()>>,
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Keeps "uploading..." style indicators alive until the guard is dropped.
pub fn start_chat_action_heartbeat(bot: Bot, chat_id: ChatId, action: ChatAction) -> ChatActionHeartbeat {
    let task_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                warn!("send_chat_action failed: {err}");
            }
            tokio::time::sleep(CHAT_ACTION_HEARTBEAT_INTERVAL).await;
        }
    });

    ChatActionHeartbeat {
        task_handle: Some(task_handle),
    }
}

pub fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

/// Runs a Bot API call up to three times. Flood-control waits are honoured,
/// other transient errors back off from 1.5s.
pub async fn with_telegram_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut delay = Duration::from_secs_f32(1.5);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if !telegram_retryable_error(&err) || attempt == TELEGRAM_RETRY_ATTEMPTS => {
                return Err(err);
            }
            Err(err) => {
                warn!("{operation} attempt {attempt} failed: {err}");
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// Splits text into chunks Telegram accepts, preferring line breaks.
pub fn split_for_telegram(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(limit) {
            let piece: String = piece.iter().collect();
            if piece.chars().count() == limit {
                chunks.push(piece);
            } else {
                current_len = piece.chars().count();
                current = piece;
            }
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

pub async fn send_text(bot: &Bot, chat_id: ChatId, text: &str) -> Result<(), RequestError> {
    for chunk in split_for_telegram(text, TELEGRAM_MESSAGE_LIMIT) {
        let chunk = chunk.as_str();
        with_telegram_retry("send_message", move || async move {
            bot.send_message(chat_id, chunk).await
        })
        .await?;
    }
    Ok(())
}

pub fn file_download_url(bot_token: &str, file_path: &str) -> String {
    format!("https://api.telegram.org/file/bot{bot_token}/{file_path}")
}

pub async fn get_file_url(bot: &Bot, bot_token: &str, file_id: &FileId) -> Result<String, RequestError> {
    let file = with_telegram_retry("get_file", || async { bot.get_file(file_id.clone()).await }).await?;
    Ok(file_download_url(bot_token, &file.path))
}
