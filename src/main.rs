use std::error::Error;
use std::time::Duration;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod config;
mod generation;
mod handlers;
mod providers;
mod session;
mod state;
mod utils;
mod webhook;

use config::Config;
use handlers::{commands, slideshow};
use state::AppState;
use utils::keepalive::spawn_keepalive;
use utils::logging::{init_logging, with_bootstrap_logging};
use utils::redact::Redactor;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Zuh Assistant Bot commands:")]
enum Command {
    #[command(description = "introduce the bot")]
    Start,
    #[command(description = "list commands")]
    Help,
    #[command(description = "generate promo text, an image and a video")]
    Promo(String),
    #[command(description = "start collecting photos for a slideshow")]
    Slideshow,
    #[command(description = "build the slideshow")]
    Done,
    #[command(description = "drop the current slideshow")]
    Cancel,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let config = match with_bootstrap_logging(Config::load) {
        Ok(config) => config,
        Err(err) => {
            with_bootstrap_logging(|| error!("Invalid configuration: {err}"));
            return Err(err.into());
        }
    };
    let _guards = init_logging(&config.log_level, Redactor::new(config.secrets()));

    let bot = Bot::new(config.bot_token.clone());
    info!("Starting Zuh Assistant Bot (log level {})", config.log_level);
    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {err}");
    }

    let webhook_url = config.webhook_url.clone();
    let bot_token = config.bot_token.clone();
    let port = config.port;
    let keepalive = config
        .keepalive_url
        .clone()
        .map(|url| (url, config.keepalive_interval));

    let state = AppState::new(bot.clone(), config);
    state.sessions.spawn_sweeper(SESSION_SWEEP_INTERVAL);
    if let Some((url, interval)) = keepalive {
        info!("Keep-alive pings enabled every {}s", interval.as_secs());
        spawn_keepalive(state.http.clone(), url, interval);
    }

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(dptree::filter(|msg: Message| msg.photo().is_some()).endpoint(handle_photo))
        .branch(
            dptree::filter(|msg: Message| msg.voice().is_some() || msg.audio().is_some())
                .endpoint(handle_voice),
        )
        .branch(
            dptree::filter_map(|msg: Message| msg.text().map(str::to_string)).endpoint(handle_text),
        )
        .endpoint(ignore_message);

    let mut dispatcher = Dispatcher::builder(bot.clone(), message_handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    match webhook_url {
        Some(base_url) => {
            let listener = webhook::start_webhook(bot, &base_url, &bot_token, port).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
        None => {
            info!("WEBHOOK_URL is not set, using long polling");
            dispatcher.dispatch().await;
        }
    }

    Ok(())
}

async fn handle_command(bot: Bot, state: AppState, message: Message, command: Command) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, message).await?,
        Command::Help => commands::help_handler(bot, state, message).await?,
        Command::Promo(prompt) => commands::promo_handler(bot, state, message, &prompt).await?,
        Command::Slideshow => slideshow::slideshow_handler(bot, state, message).await?,
        Command::Done => slideshow::done_handler(bot, state, message).await?,
        Command::Cancel => slideshow::cancel_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_photo(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    if let Err(err) = slideshow::photo_handler(bot, state, message).await {
        error!("photo handler failed: {err}");
    }
    Ok(())
}

async fn handle_voice(bot: Bot, message: Message) -> HandlerResult {
    commands::voice_handler(bot, message).await?;
    Ok(())
}

async fn handle_text(bot: Bot, state: AppState, message: Message, text: String) -> HandlerResult {
    let result = if commands::looks_like_command(&text) {
        commands::unknown_command_handler(bot, message).await
    } else {
        commands::promo_handler(bot, state, message, &text).await
    };
    if let Err(err) = result {
        error!("text handler failed: {err}");
    }
    Ok(())
}

async fn ignore_message() -> HandlerResult {
    Ok(())
}
