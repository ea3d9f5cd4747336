use std::path::PathBuf;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatMemberStatus, ChatMemberUpdated};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use gemrelay::chatbot::attachments::AttachmentStager;
use gemrelay::chatbot::dispatch::ResponseDispatcher;
use gemrelay::chatbot::gateway::ModelGateway;
use gemrelay::chatbot::gemini::GeminiClient;
use gemrelay::chatbot::live::GeminiLive;
use gemrelay::chatbot::message::mentions;
use gemrelay::chatbot::prompt::PromptBuilder;
use gemrelay::chatbot::roster::Roster;
use gemrelay::chatbot::voice::{VoiceNoteOutput, VoiceSessions};
use gemrelay::chatbot::{
    ChatMessage, ChatbotConfig, ChatbotEngine, Command, EngineParts, RawAttachment, TelegramClient,
};
use gemrelay::config::{Config, DEFAULT_CONFIG_PATH};
use gemrelay::telegram_log::TelegramLogLayer;

struct BotState {
    engine: ChatbotEngine,
    bot_id: UserId,
    bot_username: String,
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("gemrelay.log"))
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            std::process::exit(1);
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        let transport = Arc::new(TelegramClient::new(bot.clone()));
        let tg_layer = TelegramLogLayer::new(transport, log_chat_id.0);
        registry.with(tg_layer).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting gemrelay...");
    info!(
        "Loaded config from {}",
        config_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("{DEFAULT_CONFIG_PATH} (or defaults)"))
    );
    info!(
        "Models: text={}, vision={}, live={}",
        config.text_model, config.vision_model, config.live_model
    );

    let me = match bot.get_me().await {
        Ok(me) => me,
        Err(e) => {
            error!("Failed to get bot info: {e}");
            std::process::exit(1);
        }
    };
    let bot_username = me.username().to_string();
    info!("Bot user ID: {}, username: @{}", me.id, bot_username);

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register commands: {e}");
    }

    let state = Arc::new(BotState {
        engine: build_engine(&config, &bot, &bot_username),
        bot_id: me.id,
        bot_username,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_new_message))
        .branch(Update::filter_chat_member().endpoint(handle_chat_member));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn build_engine(config: &Config, bot: &Bot, bot_username: &str) -> ChatbotEngine {
    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    let gemini = Arc::new(GeminiClient::new(config.gemini_api_key.clone()));
    let live = Arc::new(GeminiLive::new(
        config.gemini_api_key.clone(),
        config.live_model.clone(),
    ));

    let parts = EngineParts {
        transport: telegram.clone(),
        stager: AttachmentStager::new(telegram.clone(), gemini.clone(), config.stager_config()),
        builder: PromptBuilder::new(config.persona.clone()),
        gateway: ModelGateway::new(gemini, config.gateway_settings()),
        dispatcher: ResponseDispatcher::new(config.chunk_size),
        roster: Arc::new(Roster::new(config.online_window)),
        voice: VoiceSessions::new(live, Arc::new(VoiceNoteOutput::new(telegram))),
    };

    ChatbotEngine::new(
        ChatbotConfig {
            bot_username: Some(bot_username.to_string()),
            max_history: config.max_history,
        },
        parts,
    )
}

async fn handle_new_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if msg.from.is_none() {
        return Ok(());
    }

    let chat_msg = telegram_to_chat_message(&msg, &state);
    let command = Command::from_text(&chat_msg.text, &state.bot_username);

    // Generations can take a while; don't hold up the update stream.
    tokio::spawn(async move {
        match command {
            Some(command) => state.engine.handle_command(chat_msg, command).await,
            None => state.engine.handle_message(chat_msg).await,
        }
    });

    Ok(())
}

fn telegram_to_chat_message(msg: &Message, state: &BotState) -> ChatMessage {
    let user = msg.from.as_ref();
    let user_id = user.map(|u| u.id.0 as i64).unwrap_or(0);
    let display_name = user
        .map(|u| u.full_name())
        .unwrap_or_else(|| "unknown".to_string());

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();

    let replies_to_bot = msg
        .reply_to_message()
        .and_then(|reply| reply.from.as_ref())
        .is_some_and(|u| u.id == state.bot_id);

    ChatMessage {
        message_id: msg.id.0 as i64,
        chat_id: msg.chat.id.0,
        user_id,
        display_name,
        mentions_bot: mentions(&text, &state.bot_username),
        text,
        attachments: attachments_of(msg),
        replies_to_bot,
        is_private: msg.chat.is_private(),
        from_bot_itself: user.is_some_and(|u| u.id == state.bot_id),
    }
}

/// Media on a message, with declared MIME types.
fn attachments_of(msg: &Message) -> Vec<RawAttachment> {
    let mut attachments = Vec::new();

    // Largest size is last; Telegram re-encodes photos as JPEG.
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        attachments.push(RawAttachment {
            file_id: photo.file.id.0.clone(),
            file_name: "photo.jpg".to_string(),
            mime_type: Some("image/jpeg".to_string()),
        });
    }
    if let Some(doc) = msg.document() {
        attachments.push(RawAttachment {
            file_id: doc.file.id.0.clone(),
            file_name: doc.file_name.clone().unwrap_or_else(|| "document".to_string()),
            mime_type: doc.mime_type.as_ref().map(|m| m.essence_str().to_string()),
        });
    }
    if let Some(voice) = msg.voice() {
        attachments.push(RawAttachment {
            file_id: voice.file.id.0.clone(),
            file_name: "voice.ogg".to_string(),
            mime_type: Some("audio/ogg".to_string()),
        });
    }
    if let Some(audio) = msg.audio() {
        attachments.push(RawAttachment {
            file_id: audio.file.id.0.clone(),
            file_name: audio.file_name.clone().unwrap_or_else(|| "audio".to_string()),
            mime_type: audio.mime_type.as_ref().map(|m| m.essence_str().to_string()),
        });
    }
    if let Some(video) = msg.video() {
        attachments.push(RawAttachment {
            file_id: video.file.id.0.clone(),
            file_name: video.file_name.clone().unwrap_or_else(|| "video.mp4".to_string()),
            mime_type: video.mime_type.as_ref().map(|m| m.essence_str().to_string()),
        });
    }

    attachments
}

async fn handle_chat_member(update: ChatMemberUpdated, state: Arc<BotState>) -> ResponseResult<()> {
    let user = &update.new_chat_member.user;
    let chat_id = update.chat.id.0;
    let user_id = user.id.0 as i64;
    let name = user.full_name();

    match update.new_chat_member.status() {
        ChatMemberStatus::Member | ChatMemberStatus::Administrator | ChatMemberStatus::Owner => {
            if matches!(
                update.old_chat_member.status(),
                ChatMemberStatus::Left | ChatMemberStatus::Banned
            ) {
                info!("👋 Member joined: {} ({})", name, user_id);
                state.engine.handle_member_joined(chat_id, user_id, &name);
            }
        }
        ChatMemberStatus::Left => {
            info!("👋 Member left: {} ({})", name, user_id);
            state.engine.handle_member_left(chat_id, user_id);
        }
        ChatMemberStatus::Banned => {
            info!("🚫 Member banned: {} ({})", name, user_id);
            state.engine.handle_member_left(chat_id, user_id);
        }
        _ => {}
    }

    Ok(())
}
