//! Chatbot engine - relays chat turns to Gemini and answers back.

use std::sync::Arc;

use chrono::Utc;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

use crate::chatbot::attachments::AttachmentStager;
use crate::chatbot::commands::Command;
use crate::chatbot::conversation::{ConversationStore, MAX_HISTORY_MESSAGES, Role, Turn};
use crate::chatbot::dispatch::{ChatTransport, Destination, ResponseDispatcher};
use crate::chatbot::gateway::{ModelGateway, Route, RouteContext, select_route};
use crate::chatbot::message::ChatMessage;
use crate::chatbot::prompt::PromptBuilder;
use crate::chatbot::roster::RosterProvider;
use crate::chatbot::voice::{JoinOutcome, VoiceSessions};

/// Chatbot configuration.
#[derive(Debug, Clone)]
pub struct ChatbotConfig {
    /// Stripped from mentions before the text is stored.
    pub bot_username: Option<String>,
    /// Turns kept per conversation.
    pub max_history: usize,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            bot_username: None,
            max_history: MAX_HISTORY_MESSAGES,
        }
    }
}

/// Collaborators the engine drives.
pub struct EngineParts {
    pub transport: Arc<dyn ChatTransport>,
    pub stager: AttachmentStager,
    pub builder: PromptBuilder,
    pub gateway: ModelGateway,
    pub dispatcher: ResponseDispatcher,
    pub roster: Arc<dyn RosterProvider>,
    pub voice: Arc<VoiceSessions>,
}

/// The chatbot engine.
pub struct ChatbotEngine {
    config: ChatbotConfig,
    store: ConversationStore,
    transport: Arc<dyn ChatTransport>,
    stager: AttachmentStager,
    builder: PromptBuilder,
    gateway: ModelGateway,
    dispatcher: ResponseDispatcher,
    roster: Arc<dyn RosterProvider>,
    voice: Arc<VoiceSessions>,
}

impl ChatbotEngine {
    pub fn new(config: ChatbotConfig, parts: EngineParts) -> Self {
        Self {
            store: ConversationStore::new(config.max_history),
            config,
            transport: parts.transport,
            stager: parts.stager,
            builder: parts.builder,
            gateway: parts.gateway,
            dispatcher: parts.dispatcher,
            roster: parts.roster,
            voice: parts.voice,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Handle an incoming non-command message.
    pub async fn handle_message(&self, msg: ChatMessage) {
        self.observe(&msg);
        if !msg.is_triggered() {
            return;
        }

        info!(
            "📨 {} ({}) in {}: \"{}\"",
            msg.display_name,
            msg.user_id,
            msg.chat_id,
            msg.text.chars().take(50).collect::<String>()
        );

        let content = msg.clean_content(self.config.bot_username.as_deref());
        self.relay(&msg, &content, Destination::channel(msg.chat_id)).await;
    }

    /// Handle a parsed slash command.
    pub async fn handle_command(&self, msg: ChatMessage, command: Command) {
        self.observe(&msg);
        info!("⌨️ {:?} from {} in {}", command, msg.display_name, msg.chat_id);
        let here = Destination::reply(msg.chat_id, msg.message_id);

        match command {
            Command::Reset => {
                self.store.reset(msg.chat_id);
                self.say(here, "History cleared!").await;
            }
            Command::Ask(question) => {
                let question = question.trim();
                if question.is_empty() && msg.attachments.is_empty() {
                    self.say(here, "Usage: /ask <question>").await;
                    return;
                }
                self.relay(&msg, question, here).await;
            }
            Command::JoinVoice => {
                let facts = self.roster.facts(msg.chat_id);
                let instruction = self.builder.system_instruction(&msg.text, &facts);
                match self.voice.join(msg.chat_id, &instruction).await {
                    Ok(JoinOutcome::Joined) => {
                        self.say(here, "🎙️ Joined voice. Talk to me and I'll answer out loud.")
                            .await
                    }
                    Ok(JoinOutcome::AlreadyActive) => {
                        self.say(here, "Already in voice here.").await
                    }
                    Err(e) => {
                        error!("Voice join failed in {}: {}", msg.chat_id, e);
                        self.say(here, &format!("Error: {e}")).await;
                    }
                }
            }
            Command::LeaveVoice => {
                if self.voice.leave(msg.chat_id) {
                    self.say(here, "Left voice.").await;
                } else {
                    self.say(here, "Not in voice here.").await;
                }
            }
            Command::Help => {
                self.say(here, &Command::descriptions().to_string()).await;
            }
        }
    }

    /// Handle a member joining.
    pub fn handle_member_joined(&self, chat_id: i64, user_id: i64, display_name: &str) {
        self.roster.member_joined(chat_id, user_id, display_name, Utc::now());
    }

    /// Handle a member leaving or being banned.
    pub fn handle_member_left(&self, chat_id: i64, user_id: i64) {
        self.roster.member_left(chat_id, user_id);
    }

    fn observe(&self, msg: &ChatMessage) {
        if !msg.from_bot_itself {
            self.roster
                .observe(msg.chat_id, msg.user_id, &msg.display_name, Utc::now());
        }
    }

    /// One full turn: stage, append, route, then append the reply or roll back.
    async fn relay(&self, msg: &ChatMessage, content: &str, destination: Destination) {
        let chat_id = msg.chat_id;
        if content.is_empty() && msg.attachments.is_empty() {
            debug!("Nothing to relay from {}", msg.display_name);
            return;
        }

        self.transport.typing(chat_id).await;
        let media = self.stager.stage(&msg.attachments).await;
        if content.is_empty() && media.is_empty() {
            debug!("All attachments from {} were dropped", msg.display_name);
            return;
        }

        let turn = Turn::user(msg.attributed(content), media);
        let route = select_route(&RouteContext::new(self.voice.is_active(chat_id), &turn));

        let conversation = self.store.get_or_create(chat_id);
        let mut conversation = conversation.lock().await;
        let spoken = turn.text().unwrap_or_default().to_string();
        conversation.append(turn);

        let reply = match route {
            Route::LiveSession => {
                let Err(e) = self.voice.send_text(chat_id, &spoken) else {
                    debug!("Sent turn to voice session in {}", chat_id);
                    return;
                };
                Err(e)
            }
            Route::Generate(backend) => {
                let turns: Vec<Turn> = conversation.turns().cloned().collect();
                let facts = self.roster.facts(chat_id);
                let payload = self.builder.build(&turns, &facts, backend.shape());
                self.transport.typing(chat_id).await;
                self.gateway.generate(payload, backend).await
            }
        };

        match reply {
            Ok(text) => {
                conversation.append(Turn::model(text.as_str()));
                conversation.trim_to(self.config.max_history);
                drop(conversation);
                info!("💬 Replying in {} ({} chars)", chat_id, text.chars().count());
                if let Err(e) = self
                    .dispatcher
                    .emit(self.transport.as_ref(), &text, destination)
                    .await
                {
                    error!("Failed to deliver reply in {}: {}", chat_id, e);
                }
            }
            Err(e) => {
                if conversation.rollback_last_if_role(Role::User).is_some() {
                    debug!("Rolled back failed turn in {}", chat_id);
                }
                drop(conversation);
                warn!("Generation failed in {}: {}", chat_id, e);
                self.say(destination, &format!("Error: {e}")).await;
            }
        }
    }

    async fn say(&self, destination: Destination, text: &str) {
        if let Err(e) = self
            .dispatcher
            .emit(self.transport.as_ref(), text, destination)
            .await
        {
            error!("Failed to send to {}: {}", destination.chat_id, e);
        }
    }
}
