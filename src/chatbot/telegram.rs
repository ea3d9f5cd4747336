//! Telegram client using teloxide.

use async_trait::async_trait;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, MessageId, ReplyParameters};
use tracing::{info, warn};

use crate::chatbot::attachments::FileFetcher;
use crate::chatbot::dispatch::ChatTransport;

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        // Model output is plain text; no parse mode so stray markup can't break delivery.
        let mut request = self.bot.send_message(ChatId(chat_id), text);

        if let Some(msg_id) = reply_to_message_id {
            let reply_params = ReplyParameters::new(MessageId(msg_id as i32));
            request = request.reply_parameters(reply_params);
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = format!("Failed to send: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Send a voice message from bytes (OGG Opus format).
    pub async fn send_voice_note(&self, chat_id: i64, voice_data: Vec<u8>) -> Result<i64, String> {
        info!("🔊 Sending voice to chat {} ({} bytes)", chat_id, voice_data.len());

        let input_file = InputFile::memory(voice_data).file_name("voice.ogg");
        self.bot
            .send_voice(ChatId(chat_id), input_file)
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| {
                let msg = format!("Failed to send voice: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Download a file by file_id.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        info!("📥 Downloaded {} ({} bytes)", file.path, data.len());
        Ok(data)
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        self.send_message(chat_id, text, None).await
    }

    async fn reply(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<i64, String> {
        self.send_message(chat_id, text, Some(reply_to)).await
    }

    async fn typing(&self, chat_id: i64) {
        if let Err(e) = self
            .bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
        {
            warn!("Failed to send typing indicator: {e}");
        }
    }

    async fn send_voice(&self, chat_id: i64, ogg: Vec<u8>) -> Result<i64, String> {
        self.send_voice_note(chat_id, ogg).await
    }
}

#[async_trait]
impl FileFetcher for TelegramClient {
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>, String> {
        self.download(file_id).await
    }
}
