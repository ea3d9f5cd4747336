//! Inbound chat events, decoupled from teloxide types.

use regex::RegexBuilder;

/// A user-supplied file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttachment {
    /// Platform file ID used to fetch the bytes.
    pub file_id: String,
    pub file_name: String,
    /// Declared MIME type, if the platform gave one.
    pub mime_type: Option<String>,
}

/// An inbound message with the metadata the relay cares about.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub message_id: i64,
    /// Chat ID (negative = group, positive = DM).
    pub chat_id: i64,
    pub user_id: i64,
    /// Name shown to the model, e.g. "Alice".
    pub display_name: String,
    /// Message text or media caption.
    pub text: String,
    pub attachments: Vec<RawAttachment>,
    /// The text @-mentions the bot.
    pub mentions_bot: bool,
    /// The message replies to one of the bot's messages.
    pub replies_to_bot: bool,
    pub is_private: bool,
    pub from_bot_itself: bool,
}

impl ChatMessage {
    /// Whether the relay should answer this message at all.
    ///
    /// Mentions, replies to the bot, and DMs trigger; the bot's own
    /// messages never do.
    pub fn is_triggered(&self) -> bool {
        if self.from_bot_itself {
            return false;
        }
        self.mentions_bot || self.replies_to_bot || self.is_private
    }

    /// Text with the bot mention removed and whitespace trimmed.
    pub fn clean_content(&self, bot_username: Option<&str>) -> String {
        let mut content = self.text.clone();
        if let Some(username) = bot_username {
            let mention = format!("@{}", username.trim_start_matches('@'));
            content = replace_case_insensitive(&content, &mention);
        }
        content.trim().to_string()
    }

    /// Text stored in history for a user turn.
    pub fn attributed(&self, content: &str) -> String {
        format!("{}: {}", self.display_name, content)
    }
}

/// Whether `text` @-mentions `username` (case-insensitive).
pub fn mentions(text: &str, username: &str) -> bool {
    let needle = format!("@{}", username.trim_start_matches('@').to_lowercase());
    let lower = text.to_lowercase();
    lower.match_indices(&needle).any(|(idx, _)| {
        // "@relay_bot" must not match inside "@relay_bot2".
        !lower[idx + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
    })
}

fn replace_case_insensitive(haystack: &str, needle: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    match RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re.replace_all(haystack, "").into_owned(),
        Err(_) => haystack.replace(needle, ""),
    }
}
