//! Slash commands.

use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Commands:")]
pub enum Command {
    #[command(description = "forget this chat's conversation")]
    Reset,
    #[command(description = "ask a question, optionally with an attachment")]
    Ask(String),
    #[command(description = "answer out loud in this chat")]
    JoinVoice,
    #[command(description = "stop answering out loud")]
    LeaveVoice,
    #[command(description = "show this list")]
    Help,
}

impl Command {
    /// Parse a message text or caption. Unknown commands and plain text are `None`.
    pub fn from_text(text: &str, bot_username: &str) -> Option<Self> {
        if !text.starts_with('/') {
            return None;
        }
        Self::parse(text, bot_username).ok()
    }
}
