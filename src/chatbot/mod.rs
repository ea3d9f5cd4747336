//! Chatbot module - relays Telegram chat turns to Gemini.

pub mod attachments;
pub mod commands;
pub mod conversation;
pub mod dispatch;
pub mod engine;
pub mod gateway;
pub mod gemini;
pub mod language;
pub mod live;
pub mod message;
pub mod prompt;
pub mod roster;
pub mod telegram;
pub mod voice;


pub use commands::Command;
pub use engine::{ChatbotConfig, ChatbotEngine, EngineParts};
pub use message::{ChatMessage, RawAttachment};
pub use telegram::TelegramClient;
