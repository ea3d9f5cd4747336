//! Telegram relay for Google Gemini: text, vision, search and live voice.

pub mod chatbot;
pub mod config;
pub mod telegram_log;
