use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::ChatId;

use crate::chatbot::attachments::{MediaTransport, StagerConfig};
use crate::chatbot::conversation::MAX_HISTORY_MESSAGES;
use crate::chatbot::dispatch::DEFAULT_CHUNK_SIZE;
use crate::chatbot::gateway::GatewaySettings;

/// Config file used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "gemrelay.json";

pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
pub const GEMINI_KEY_ENV: &str = "GEMINI_API_KEY";

/// Telegram's hard limit on message length.
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// One year.
const MAX_ONLINE_WINDOW_MINUTES: i64 = 60 * 24 * 366;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// A required secret is in neither the environment nor the file.
    MissingSecret(&'static str),
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::MissingSecret(name) => write!(f, "missing secret: set {}", name),
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::MissingSecret(_) | Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    telegram_bot_token: Option<String>,
    gemini_api_key: Option<String>,
    text_model: Option<String>,
    vision_model: Option<String>,
    /// Model behind /joinvoice sessions.
    live_model: Option<String>,
    max_history: Option<usize>,
    chunk_size: Option<usize>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    search_grounding: Option<bool>,
    #[serde(default)]
    media_transport: MediaTransport,
    poll_interval_ms: Option<u64>,
    max_poll_attempts: Option<u32>,
    online_window_minutes: Option<i64>,
    /// Replaces the default persona in the system prompt.
    persona: Option<String>,
    /// Directory for logs. Defaults to current directory.
    data_dir: Option<String>,
    log_chat_id: Option<i64>,
}

pub struct Config {
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
    pub text_model: String,
    pub vision_model: String,
    pub live_model: String,
    pub max_history: usize,
    pub chunk_size: usize,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub search_grounding: bool,
    pub media_transport: MediaTransport,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub online_window: chrono::Duration,
    pub persona: Option<String>,
    pub data_dir: PathBuf,
    pub log_chat_id: Option<ChatId>,
}

impl Config {
    /// Load from `path` (or the default file) with secrets from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Load with an explicit environment lookup.
    ///
    /// An explicit path must exist; the default path may be absent, in which
    /// case every setting takes its default.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    read_file(default)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Self::from_file(file, env)
    }

    fn from_file(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let telegram_bot_token = secret(&env, TELEGRAM_TOKEN_ENV, file.telegram_bot_token)?;
        let gemini_api_key = secret(&env, GEMINI_KEY_ENV, file.gemini_api_key)?;

        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_bot_token.split(':').collect();
        if token_parts.len() != 2
            || token_parts[0].parse::<u64>().is_err()
            || token_parts[1].is_empty()
        {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let defaults = GatewaySettings::default();

        let max_history = file.max_history.unwrap_or(MAX_HISTORY_MESSAGES);
        if max_history == 0 {
            return Err(ConfigError::Validation("max_history must be at least 1".into()));
        }

        let chunk_size = file.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if !(1..=TELEGRAM_MESSAGE_LIMIT).contains(&chunk_size) {
            return Err(ConfigError::Validation(format!(
                "chunk_size must be between 1 and {TELEGRAM_MESSAGE_LIMIT}, got {chunk_size}"
            )));
        }

        let temperature = file.temperature.unwrap_or(defaults.temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Validation(format!(
                "temperature must be between 0.0 and 2.0, got {temperature}"
            )));
        }

        let max_poll_attempts = file.max_poll_attempts.unwrap_or(300);
        if max_poll_attempts == 0 {
            return Err(ConfigError::Validation("max_poll_attempts must be at least 1".into()));
        }

        let online_window_minutes = file.online_window_minutes.unwrap_or(10);
        if !(1..=MAX_ONLINE_WINDOW_MINUTES).contains(&online_window_minutes) {
            return Err(ConfigError::Validation(format!(
                "online_window_minutes must be between 1 and {MAX_ONLINE_WINDOW_MINUTES}, \
                 got {online_window_minutes}"
            )));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token,
            gemini_api_key,
            text_model: file.text_model.unwrap_or(defaults.text_model),
            vision_model: file.vision_model.unwrap_or(defaults.vision_model),
            live_model: file
                .live_model
                .unwrap_or_else(|| "gemini-2.0-flash-exp".to_string()),
            max_history,
            chunk_size,
            temperature,
            max_output_tokens: file.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            search_grounding: file.search_grounding.unwrap_or(defaults.search_grounding),
            media_transport: file.media_transport,
            poll_interval: Duration::from_millis(file.poll_interval_ms.unwrap_or(1000)),
            max_poll_attempts,
            online_window: chrono::Duration::minutes(online_window_minutes),
            persona: file.persona.filter(|p| !p.trim().is_empty()),
            data_dir,
            log_chat_id: file.log_chat_id.map(ChatId),
        })
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            text_model: self.text_model.clone(),
            vision_model: self.vision_model.clone(),
            search_grounding: self.search_grounding,
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        }
    }

    pub fn stager_config(&self) -> StagerConfig {
        StagerConfig {
            transport: self.media_transport,
            poll_interval: self.poll_interval,
            max_poll_attempts: self.max_poll_attempts,
        }
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::ParseJson {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Environment wins over the file; blank values count as missing.
fn secret(
    env: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    from_file: Option<String>,
) -> Result<String, ConfigError> {
    env(name)
        .or(from_file)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingSecret(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TOKEN: &str = "123456789:ABCdefGHIjklMNOpqrsTUVwxyz";

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn full_env() -> impl Fn(&str) -> Option<String> {
        env(&[(TELEGRAM_TOKEN_ENV, TOKEN), (GEMINI_KEY_ENV, "gemini-key")])
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_defaults_from_env_only() {
        let file = write_config("{}");
        let config = Config::load_with(Some(file.path()), full_env()).expect("should load");
        assert_eq!(config.telegram_bot_token, TOKEN);
        assert_eq!(config.gemini_api_key, "gemini-key");
        assert_eq!(config.max_history, 20);
        assert_eq!(config.chunk_size, 1900);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_output_tokens, 1500);
        assert!(config.search_grounding);
        assert_eq!(config.media_transport, MediaTransport::Upload);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.max_poll_attempts, 300);
        assert_eq!(config.online_window, chrono::Duration::minutes(10));
        assert_eq!(config.data_dir, PathBuf::from("."));
        assert!(config.persona.is_none());
        assert!(config.log_chat_id.is_none());
    }

    #[test]
    fn test_file_values() {
        let file = write_config(r#"{
            "telegram_bot_token": "42:secret",
            "gemini_api_key": "file-key",
            "text_model": "gemini-1.5-pro",
            "max_history": 8,
            "chunk_size": 4000,
            "search_grounding": false,
            "media_transport": "inline",
            "poll_interval_ms": 250,
            "persona": "You are terse.",
            "data_dir": "/var/lib/gemrelay",
            "log_chat_id": -100500
        }"#);
        let config = Config::load_with(Some(file.path()), env(&[])).expect("should load");
        assert_eq!(config.telegram_bot_token, "42:secret");
        assert_eq!(config.gemini_api_key, "file-key");
        assert_eq!(config.text_model, "gemini-1.5-pro");
        assert_eq!(config.max_history, 8);
        assert_eq!(config.chunk_size, 4000);
        assert_eq!(config.media_transport, MediaTransport::Inline);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.persona.as_deref(), Some("You are terse."));
        assert_eq!(config.log_chat_id, Some(ChatId(-100500)));

        let settings = config.gateway_settings();
        assert!(!settings.search_grounding);
        assert_eq!(config.stager_config().transport, MediaTransport::Inline);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config(r#"{ "telegram_bot_token": "1:file", "gemini_api_key": "file" }"#);
        let config = Config::load_with(Some(file.path()), full_env()).unwrap();
        assert_eq!(config.telegram_bot_token, TOKEN);
        assert_eq!(config.gemini_api_key, "gemini-key");
    }

    #[test]
    fn test_missing_telegram_token() {
        let file = write_config("{}");
        let err = assert_err(Config::load_with(Some(file.path()), env(&[(GEMINI_KEY_ENV, "k")])));
        assert!(matches!(err, ConfigError::MissingSecret(TELEGRAM_TOKEN_ENV)));
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn test_missing_gemini_key() {
        let file = write_config("{}");
        let err = assert_err(Config::load_with(
            Some(file.path()),
            env(&[(TELEGRAM_TOKEN_ENV, TOKEN)]),
        ));
        assert!(matches!(err, ConfigError::MissingSecret(GEMINI_KEY_ENV)));
    }

    #[test]
    fn test_blank_secret_is_missing() {
        let file = write_config("{}");
        let err = assert_err(Config::load_with(
            Some(file.path()),
            env(&[(TELEGRAM_TOKEN_ENV, TOKEN), (GEMINI_KEY_ENV, "   ")]),
        ));
        assert!(matches!(err, ConfigError::MissingSecret(_)));
    }

    #[test]
    fn test_invalid_token_formats() {
        for token in ["invalid_token_no_colon", "notanumber:ABCdef", "123456789:", "1:2:3"] {
            let file = write_config("{}");
            let err = assert_err(Config::load_with(
                Some(file.path()),
                env(&[(TELEGRAM_TOKEN_ENV, token), (GEMINI_KEY_ENV, "k")]),
            ));
            assert!(matches!(err, ConfigError::Validation(_)), "{token}");
            assert!(err.to_string().contains("invalid"));
        }
    }

    #[test]
    fn test_chunk_size_bounds() {
        for bad in ["0", "4097"] {
            let file = write_config(&format!(r#"{{ "chunk_size": {bad} }}"#));
            let err = assert_err(Config::load_with(Some(file.path()), full_env()));
            assert!(err.to_string().contains("chunk_size"), "{bad}");
        }
    }

    #[test]
    fn test_other_validation() {
        for body in [
            r#"{ "max_history": 0 }"#,
            r#"{ "temperature": 3.5 }"#,
            r#"{ "max_poll_attempts": 0 }"#,
            r#"{ "online_window_minutes": 0 }"#,
        ] {
            let file = write_config(body);
            let err = assert_err(Config::load_with(Some(file.path()), full_env()));
            assert!(matches!(err, ConfigError::Validation(_)), "{body}");
        }
    }

    #[test]
    fn test_online_window_upper_bound() {
        for bad in ["1000000000000", "9223372036854775807", "-5"] {
            let file = write_config(&format!(r#"{{ "online_window_minutes": {bad} }}"#));
            let err = assert_err(Config::load_with(Some(file.path()), full_env()));
            assert!(err.to_string().contains("online_window_minutes"), "{bad}");
        }

        let file = write_config(r#"{ "online_window_minutes": 527040 }"#);
        let config = Config::load_with(Some(file.path()), full_env()).unwrap();
        assert_eq!(config.online_window, chrono::Duration::days(366));
    }

    #[test]
    fn test_unknown_media_transport() {
        let file = write_config(r#"{ "media_transport": "carrier-pigeon" }"#);
        let err = assert_err(Config::load_with(Some(file.path()), full_env()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load_with(
            Some(Path::new("/nonexistent/path/config.json")),
            full_env(),
        ));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load_with(Some(file.path()), full_env()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}
