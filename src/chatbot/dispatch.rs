//! Outbound replies: split to the transport's size limit and send in order.

use async_trait::async_trait;
use tracing::debug;

/// Default chunk size, with margin under a 2000-char message ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 1900;

/// Outbound side of the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Plain send to a chat. Returns the new message ID.
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64, String>;

    /// Send as a reply to an existing message.
    async fn reply(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<i64, String>;

    /// Show a typing indicator. Best effort.
    async fn typing(&self, chat_id: i64);

    /// Post an OGG/Opus voice note.
    async fn send_voice(&self, chat_id: i64, ogg: Vec<u8>) -> Result<i64, String>;
}

/// Where the reply goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: i64,
    /// If set, the first chunk replies to this message.
    pub reply_to: Option<i64>,
}

impl Destination {
    pub fn channel(chat_id: i64) -> Self {
        Self {
            chat_id,
            reply_to: None,
        }
    }

    pub fn reply(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            reply_to: Some(message_id),
        }
    }
}

/// Split text into chunks of at most `limit` characters.
///
/// Counts characters, not bytes, and never splits inside a codepoint.
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Sends replies through a transport.
pub struct ResponseDispatcher {
    chunk_size: usize,
}

impl ResponseDispatcher {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Emit `text` in order. The first chunk uses the reply path when the
    /// destination asks for it; the rest are plain sends.
    ///
    /// A send error stops the sequence and is returned as-is.
    pub async fn emit(
        &self,
        transport: &dyn ChatTransport,
        text: &str,
        destination: Destination,
    ) -> Result<usize, String> {
        let chunks = split_chunks(text, self.chunk_size);
        debug!("Emitting {} chunk(s) to {}", chunks.len(), destination.chat_id);
        for (i, chunk) in chunks.iter().enumerate() {
            match (i, destination.reply_to) {
                (0, Some(reply_to)) => {
                    transport.reply(destination.chat_id, reply_to, chunk).await?;
                }
                _ => {
                    transport.send(destination.chat_id, chunk).await?;
                }
            }
        }
        Ok(chunks.len())
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        sent: Mutex<Vec<(String, String)>>,
        fail_after: Option<usize>,
    }

    impl Log {
        fn record(&self, kind: &str, text: &str) -> Result<i64, String> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_after.is_some_and(|n| sent.len() >= n) {
                return Err("Failed to send: network down".to_string());
            }
            sent.push((kind.to_string(), text.to_string()));
            Ok(sent.len() as i64)
        }
    }

    #[async_trait]
    impl ChatTransport for Log {
        async fn send(&self, _chat_id: i64, text: &str) -> Result<i64, String> {
            self.record("send", text)
        }
        async fn reply(&self, _chat_id: i64, _reply_to: i64, text: &str) -> Result<i64, String> {
            self.record("reply", text)
        }
        async fn typing(&self, _chat_id: i64) {}
        async fn send_voice(&self, _chat_id: i64, _ogg: Vec<u8>) -> Result<i64, String> {
            self.record("voice", "")
        }
    }

    #[test]
    fn test_split_4100_at_1900() {
        let text = "a".repeat(4100);
        let sizes: Vec<_> = split_chunks(&text, 1900).iter().map(|c| c.chars().count()).collect();
        assert_eq!(sizes, vec![1900, 1900, 300]);
    }

    #[test]
    fn test_split_counts_chars_not_bytes() {
        let text = "ж".repeat(5);
        let chunks = split_chunks(&text, 2);
        assert_eq!(chunks, vec!["жж", "жж", "ж"]);
    }

    #[test]
    fn test_split_edges() {
        assert!(split_chunks("", 10).is_empty());
        assert_eq!(split_chunks("abc", 3), vec!["abc"]);
        assert_eq!(split_chunks("abcd", 3), vec!["abc", "d"]);
    }

    #[test]
    fn test_split_preserves_content() {
        let text: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        assert_eq!(split_chunks(&text, 1900).concat(), text);
    }

    #[tokio::test]
    async fn test_emit_reply_then_sends_in_order() {
        let log = Log::default();
        let text = format!("{}{}{}", "a".repeat(1900), "b".repeat(1900), "c".repeat(300));
        let n = ResponseDispatcher::new(1900)
            .emit(&log, &text, Destination::reply(1, 99))
            .await
            .unwrap();
        assert_eq!(n, 3);

        let sent = log.sent.lock().unwrap();
        assert_eq!(sent[0].0, "reply");
        assert!(sent[0].1.starts_with('a'));
        assert_eq!(sent[1], ("send".to_string(), "b".repeat(1900)));
        assert_eq!(sent[2], ("send".to_string(), "c".repeat(300)));
    }

    #[tokio::test]
    async fn test_emit_channel_uses_plain_sends() {
        let log = Log::default();
        ResponseDispatcher::new(2)
            .emit(&log, "abcde", Destination::channel(1))
            .await
            .unwrap();
        let kinds: Vec<_> = log.sent.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(kinds, vec!["send", "send", "send"]);
    }

    #[tokio::test]
    async fn test_emit_empty_sends_nothing() {
        let log = Log::default();
        let n = ResponseDispatcher::default()
            .emit(&log, "", Destination::channel(1))
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(log.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emit_stops_on_send_error() {
        let log = Log {
            fail_after: Some(1),
            ..Default::default()
        };
        let err = ResponseDispatcher::new(1)
            .emit(&log, "xyz", Destination::channel(1))
            .await
            .unwrap_err();
        assert!(err.contains("network down"));
        assert_eq!(log.sent.lock().unwrap().len(), 1);
    }
}
