use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::chatbot::dispatch::{ChatTransport, split_chunks};

/// Log lines per Telegram message, under the 4096 limit.
const LOG_CHUNK_SIZE: usize = 4000;

/// Log message with priority.
enum LogMessage {
    /// High priority (WARN/ERROR) - send immediately
    Urgent(String),
    /// Low priority (INFO) - batch and send periodically
    Info(String),
}

/// Mirrors INFO and above into a chat.
pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn ChatTransport>, chat_id: i64) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        tokio::spawn(async move {
            let mut info_buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(Duration::from_secs(5));

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(LogMessage::Urgent(text)) => {
                                send_log(transport.as_ref(), chat_id, &text).await;
                            }
                            Some(LogMessage::Info(text)) => {
                                info_buffer.push(text);
                                // If buffer gets too large, flush early
                                if info_buffer.len() >= 50 {
                                    flush_buffer(transport.as_ref(), chat_id, &mut info_buffer)
                                        .await;
                                }
                            }
                            None => {
                                flush_buffer(transport.as_ref(), chat_id, &mut info_buffer).await;
                                break;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        flush_buffer(transport.as_ref(), chat_id, &mut info_buffer).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

async fn send_log(transport: &dyn ChatTransport, chat_id: i64, text: &str) {
    for chunk in split_chunks(text, LOG_CHUNK_SIZE) {
        if let Err(e) = transport.send(chat_id, &chunk).await {
            // Not through tracing: that would feed back into this layer.
            eprintln!("Failed to send log to Telegram: {e}");
            return;
        }
    }
}

async fn flush_buffer(transport: &dyn ChatTransport, chat_id: i64, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(transport, chat_id, &combined).await;
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message
                .push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();

        // Only send INFO, WARN, ERROR to Telegram
        if level > Level::INFO {
            return;
        }
        // Outbound HTTP noise from our own sends would loop.
        if event.metadata().target().starts_with("reqwest")
            || event.metadata().target().starts_with("hyper")
        {
            return;
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let msg = match level {
            Level::ERROR => LogMessage::Urgent(format!("❌ {}", visitor.message)),
            Level::WARN => LogMessage::Urgent(format!("⚠️ {}", visitor.message)),
            _ => LogMessage::Info(visitor.message),
        };

        if self.tx.send(msg).is_err() {
            eprintln!("Log channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tracing_subscriber::prelude::*;

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatTransport for Sink {
        async fn send(&self, chat_id: i64, text: &str) -> Result<i64, String> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(1)
        }
        async fn reply(&self, chat_id: i64, _reply_to: i64, text: &str) -> Result<i64, String> {
            self.send(chat_id, text).await
        }
        async fn typing(&self, _chat_id: i64) {}
        async fn send_voice(&self, _chat_id: i64, _ogg: Vec<u8>) -> Result<i64, String> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_warn_is_sent_and_debug_is_not() {
        let sink = Arc::new(Sink::default());
        let layer = TelegramLogLayer::new(sink.clone(), -5);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("too chatty");
            tracing::warn!("disk almost full");
        });

        for _ in 0..100 {
            if !sink.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = sink.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(-5, "⚠️ disk almost full".to_string())]);
    }

    #[tokio::test]
    async fn test_long_logs_are_chunked() {
        let sink = Sink::default();
        send_log(&sink, 1, &"x".repeat(9000)).await;
        let sizes: Vec<_> = sink
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.chars().count())
            .collect();
        assert_eq!(sizes, vec![4000, 4000, 1000]);
    }
}
