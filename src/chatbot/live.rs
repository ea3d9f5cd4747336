//! Gemini Live: a duplex WebSocket session that answers text turns with audio.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::chatbot::gateway::RemoteError;
use crate::chatbot::gemini::SystemInstruction;
use crate::chatbot::prompt::{Content, Part};

const LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Something the session's receive direction produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// Raw PCM (s16le, 24 kHz, mono).
    Audio(Vec<u8>),
    /// The model finished its turn.
    TurnComplete,
    /// The model was cut off; audio buffered for this turn is stale.
    Interrupted,
    /// The stream ended. `None` means we closed it ourselves.
    Closed(Option<String>),
}

/// Both directions of an open session.
pub struct LiveLink {
    /// New user text turns.
    pub input: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

/// Opens duplex sessions.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, system_instruction: &str) -> Result<LiveLink, RemoteError>;
}

pub struct GeminiLive {
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
struct Setup<'a> {
    model: String,
    #[serde(rename = "generationConfig")]
    generation_config: LiveGenerationConfig,
    #[serde(rename = "systemInstruction")]
    system_instruction: SystemInstruction<'a>,
}

#[derive(Serialize)]
struct LiveGenerationConfig {
    #[serde(rename = "responseModalities")]
    response_modalities: Vec<&'static str>,
}

#[derive(Serialize)]
struct ClientContentMessage {
    #[serde(rename = "clientContent")]
    client_content: ClientContent,
}

#[derive(Serialize)]
struct ClientContent {
    turns: Vec<Content>,
    #[serde(rename = "turnComplete")]
    turn_complete: bool,
}

#[derive(Deserialize, Debug, Default)]
struct ServerMessage {
    #[serde(rename = "setupComplete")]
    setup_complete: Option<serde_json::Value>,
    #[serde(rename = "serverContent")]
    server_content: Option<ServerContent>,
}

#[derive(Deserialize, Debug, Default)]
struct ServerContent {
    #[serde(rename = "modelTurn")]
    model_turn: Option<ModelTurn>,
    #[serde(rename = "turnComplete", default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Deserialize, Debug)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<LivePart>,
}

#[derive(Deserialize, Debug)]
struct LivePart {
    #[serde(rename = "inlineData")]
    inline_data: Option<LiveInlineData>,
}

#[derive(Deserialize, Debug)]
struct LiveInlineData {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    data: String,
}

impl GeminiLive {
    pub fn new(api_key: String, model: String) -> Self {
        Self { api_key, model }
    }
}

#[async_trait]
impl LiveConnector for GeminiLive {
    async fn connect(&self, system_instruction: &str) -> Result<LiveLink, RemoteError> {
        let url = format!("{}?key={}", LIVE_URL, self.api_key);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RemoteError::Transport(format!("live connect: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let setup = SetupMessage {
            setup: Setup {
                model: format!("models/{}", self.model),
                generation_config: LiveGenerationConfig {
                    response_modalities: vec!["AUDIO"],
                },
                system_instruction: SystemInstruction::new(system_instruction),
            },
        };
        let json =
            serde_json::to_string(&setup).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| RemoteError::Transport(format!("send setup: {e}")))?;

        // Nothing is usable until the server acknowledges the setup.
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) if is_setup_complete(text.as_bytes()) => break,
                Some(Ok(Message::Binary(data))) if is_setup_complete(&data) => break,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(RemoteError::Api(format!("live setup rejected: {reason}")));
                }
                Some(Err(e)) => return Err(RemoteError::Transport(format!("live setup: {e}"))),
                None => return Err(RemoteError::SessionClosed),
                Some(Ok(_)) => {}
            }
        }
        info!("🎙️ Live session established ({})", self.model);

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LiveEvent>();

        tokio::spawn(async move {
            let closed_by = loop {
                tokio::select! {
                    msg = read.next() => {
                        let events = match msg {
                            Some(Ok(Message::Text(text))) => parse_server_message(text.as_bytes()),
                            Some(Ok(Message::Binary(data))) => parse_server_message(&data),
                            Some(Ok(Message::Close(frame))) => {
                                let reason = frame
                                    .map(|f| f.reason.to_string())
                                    .unwrap_or_default();
                                break Some(format!("closed by server: {reason}"));
                            }
                            Some(Err(e)) => break Some(format!("read error: {e}")),
                            None => break Some("stream ended".to_string()),
                            Some(Ok(_)) => continue,
                        };
                        if !forward_events(&event_tx, events) {
                            let _ = write.send(Message::Close(None)).await;
                            break None;
                        }
                    }
                    text = input_rx.recv() => {
                        let Some(text) = text else {
                            let _ = write.send(Message::Close(None)).await;
                            break None;
                        };
                        let json = client_content_json(&text);
                        if let Err(e) = write.send(Message::Text(json)).await {
                            break Some(format!("send error: {e}"));
                        }
                        debug!("Sent text turn to live session");
                    }
                }
            };
            if let Some(ref reason) = closed_by {
                warn!("Live session ended: {}", reason);
            }
            let _ = event_tx.send(LiveEvent::Closed(closed_by));
        });

        Ok(LiveLink {
            input: input_tx,
            events: event_rx,
        })
    }
}

/// False once the receiving side is gone.
fn forward_events(events_tx: &mpsc::UnboundedSender<LiveEvent>, events: Vec<LiveEvent>) -> bool {
    events.into_iter().all(|event| events_tx.send(event).is_ok())
}

fn client_content_json(text: &str) -> String {
    let message = ClientContentMessage {
        client_content: ClientContent {
            turns: vec![Content {
                role: "user".to_string(),
                parts: vec![Part::text(text)],
            }],
            turn_complete: true,
        },
    };
    serde_json::to_string(&message).unwrap_or_default()
}

fn is_setup_complete(raw: &[u8]) -> bool {
    serde_json::from_slice::<ServerMessage>(raw)
        .map(|m| m.setup_complete.is_some())
        .unwrap_or(false)
}

/// Decode one server frame into zero or more events.
fn parse_server_message(raw: &[u8]) -> Vec<LiveEvent> {
    let message: ServerMessage = match serde_json::from_slice(raw) {
        Ok(m) => m,
        Err(e) => {
            debug!("Ignoring unparseable live message: {e}");
            return vec![];
        }
    };

    let Some(content) = message.server_content else {
        return vec![];
    };

    let mut events = Vec::new();
    if content.interrupted {
        events.push(LiveEvent::Interrupted);
    }
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            let Some(inline) = part.inline_data else { continue };
            if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
                continue;
            }
            match base64::engine::general_purpose::STANDARD.decode(&inline.data) {
                Ok(pcm) => events.push(LiveEvent::Audio(pcm)),
                Err(e) => warn!("Bad audio chunk from live session: {e}"),
            }
        }
    }
    if content.turn_complete {
        events.push(LiveEvent::TurnComplete);
    }
    events
}
