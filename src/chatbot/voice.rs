//! Voice sessions: one live audio session per chat, played back as voice notes.
//!
//! Audio from the model is buffered until its turn completes, encoded to
//! OGG/Opus and posted to the chat that joined. Playback is latest-wins: a
//! new unit aborts whatever is still rendering.

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chatbot::dispatch::ChatTransport;
use crate::chatbot::gateway::RemoteError;
use crate::chatbot::live::{LiveConnector, LiveEvent};

/// Live API output format.
const PCM_SAMPLE_RATE: u32 = 24_000;

/// Where decoded audio ends up.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, chat_id: i64, pcm: Vec<u8>) -> Result<(), String>;
}

/// Posts audio to the chat as a voice note.
pub struct VoiceNoteOutput {
    transport: Arc<dyn ChatTransport>,
}

impl VoiceNoteOutput {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl AudioOutput for VoiceNoteOutput {
    async fn play(&self, chat_id: i64, pcm: Vec<u8>) -> Result<(), String> {
        let ogg = tokio::task::spawn_blocking(move || encode_pcm_to_ogg(&pcm))
            .await
            .map_err(|e| format!("Encoder task failed: {e}"))??;
        self.transport.send_voice(chat_id, ogg).await?;
        Ok(())
    }
}

static ENCODE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Raw s16le mono PCM to OGG Opus, via ffmpeg.
fn encode_pcm_to_ogg(pcm: &[u8]) -> Result<Vec<u8>, String> {
    let seq = ENCODE_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_dir = std::env::temp_dir();
    let input_path = temp_dir.join(format!("live_{}_{}.pcm", std::process::id(), seq));
    let output_path = temp_dir.join(format!("live_{}_{}.ogg", std::process::id(), seq));

    std::fs::write(&input_path, pcm).map_err(|e| format!("Failed to write temp PCM: {e}"))?;

    let rate = PCM_SAMPLE_RATE.to_string();
    let output = Command::new("ffmpeg")
        .args(["-y", "-f", "s16le", "-ar", &rate, "-ac", "1", "-i"])
        .arg(&input_path)
        .args(["-c:a", "libopus", "-b:a", "64k"])
        .arg(&output_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .map_err(|e| format!("Failed to run ffmpeg: {e}"));

    let _ = std::fs::remove_file(&input_path);
    let output = output?;

    if !output.status.success() {
        let _ = std::fs::remove_file(&output_path);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ffmpeg conversion failed: {}", stderr));
    }

    let ogg = std::fs::read(&output_path).map_err(|e| format!("Failed to read OGG output: {e}"))?;
    let _ = std::fs::remove_file(&output_path);

    debug!("Encoded PCM ({} bytes) to OGG ({} bytes)", pcm.len(), ogg.len());
    Ok(ogg)
}

/// Latest-wins playback for one chat.
pub struct Player {
    chat_id: i64,
    output: Arc<dyn AudioOutput>,
    current: Option<JoinHandle<()>>,
}

impl Player {
    pub fn new(chat_id: i64, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            chat_id,
            output,
            current: None,
        }
    }

    /// Start playing `pcm`, cutting off anything still in flight.
    pub async fn play(&mut self, pcm: Vec<u8>) {
        self.stop().await;
        let output = self.output.clone();
        let chat_id = self.chat_id;
        self.current = Some(tokio::spawn(async move {
            if let Err(e) = output.play(chat_id, pcm).await {
                warn!("Voice playback failed in chat {}: {}", chat_id, e);
            }
        }));
    }

    /// Abort the current unit and wait for it to wind down.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.current.take() {
            if !handle.is_finished() {
                debug!("Interrupting playback in chat {}", self.chat_id);
                handle.abort();
            }
            let _ = handle.await;
        }
    }

    /// Let the current unit play out.
    pub async fn finish(&mut self) {
        if let Some(handle) = self.current.take() {
            let _ = handle.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyActive,
}

struct VoiceSession {
    id: u64,
    input: mpsc::UnboundedSender<String>,
}

/// Registry of live sessions, at most one per chat.
pub struct VoiceSessions {
    connector: Arc<dyn LiveConnector>,
    output: Arc<dyn AudioOutput>,
    sessions: Mutex<HashMap<i64, VoiceSession>>,
    next_id: AtomicU64,
}

impl VoiceSessions {
    pub fn new(connector: Arc<dyn LiveConnector>, output: Arc<dyn AudioOutput>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            output,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn is_active(&self, chat_id: i64) -> bool {
        self.lock().contains_key(&chat_id)
    }

    /// Open a session for `chat_id` unless one already exists.
    pub async fn join(
        self: &Arc<Self>,
        chat_id: i64,
        system_instruction: &str,
    ) -> Result<JoinOutcome, RemoteError> {
        if self.is_active(chat_id) {
            return Ok(JoinOutcome::AlreadyActive);
        }

        let link = self.connector.connect(system_instruction).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.lock();
            if sessions.contains_key(&chat_id) {
                // Lost a race with a concurrent join; dropping the link closes it.
                return Ok(JoinOutcome::AlreadyActive);
            }
            sessions.insert(chat_id, VoiceSession { id, input: link.input });
        }

        tokio::spawn(run_receiver(
            Arc::downgrade(self),
            chat_id,
            id,
            link.events,
            self.output.clone(),
        ));
        info!("🎙️ Voice session {} joined in chat {}", id, chat_id);
        Ok(JoinOutcome::Joined)
    }

    /// Close the chat's session. Returns false if there was none.
    pub fn leave(&self, chat_id: i64) -> bool {
        // Dropping the sender makes the connection close itself.
        let removed = self.lock().remove(&chat_id);
        if let Some(session) = &removed {
            info!("🔇 Leaving voice session {} in chat {}", session.id, chat_id);
        }
        removed.is_some()
    }

    /// Hand a user text turn to the chat's session. Fire-and-forget: the
    /// reply arrives later as audio.
    pub fn send_text(&self, chat_id: i64, text: &str) -> Result<(), RemoteError> {
        let mut sessions = self.lock();
        let Some(session) = sessions.get(&chat_id) else {
            return Err(RemoteError::SessionClosed);
        };
        if session.input.send(text.to_string()).is_err() {
            sessions.remove(&chat_id);
            return Err(RemoteError::SessionClosed);
        }
        Ok(())
    }

    fn remove_if(&self, chat_id: i64, id: u64) {
        let mut sessions = self.lock();
        if sessions.get(&chat_id).is_some_and(|s| s.id == id) {
            sessions.remove(&chat_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, VoiceSession>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn run_receiver(
    registry: Weak<VoiceSessions>,
    chat_id: i64,
    id: u64,
    mut events: mpsc::UnboundedReceiver<LiveEvent>,
    output: Arc<dyn AudioOutput>,
) {
    let mut player = Player::new(chat_id, output);
    let mut pending: Vec<u8> = Vec::new();
    let mut closed_locally = false;

    while let Some(event) = events.recv().await {
        match event {
            LiveEvent::Audio(pcm) => pending.extend_from_slice(&pcm),
            LiveEvent::Interrupted => {
                pending.clear();
                player.stop().await;
            }
            LiveEvent::TurnComplete => {
                if !pending.is_empty() {
                    player.play(std::mem::take(&mut pending)).await;
                }
            }
            LiveEvent::Closed(reason) => {
                closed_locally = reason.is_none();
                break;
            }
        }
    }

    if closed_locally {
        player.stop().await;
    } else {
        player.finish().await;
    }
    if let Some(registry) = registry.upgrade() {
        registry.remove_if(chat_id, id);
    }
    info!("Voice session {} in chat {} ended", id, chat_id);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chatbot::live::LiveLink;
    use std::time::Duration;

    /// Test-side ends of a connected link.
    pub struct LinkEnds {
        pub input: mpsc::UnboundedReceiver<String>,
        pub events: mpsc::UnboundedSender<LiveEvent>,
    }

    #[derive(Default)]
    pub struct MockConnector {
        pub links: Mutex<Vec<LinkEnds>>,
        pub instructions: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl MockConnector {
        pub fn take_link(&self) -> LinkEnds {
            self.links.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl LiveConnector for MockConnector {
        async fn connect(&self, system_instruction: &str) -> Result<LiveLink, RemoteError> {
            if self.fail {
                return Err(RemoteError::Transport("connection refused".to_string()));
            }
            self.instructions.lock().unwrap().push(system_instruction.to_string());
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            self.links.lock().unwrap().push(LinkEnds {
                input: input_rx,
                events: events_tx,
            });
            Ok(LiveLink {
                input: input_tx,
                events: events_rx,
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingOutput {
        pub played: Mutex<Vec<(i64, Vec<u8>)>>,
        pub delay: Duration,
    }

    impl RecordingOutput {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        pub fn played(&self) -> Vec<(i64, Vec<u8>)> {
            self.played.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AudioOutput for RecordingOutput {
        async fn play(&self, chat_id: i64, pcm: Vec<u8>) -> Result<(), String> {
            tokio::time::sleep(self.delay).await;
            self.played.lock().unwrap().push((chat_id, pcm));
            Ok(())
        }
    }

    pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }
}
