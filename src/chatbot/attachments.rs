//! Attachment staging: fetch user media and make it referenceable by the model.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::chatbot::conversation::{MediaHandle, MediaRef};
use crate::chatbot::gemini::{FileState, RemoteFile};
use crate::chatbot::message::RawAttachment;

/// MIME types the model accepts as attachments.
pub const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
    "video/mp4",
    "video/mpeg",
    "video/mov",
    "video/avi",
    "video/x-flv",
    "video/mpg",
    "video/webm",
    "video/wmv",
    "video/3gpp",
    "audio/wav",
    "audio/mp3",
    "audio/aiff",
    "audio/aac",
    "audio/ogg",
    "audio/flac",
    "application/pdf",
];

pub fn is_supported_mime(mime: &str) -> bool {
    SUPPORTED_MIME_TYPES.contains(&mime)
}

/// Why a single attachment was skipped.
#[derive(Debug)]
pub enum AttachmentError {
    /// No MIME type, or one outside the allow-list.
    Unsupported(Option<String>),
    /// Download or upload failed.
    Transfer(String),
    /// The backend finished processing in a non-ready state.
    Processing { name: String, state: FileState },
    /// The file was still processing after the poll budget ran out.
    Timeout { name: String, polls: u32 },
}

impl fmt::Display for AttachmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(Some(mime)) => write!(f, "unsupported type {mime}"),
            Self::Unsupported(None) => write!(f, "missing content type"),
            Self::Transfer(e) => write!(f, "transfer failed: {e}"),
            Self::Processing { name, state } => {
                write!(f, "processing of {name} ended in state {state:?}")
            }
            Self::Timeout { name, polls } => {
                write!(f, "{name} still processing after {polls} polls")
            }
        }
    }
}

impl std::error::Error for AttachmentError {}

/// Source of raw attachment bytes (the chat platform).
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>, String>;
}

/// Backend-side file storage with asynchronous processing.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(
        &self,
        display_name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<RemoteFile, String>;

    async fn get(&self, name: &str) -> Result<RemoteFile, String>;
}

/// How staged bytes travel to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaTransport {
    /// Files API upload, referenced by URI.
    #[default]
    Upload,
    /// Base64 bytes inside the request.
    Inline,
}

#[derive(Debug, Clone)]
pub struct StagerConfig {
    pub transport: MediaTransport,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            transport: MediaTransport::Upload,
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 300,
        }
    }
}

/// Turns raw attachments into `MediaRef`s.
pub struct AttachmentStager {
    fetcher: Arc<dyn FileFetcher>,
    store: Arc<dyn FileStore>,
    config: StagerConfig,
}

impl AttachmentStager {
    pub fn new(
        fetcher: Arc<dyn FileFetcher>,
        store: Arc<dyn FileStore>,
        config: StagerConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            config,
        }
    }

    /// Stage every attachment, skipping the ones that fail.
    ///
    /// Never fails as a whole. Survivors keep their input order.
    pub async fn stage(&self, attachments: &[RawAttachment]) -> Vec<MediaRef> {
        let mut staged = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            match self.stage_one(attachment).await {
                Ok(media) => staged.push(media),
                Err(AttachmentError::Unsupported(mime)) => {
                    debug!("Skipping {} (unsupported type {:?})", attachment.file_name, mime);
                }
                Err(e) => warn!("Error staging attachment {}: {}", attachment.file_name, e),
            }
        }
        if !attachments.is_empty() {
            info!("📎 Staged {}/{} attachment(s)", staged.len(), attachments.len());
        }
        staged
    }

    async fn stage_one(&self, attachment: &RawAttachment) -> Result<MediaRef, AttachmentError> {
        let mime = match attachment.mime_type.as_deref() {
            Some(m) if is_supported_mime(m) => m.to_string(),
            other => return Err(AttachmentError::Unsupported(other.map(str::to_string))),
        };

        let data = self
            .fetcher
            .fetch(&attachment.file_id)
            .await
            .map_err(AttachmentError::Transfer)?;

        match self.config.transport {
            MediaTransport::Inline => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                Ok(MediaRef {
                    handle: MediaHandle::Inline(encoded),
                    mime_type: mime,
                })
            }
            MediaTransport::Upload => {
                let uploaded = self
                    .store
                    .upload(&attachment.file_name, &mime, data)
                    .await
                    .map_err(AttachmentError::Transfer)?;
                let ready = self.wait_until_active(uploaded).await?;
                let mime_type = if ready.mime_type.is_empty() {
                    mime
                } else {
                    ready.mime_type
                };
                Ok(MediaRef {
                    handle: MediaHandle::Uri(ready.uri),
                    mime_type,
                })
            }
        }
    }

    /// Poll a file until it leaves the PROCESSING state.
    async fn wait_until_active(&self, mut file: RemoteFile) -> Result<RemoteFile, AttachmentError> {
        let mut polls = 0;
        while file.state == FileState::Processing {
            if polls >= self.config.max_poll_attempts {
                return Err(AttachmentError::Timeout {
                    name: file.name,
                    polls,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
            polls += 1;
            file = self
                .store
                .get(&file.name)
                .await
                .map_err(AttachmentError::Transfer)?;
            debug!("{} is {:?} after {} poll(s)", file.name, file.state, polls);
        }

        if file.state == FileState::Active {
            Ok(file)
        } else {
            Err(AttachmentError::Processing {
                name: file.name,
                state: file.state,
            })
        }
    }
}
