//! Gemini REST client: content generation and the Files API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chatbot::attachments::FileStore;
use crate::chatbot::gateway::{ModelBackend, RemoteError};
use crate::chatbot::prompt::{Content, Payload};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";

/// Reply used when the model answers with grounding metadata but no text.
pub const EMPTY_REPLY_FALLBACK: &str =
    "[I found some info, but couldn't generate a text response. Try asking again.]";

/// A fully specified generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub payload: Payload,
    /// Enable the Google Search grounding tool.
    pub search: bool,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

pub struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(rename = "systemInstruction")]
    system_instruction: SystemInstruction<'a>,
    contents: &'a [Content],
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Serialize)]
pub(crate) struct SystemInstruction<'a> {
    pub(crate) parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
pub(crate) struct TextPart<'a> {
    pub(crate) text: &'a str,
}

impl<'a> SystemInstruction<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self {
            parts: vec![TextPart { text }],
        }
    }
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Serialize)]
struct GoogleSearch {}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

/// Processing state of an uploaded file.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    #[default]
    StateUnspecified,
    Processing,
    Active,
    Failed,
    #[serde(other)]
    Unknown,
}

/// File metadata as returned by the Files API.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Resource name, e.g. "files/abc123".
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    #[serde(default)]
    pub state: FileState,
}

#[derive(Deserialize)]
struct UploadResponse {
    file: RemoteFile,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { api_key, client }
    }

    async fn generate_content(&self, request: &GenerateRequest) -> Result<String, RemoteError> {
        info!(
            "🤖 Generating with {} ({} content block(s), search: {})",
            request.model,
            request.payload.contents.len(),
            request.search
        );

        let body = WireRequest {
            system_instruction: SystemInstruction::new(&request.payload.system),
            contents: &request.payload.contents,
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
            },
            tools: if request.search {
                vec![Tool {
                    google_search: GoogleSearch {},
                }]
            } else {
                vec![]
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            API_BASE, request.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("failed to read response: {e}")))?;

        debug!("Gemini response status: {status}");
        parse_generate_response(status.as_u16(), &text)
    }

    async fn upload_file(
        &self,
        display_name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<RemoteFile, String> {
        info!("📤 Uploading {} ({} bytes, {})", display_name, data.len(), mime_type);

        let start = self
            .client
            .post(format!("{}?key={}", UPLOAD_URL, self.api_key))
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(|e| format!("upload start failed: {e}"))?;

        if !start.status().is_success() {
            let status = start.status();
            let body = start.text().await.unwrap_or_default();
            return Err(format!("upload start error {status}: {body}"));
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or("upload start response has no upload URL")?
            .to_string();

        let response = self
            .client
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data)
            .send()
            .await
            .map_err(|e| format!("upload failed: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read upload response: {e}"))?;
        if !status.is_success() {
            return Err(format!("upload error {status}: {body}"));
        }

        let parsed: UploadResponse = serde_json::from_str(&body)
            .map_err(|e| format!("failed to parse upload response: {e}"))?;
        debug!("Uploaded as {} ({:?})", parsed.file.name, parsed.file.state);
        Ok(parsed.file)
    }

    async fn fetch_file(&self, name: &str) -> Result<RemoteFile, String> {
        let url = format!("{}/{}?key={}", API_BASE, name, self.api_key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("file lookup failed: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read file lookup: {e}"))?;
        if !status.is_success() {
            return Err(format!("file lookup error {status}: {body}"));
        }

        serde_json::from_str(&body).map_err(|e| format!("failed to parse file lookup: {e}"))
    }
}

#[async_trait]
impl ModelBackend for GeminiClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, RemoteError> {
        self.generate_content(request).await
    }
}

#[async_trait]
impl FileStore for GeminiClient {
    async fn upload(
        &self,
        display_name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<RemoteFile, String> {
        self.upload_file(display_name, mime_type, data).await
    }

    async fn get(&self, name: &str) -> Result<RemoteFile, String> {
        self.fetch_file(name).await
    }
}

/// Turn a generateContent HTTP response into reply text.
fn parse_generate_response(status: u16, body: &str) -> Result<String, RemoteError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<GenerateResponse>(body)
            .ok()
            .and_then(|r| r.error)
            .map(|e| e.message)
            .unwrap_or_else(|| body.to_string());
        return Err(RemoteError::Status { status, message });
    }

    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| RemoteError::Malformed(e.to_string()))?;

    if let Some(error) = parsed.error {
        return Err(RemoteError::Api(error.message));
    }

    let candidates = parsed
        .candidates
        .ok_or_else(|| RemoteError::Malformed("no candidates in response".to_string()))?;
    let candidate = candidates
        .first()
        .ok_or_else(|| RemoteError::Malformed("empty candidates array".to_string()))?;

    let text: String = candidate
        .content
        .as_ref()
        .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
        .unwrap_or_default();

    let text = text.trim();
    if text.is_empty() {
        Ok(EMPTY_REPLY_FALLBACK.to_string())
    } else {
        Ok(text.to_string())
    }
}
