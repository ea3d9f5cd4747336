//! Model gateway: picks a backend for each turn and runs the request.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::chatbot::conversation::Turn;
use crate::chatbot::gemini::GenerateRequest;
use crate::chatbot::prompt::{Payload, PayloadShape};

/// Failure talking to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection, TLS, or timeout failure.
    Transport(String),
    /// Upstream answered with a non-success status.
    Status { status: u16, message: String },
    /// Upstream body could not be understood.
    Malformed(String),
    /// Upstream reported an error inside a success response.
    Api(String),
    /// The live session is gone.
    SessionClosed,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "HTTP error: {e}"),
            Self::Status { status, message } => write!(f, "API error {status}: {message}"),
            Self::Malformed(e) => write!(f, "Malformed response: {e}"),
            Self::Api(e) => write!(f, "Gemini error: {e}"),
            Self::SessionClosed => write!(f, "voice session closed"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// A single-shot request/response model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, RemoteError>;
}

/// Single-shot backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Plain chat completion with optional search grounding.
    Text,
    /// Image-aware completion.
    Vision,
}

/// Where a new user turn goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Into the chat's live audio session; no text reply.
    LiveSession,
    Generate(Backend),
}

/// Facts the routing predicates look at.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext {
    pub session_active: bool,
    pub has_image: bool,
}

impl RouteContext {
    pub fn new(session_active: bool, new_turn: &Turn) -> Self {
        Self {
            session_active,
            has_image: new_turn.image_count() > 0,
        }
    }
}

type Predicate = fn(&RouteContext) -> bool;

fn session_is_active(ctx: &RouteContext) -> bool {
    ctx.session_active
}

fn turn_has_image(ctx: &RouteContext) -> bool {
    ctx.has_image
}

fn always(_: &RouteContext) -> bool {
    true
}

/// Routing policy, highest priority first. First match wins.
pub const ROUTES: &[(Route, Predicate)] = &[
    (Route::LiveSession, session_is_active),
    (Route::Generate(Backend::Vision), turn_has_image),
    (Route::Generate(Backend::Text), always),
];

pub fn select_route(ctx: &RouteContext) -> Route {
    ROUTES
        .iter()
        .find(|(_, matches)| matches(ctx))
        .map(|(route, _)| *route)
        .unwrap_or(Route::Generate(Backend::Text))
}

impl Backend {
    /// Payload form the backend expects.
    pub fn shape(&self) -> PayloadShape {
        match self {
            Backend::Text => PayloadShape::Full,
            Backend::Vision => PayloadShape::Vision,
        }
    }
}

/// Generation settings shared by all single-shot calls.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub text_model: String,
    pub vision_model: String,
    pub search_grounding: bool,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            text_model: "gemini-2.0-flash-exp".to_string(),
            vision_model: "gemini-2.0-flash-exp".to_string(),
            search_grounding: true,
            temperature: 0.7,
            max_output_tokens: 1500,
        }
    }
}

pub struct ModelGateway {
    backend: Arc<dyn ModelBackend>,
    settings: GatewaySettings,
}

impl ModelGateway {
    pub fn new(backend: Arc<dyn ModelBackend>, settings: GatewaySettings) -> Self {
        Self { backend, settings }
    }

    /// Build the request a backend would receive for this payload.
    pub fn request(&self, payload: Payload, backend: Backend) -> GenerateRequest {
        let (model, search) = match backend {
            Backend::Text => (self.settings.text_model.clone(), self.settings.search_grounding),
            Backend::Vision => (self.settings.vision_model.clone(), false),
        };
        GenerateRequest {
            model,
            payload,
            search,
            temperature: self.settings.temperature,
            max_output_tokens: self.settings.max_output_tokens,
        }
    }

    /// Run a single-shot generation and return the reply text.
    pub async fn generate(
        &self,
        payload: Payload,
        backend: Backend,
    ) -> Result<String, RemoteError> {
        let request = self.request(payload, backend);
        info!("➡️ {:?} backend ({})", backend, request.model);
        match self.backend.generate(&request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!("{:?} backend failed: {}", backend, e);
                Err(e)
            }
        }
    }
}
