//! Upstream completion subsystem.
//!
//! # Data Flow
//! ```text
//! sanitized conversation + system prompt + tool catalog
//!     → CompletionProvider::complete (openai.rs: POST /chat/completions, stream)
//!     → stream of text chunks
//!
//! Any failure (before or during the stream):
//!     → UpstreamError
//!     → classify.rs (ordered rules, first match wins)
//!     → ApiError (fixed status + caller-facing message per kind)
//! ```
//!
//! # Design Decisions
//! - The provider is a trait so the HTTP layer can be tested with fakes
//! - Raw provider error text never reaches the caller, only the log

pub mod classify;
pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::schema::ToolConfig;
use crate::conversation::Message;

pub use classify::{ApiError, ErrorClassifier, ErrorKind};
pub use openai::OpenAiProvider;

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolConfig>,
}

/// Incremental completion text.
pub type ChunkStream = BoxStream<'static, Result<String, UpstreamError>>;

/// Failure raised by the upstream completion service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Non-success HTTP status, with whatever the provider said about it.
    #[error("upstream returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        code: Option<String>,
        error_type: Option<String>,
        /// Seconds, from the provider's Retry-After header.
        retry_after: Option<u64>,
    },

    /// Error object delivered inside an otherwise successful stream.
    #[error("upstream stream error: {message}")]
    Stream {
        message: String,
        code: Option<String>,
        error_type: Option<String>,
    },

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Response could not be understood.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Provider error code, e.g. `context_length_exceeded`.
    pub fn code(&self) -> Option<&str> {
        match self {
            UpstreamError::Status { code, .. } | UpstreamError::Stream { code, .. } => {
                code.as_deref()
            }
            _ => None,
        }
    }

    pub fn error_type(&self) -> Option<&str> {
        match self {
            UpstreamError::Status { error_type, .. }
            | UpstreamError::Stream { error_type, .. } => error_type.as_deref(),
            _ => None,
        }
    }

    /// Human-readable text carried by the error.
    pub fn message(&self) -> &str {
        match self {
            UpstreamError::Status { message, .. } | UpstreamError::Stream { message, .. } => {
                message
            }
            UpstreamError::Timeout(m) | UpstreamError::Transport(m) | UpstreamError::Protocol(m) => m,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            UpstreamError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// An opaque streaming text-completion service.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Start a completion. Errors before the first chunk are returned
    /// directly; later ones arrive as items of the stream.
    async fn complete(&self, request: CompletionRequest) -> Result<ChunkStream, UpstreamError>;
}
