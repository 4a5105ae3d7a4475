//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Domain errors** (`TranscodeError`, `InferenceError`, `ArbiterError`,
//!   `ValidationError`, `PipelineError`) describe what went wrong inside one
//!   pipeline invocation. They derive `thiserror::Error` and carry no HTTP knowledge,
//!   so the WebSocket session can turn them into reply frames just as easily.
//! - **`AppError`** is what HTTP handlers return. It implements actix's
//!   `ResponseError`, which picks the status code and renders the JSON body.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "unsupported_media",
//!     "message": "invalid or unsupported audio: ...",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;

/// Why the converter could not produce PCM.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// Input bytes could not be decoded as audio
    #[error("invalid or unsupported audio: {0}")]
    InvalidInput(String),

    /// The converter binary is missing or cannot be spawned
    #[error("audio converter unavailable: {0}")]
    ConverterUnavailable(String),

    #[error("audio conversion timed out after {0:?}")]
    ConverterTimeout(Duration),
}

impl TranscodeError {
    /// Short machine-readable reason, matching the converter failure taxonomy.
    pub fn reason(&self) -> &'static str {
        match self {
            TranscodeError::InvalidInput(_) => "invalid_input",
            TranscodeError::ConverterUnavailable(_) => "converter_unavailable",
            TranscodeError::ConverterTimeout(_) => "converter_timeout",
        }
    }
}

/// Failure inside the speech model call.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("inference failed: {0}")]
    Failed(String),

    /// The blocking inference task panicked or was torn down
    #[error("inference task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    #[error("no engine became available within {0:?}")]
    Busy(Duration),

    #[error("engine pool is shut down")]
    Closed,
}

/// Input rejected before any converter or engine work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("audio payload is empty")]
    Empty,

    #[error("audio payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

/// Everything one pipeline invocation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("server busy, no engine available within {0:?}")]
    EngineBusy(Duration),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ArbiterError> for PipelineError {
    fn from(err: ArbiterError) -> Self {
        match err {
            ArbiterError::Busy(waited) => PipelineError::EngineBusy(waited),
            ArbiterError::Closed => PipelineError::Internal(err.to_string()),
        }
    }
}

impl PipelineError {
    /// Label used for the `kind` dimension of `errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Transcode(_) => "transcode",
            PipelineError::EngineBusy(_) => "busy",
            PipelineError::Inference(_) => "inference",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// Failures caused by the submitted audio itself, as opposed to server load
    /// or faults. Only these count towards closing a streaming session.
    pub fn is_input_fault(&self) -> bool {
        matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::Transcode(TranscodeError::InvalidInput(_))
                | PipelineError::Transcode(TranscodeError::ConverterTimeout(_))
        )
    }

    /// Whether a client may simply retry the same chunk later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::EngineBusy(_))
    }
}

/// HTTP-facing error returned by handlers and middleware.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded. Please slow down.")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Pipeline(PipelineError::Validation(ValidationError::TooLarge { .. })) => {
                "payload_too_large"
            }
            AppError::Pipeline(PipelineError::Validation(ValidationError::Empty)) => {
                "unsupported_media"
            }
            AppError::Pipeline(PipelineError::Transcode(TranscodeError::ConverterUnavailable(_))) => {
                "converter_unavailable"
            }
            AppError::Pipeline(PipelineError::Transcode(_)) => "unsupported_media",
            AppError::Pipeline(PipelineError::EngineBusy(_)) => "server_busy",
            AppError::Pipeline(PipelineError::Inference(_)) => "inference_error",
            AppError::Pipeline(PipelineError::Internal(_)) | AppError::Internal(_) => {
                "internal_error"
            }
            AppError::BadRequest(_) => "bad_request",
            AppError::RateLimited => "rate_limited",
        }
    }
}

/// ## HTTP Status Code Mapping:
/// - oversized upload → 413
/// - empty or undecodable audio, converter timeout → 415
/// - converter missing, no engine slot in time → 503
/// - model failure, internal faults → 500
/// - malformed request → 400, rate limit → 429
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Pipeline(err) => match err {
                PipelineError::Validation(ValidationError::TooLarge { .. }) => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                PipelineError::Validation(ValidationError::Empty) => {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                }
                PipelineError::Transcode(TranscodeError::ConverterUnavailable(_)) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PipelineError::Transcode(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                PipelineError::EngineBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
                PipelineError::Inference(_) | PipelineError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());

        if let AppError::RateLimited = self {
            return builder.json(json!({ "detail": self.to_string() }));
        }

        if let AppError::Pipeline(PipelineError::EngineBusy(waited)) = self {
            builder.insert_header((header::RETRY_AFTER, waited.as_secs().max(1).to_string()));
        }

        builder.json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Invalid multipart body: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
