//! Centralized error types for Echomesh.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! error variants that convert directly to ingress responses. Every variant
//! carries a stable machine-readable code; peers and callers dispatch on the
//! code, never on the human-readable message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all Echomesh crates.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // === Envelope validation ===
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Unsupported envelope version")]
    UnsupportedVersion,

    #[error("Unknown envelope type")]
    InvalidType,

    #[error("Message body exceeds the permitted length")]
    BodyTooLarge,

    #[error("Sealed payload exceeds the permitted size")]
    PayloadTooLarge,

    #[error("Inner and outer message ids differ")]
    MsgIdMismatch,

    #[error("Inner conversation id does not match the sender")]
    ConvIdMismatch,

    // === Authorization ===
    #[error("Recipient is not this device")]
    RecipientNotSelf,

    #[error("Sender signature could not be verified")]
    SenderUnknown,

    #[error("Sender is not a known contact")]
    SenderNotAllowed,

    #[error("Sender is not a verified contact")]
    SenderNotVerified,

    // === Semantic conflicts ===
    #[error("Duplicate nonce from this sender")]
    ReplayDetected,

    #[error("No key for this recipient in the sealed payload")]
    RecipientUnknown,

    #[error("A device cannot import itself as a contact")]
    SelfContactNotAllowed,

    #[error("No local identity has been provisioned")]
    LocalIdentityMissing,

    // === Invites ===
    #[error("Invite not found")]
    InviteNotFound,

    #[error("Invite has already been used")]
    InviteUsed,

    #[error("Invite has expired")]
    InviteExpired,

    #[error("No identity available to answer the invite")]
    NoIdentity,

    #[error("No published onion available to answer the invite")]
    NoOnion,

    // === Canonical form ===
    #[error("Not a canonical v3 onion address")]
    InvalidOnion,

    #[error("Not a canonical 40-hex fingerprint")]
    InvalidFingerprint,

    #[error("Invite token has an invalid shape")]
    InvalidToken,

    // === Crypto ===
    #[error("Sealed payload could not be decrypted")]
    CryptoDecryptFail,

    #[error("Plaintext could not be sealed")]
    EncryptFail,

    #[error("Decrypted payload is not valid JSON")]
    PlaintextJsonInvalid,

    // === Infrastructure ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error body sent by the ingress: `{"v":1,"ok":false,"code":...}`.
#[derive(Serialize)]
struct ErrorBody {
    v: u8,
    ok: bool,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl CoreError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. }
            | Self::UnsupportedVersion
            | Self::InvalidType
            | Self::BodyTooLarge
            | Self::MsgIdMismatch
            | Self::ConvIdMismatch
            | Self::InvalidToken
            | Self::CryptoDecryptFail
            | Self::PlaintextJsonInvalid => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RecipientNotSelf | Self::SenderUnknown => StatusCode::UNAUTHORIZED,
            Self::SenderNotAllowed | Self::SenderNotVerified => StatusCode::FORBIDDEN,
            Self::ReplayDetected
            | Self::RecipientUnknown
            | Self::SelfContactNotAllowed
            | Self::LocalIdentityMissing
            | Self::NoIdentity
            | Self::NoOnion
            | Self::InvalidOnion
            | Self::InvalidFingerprint => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InviteNotFound => StatusCode::NOT_FOUND,
            Self::InviteUsed => StatusCode::CONFLICT,
            Self::InviteExpired => StatusCode::GONE,
            Self::EncryptFail | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error code string for programmatic handling by peers.
    pub fn error_code(&self) -> &str {
        match self {
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::InvalidType => "INVALID_TYPE",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::MsgIdMismatch => "MSG_ID_MISMATCH",
            Self::ConvIdMismatch => "CONV_ID_MISMATCH",
            Self::RecipientNotSelf => "RECIPIENT_NOT_SELF",
            Self::SenderUnknown => "SENDER_UNKNOWN",
            Self::SenderNotAllowed => "SENDER_NOT_ALLOWED",
            Self::SenderNotVerified => "SENDER_NOT_VERIFIED",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::RecipientUnknown => "RECIPIENT_UNKNOWN",
            Self::SelfContactNotAllowed => "SELF_CONTACT_NOT_ALLOWED",
            Self::LocalIdentityMissing => "LOCAL_IDENTITY_MISSING",
            Self::InviteNotFound => "INVITE_NOT_FOUND",
            Self::InviteUsed => "INVITE_USED",
            Self::InviteExpired => "INVITE_EXPIRED",
            Self::NoIdentity => "NO_IDENTITY",
            Self::NoOnion => "NO_ONION",
            Self::InvalidOnion => "INVALID_ONION",
            Self::InvalidFingerprint => "INVALID_FINGERPRINT",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::CryptoDecryptFail => "CRYPTO_DECRYPT_FAIL",
            Self::EncryptFail => "PGP_ENCRYPT_FAIL",
            Self::PlaintextJsonInvalid => "PLAINTEXT_JSON_INVALID",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a sender seeing this error may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Internal(_))
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to callers
        let message = match &self {
            CoreError::Database(e) => {
                tracing::error!("Database error: {e}");
                None
            }
            CoreError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                None
            }
            other => Some(other.to_string()),
        };

        let body = ErrorBody {
            v: 1,
            ok: false,
            code: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
