use std::io;

use sydney_contracts::events::{StreamErrorKind, TransportFailure};
use sydney_contracts::wire::inbound::FrameError;

pub type Result<T, E = SydneyError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("send timed out")]
    SendTimeout,
    #[error("server unresponsive")]
    ServerUnresponsive,
    #[error("connection closed ({code}): {reason}{}", hint_suffix(.context_hint))]
    Closed {
        code: u16,
        reason: String,
        context_hint: Option<&'static str>,
    },
    #[error("no response from server")]
    EmptyResponse,
    #[error("transport io: {0}")]
    Io(#[from] io::Error),
    #[error("websocket error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Serializable view of which step failed.
    pub fn failure(&self) -> TransportFailure {
        match self {
            Self::HandshakeFailed(detail) => TransportFailure::HandshakeFailed {
                detail: detail.clone(),
            },
            Self::SendTimeout => TransportFailure::SendTimeout,
            Self::ServerUnresponsive => TransportFailure::ServerUnresponsive,
            Self::Closed {
                code,
                reason,
                context_hint,
            } => TransportFailure::Closed {
                code: *code,
                reason: reason.clone(),
                context_too_long: context_hint.is_some(),
            },
            Self::EmptyResponse => TransportFailure::EmptyResponse,
            Self::Io(err) => TransportFailure::Io {
                detail: err.to_string(),
            },
            Self::Protocol(detail) => TransportFailure::Protocol {
                detail: detail.clone(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SydneyError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("authentication failed ({status}): {body}")]
    ProvisionFailed { status: u16, body: String },
    #[error("conversation rejected: {value}: {message}")]
    ProvisionRejected { value: String, message: String },
    #[error("bypass server failed: {0}")]
    BypassFailed(String),
    #[error("timed out waiting for the captcha to be solved")]
    ChallengeTimeout,
    #[error("captcha result is invalid: {0}")]
    InvalidChallengeResult(String),
    #[error("cancelled")]
    Cancelled,
    #[error("generation rejected: {0}")]
    GenerationRejected(String),
    #[error("generation timed out after {attempts} attempts")]
    GenerationTimeout { attempts: u32 },
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

impl SydneyError {
    pub fn http(prefix: &str, err: impl std::fmt::Display) -> Self {
        Self::Http(format!("{prefix}: {err}"))
    }

    pub fn is_captcha(&self) -> bool {
        matches!(self, Self::ProvisionRejected { value, .. } if value == "CaptchaChallenge")
    }

    /// Stream-level view of an error that ended a turn.
    pub fn to_stream_kind(&self) -> StreamErrorKind {
        match self {
            Self::Transport(err) => StreamErrorKind::Transport(err.failure()),
            Self::MalformedFrame(detail) => StreamErrorKind::MalformedFrame(detail.clone()),
            Self::ProvisionFailed { status, body } => StreamErrorKind::ProvisionFailed {
                status: *status,
                body: body.clone(),
            },
            Self::ProvisionRejected { value, message } => StreamErrorKind::Rejected {
                value: value.clone(),
                message: message.clone(),
            },
            Self::BypassFailed(detail) => StreamErrorKind::BypassFailed(detail.clone()),
            Self::ChallengeTimeout => StreamErrorKind::ChallengeTimeout,
            Self::InvalidChallengeResult(detail) => {
                StreamErrorKind::InvalidChallengeResult(detail.clone())
            }
            Self::Cancelled => StreamErrorKind::Cancelled,
            Self::GenerationRejected(detail) => StreamErrorKind::GenerationRejected(detail.clone()),
            Self::GenerationTimeout { attempts } => StreamErrorKind::GenerationTimeout {
                attempts: *attempts,
            },
            Self::Http(detail) => StreamErrorKind::Http(detail.clone()),
            Self::Config(detail) => StreamErrorKind::Config(detail.clone()),
            Self::Other(detail) => StreamErrorKind::Other(detail.clone()),
        }
    }
}

impl From<io::Error> for SydneyError {
    fn from(err: io::Error) -> Self {
        Self::Transport(TransportError::Io(err))
    }
}

impl From<FrameError> for SydneyError {
    fn from(err: FrameError) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    hint.map(|hint| format!("; {hint}")).unwrap_or_default()
}

pub(crate) fn is_tungstenite_transport_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io_err) => is_transport_io_error_kind(io_err.kind()),
        tungstenite::Error::Tls(_) => true,
        _ => false,
    }
}

pub(crate) fn is_transport_io_error_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_error_appends_context_hint() {
        let err = TransportError::Closed {
            code: 1000,
            reason: String::new(),
            context_hint: Some("please check if the chat context is too long"),
        };
        assert_eq!(
            err.to_string(),
            "connection closed (1000): ; please check if the chat context is too long"
        );
    }

    #[test]
    fn stream_kinds_follow_taxonomy() {
        let captcha = SydneyError::ProvisionRejected {
            value: "CaptchaChallenge".to_string(),
            message: "solve it".to_string(),
        };
        assert!(captcha.is_captcha());
        assert!(captcha.to_stream_kind().is_captcha());
        assert!(SydneyError::from(TransportError::SendTimeout)
            .to_stream_kind()
            .is_retryable());
        assert_eq!(
            SydneyError::ChallengeTimeout.to_stream_kind(),
            StreamErrorKind::ChallengeTimeout
        );
        assert_eq!(
            SydneyError::BypassFailed("502".to_string()).to_stream_kind(),
            StreamErrorKind::BypassFailed("502".to_string())
        );
        assert_eq!(
            SydneyError::ProvisionFailed {
                status: 401,
                body: "unauthorized".to_string(),
            }
            .to_stream_kind(),
            StreamErrorKind::ProvisionFailed {
                status: 401,
                body: "unauthorized".to_string(),
            }
        );
    }

    #[test]
    fn transport_errors_keep_their_step() {
        let kind = |err: TransportError| SydneyError::from(err).to_stream_kind();
        assert_eq!(
            kind(TransportError::SendTimeout),
            StreamErrorKind::Transport(TransportFailure::SendTimeout)
        );
        assert_eq!(
            kind(TransportError::ServerUnresponsive),
            StreamErrorKind::Transport(TransportFailure::ServerUnresponsive)
        );
        assert_eq!(
            kind(TransportError::HandshakeFailed("status 403".to_string())),
            StreamErrorKind::Transport(TransportFailure::HandshakeFailed {
                detail: "status 403".to_string()
            })
        );
        assert_eq!(
            kind(TransportError::Closed {
                code: 1000,
                reason: "bye".to_string(),
                context_hint: Some("hint"),
            }),
            StreamErrorKind::Transport(TransportFailure::Closed {
                code: 1000,
                reason: "bye".to_string(),
                context_too_long: true,
            })
        );
        assert_eq!(
            kind(TransportError::EmptyResponse),
            StreamErrorKind::Transport(TransportFailure::EmptyResponse)
        );
    }

    #[test]
    fn transport_io_kinds() {
        assert!(is_transport_io_error_kind(io::ErrorKind::BrokenPipe));
        assert!(!is_transport_io_error_kind(io::ErrorKind::PermissionDenied));
        assert!(is_tungstenite_transport_error(&tungstenite::Error::ConnectionClosed));
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
