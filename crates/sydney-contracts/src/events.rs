use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A search source resolved against the citation markers of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAttribute {
    /// Citation number, or 0 while not yet matched to a marker.
    pub index: u32,
    pub link: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerativeImage {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerativeMusic {
    pub text: String,
    pub iframe_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImages {
    #[serde(flatten)]
    pub trigger: GenerativeImage,
    pub image_urls: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedMusic {
    pub iframe_id: String,
    pub request_id: String,
    pub cover_img_url: String,
    pub music_url: String,
    pub video_url: String,
    pub duration_secs: f64,
    pub musical_style: String,
    pub title: String,
    pub lyrics: String,
    pub elapsed_ms: u64,
}

/// Appended to a normal-closure error: the upstream closes normally when it
/// refuses an oversized request.
pub const CONTEXT_TOO_LONG_HINT: &str = "please check if the chat context is too long";

/// Which step of the websocket transport failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum TransportFailure {
    #[error("websocket handshake failed: {detail}")]
    HandshakeFailed { detail: String },
    #[error("send timed out")]
    SendTimeout,
    #[error("server unresponsive")]
    ServerUnresponsive,
    #[error("connection closed ({code}): {reason}{}", context_suffix(.context_too_long))]
    Closed {
        code: u16,
        reason: String,
        context_too_long: bool,
    },
    #[error("no response from server")]
    EmptyResponse,
    #[error("transport io: {detail}")]
    Io { detail: String },
    #[error("websocket error: {detail}")]
    Protocol { detail: String },
}

fn context_suffix(context_too_long: &bool) -> String {
    if *context_too_long {
        format!("; {CONTEXT_TOO_LONG_HINT}")
    } else {
        String::new()
    }
}

/// Why a stream ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StreamErrorKind {
    #[error("request rejected: {value}: {message}")]
    Rejected { value: String, message: String },
    #[error("message revoke detected")]
    Revoked,
    #[error("the message triggered the content filter")]
    Filtered,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("{0}")]
    Transport(TransportFailure),
    #[error("authentication failed ({status}): {body}")]
    ProvisionFailed { status: u16, body: String },
    #[error("bypass server failed: {0}")]
    BypassFailed(String),
    #[error("timed out waiting for the captcha to be solved")]
    ChallengeTimeout,
    #[error("captcha result is invalid: {0}")]
    InvalidChallengeResult(String),
    #[error("generation rejected: {0}")]
    GenerationRejected(String),
    #[error("generation timed out after {attempts} attempts")]
    GenerationTimeout { attempts: u32 },
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl StreamErrorKind {
    /// Worth re-provisioning and sending the turn again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Revoked)
    }

    pub fn is_captcha(&self) -> bool {
        matches!(self, Self::Rejected { value, .. } if value == "CaptchaChallenge")
    }

    /// Anti-bot failures that another challenge attempt may clear.
    pub fn is_challenge_failure(&self) -> bool {
        matches!(
            self,
            Self::BypassFailed(_) | Self::ChallengeTimeout | Self::InvalidChallengeResult(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    SearchQuery(String),
    SearchResult(Vec<SourceAttribute>),
    Loading(String),
    GenerativeImageTrigger(GenerativeImage),
    GenerativeMusicTrigger(GenerativeMusic),
    ExecutingTask(String),
    MessageTextDelta(String),
    SuggestedResponses(Vec<String>),
    SolvingCaptcha(String),
    Error(StreamErrorKind),
}

impl StreamEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SearchQuery(_) => "search_query",
            Self::SearchResult(_) => "search_result",
            Self::Loading(_) => "loading",
            Self::GenerativeImageTrigger(_) => "generative_image_trigger",
            Self::GenerativeMusicTrigger(_) => "generative_music_trigger",
            Self::ExecutingTask(_) => "executing_task",
            Self::MessageTextDelta(_) => "message_text_delta",
            Self::SuggestedResponses(_) => "suggested_responses",
            Self::SolvingCaptcha(_) => "solving_captcha",
            Self::Error(_) => "error",
        }
    }
}

/// Append-only transcript of stream events, one compact JSON object per line.
///
/// Each line carries `type`, `turn_id` and `ts`, then the event payload under
/// `data`.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    turn_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, turn_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                turn_id: turn_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn turn_id(&self) -> &str {
        &self.inner.turn_id
    }

    pub fn emit(&self, event: &StreamEvent) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert(
            "type".to_string(),
            Value::String(event.type_name().to_string()),
        );
        line.insert(
            "turn_id".to_string(),
            Value::String(self.inner.turn_id.clone()),
        );
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(encoded) = serde_json::to_value(event)? {
            if let Some(data) = encoded.get("data") {
                line.insert("data".to_string(), data.clone());
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let raw = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(raw.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("transcript.jsonl");
        let writer = EventWriter::new(&path, "turn-1");

        let emitted = writer.emit(&StreamEvent::MessageTextDelta("Hel".to_string()))?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], "message_text_delta");
        assert_eq!(parsed["turn_id"], "turn-1");
        assert_eq!(parsed["data"], "Hel");

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn error_events_nest_their_kind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("transcript.jsonl");
        let writer = EventWriter::new(&path, "turn-2");

        writer.emit(&StreamEvent::Error(StreamErrorKind::Rejected {
            value: "Throttled".to_string(),
            message: "slow down".to_string(),
        }))?;
        writer.emit(&StreamEvent::Error(StreamErrorKind::Revoked))?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["data"]["kind"], "rejected");
        assert_eq!(lines[0]["data"]["detail"]["value"], "Throttled");
        assert_eq!(lines[1]["data"]["kind"], "revoked");
        Ok(())
    }

    #[test]
    fn event_type_names_match_serde_tags() -> anyhow::Result<()> {
        let events = [
            StreamEvent::SearchQuery("q".to_string()),
            StreamEvent::SearchResult(Vec::new()),
            StreamEvent::SuggestedResponses(vec!["a".to_string()]),
            StreamEvent::SolvingCaptcha("wait".to_string()),
            StreamEvent::Error(StreamErrorKind::Filtered),
        ];
        for event in events {
            let encoded = serde_json::to_value(&event)?;
            assert_eq!(encoded["type"], event.type_name());
            let decoded: StreamEvent = serde_json::from_value(encoded)?;
            assert_eq!(decoded, event);
        }
        Ok(())
    }

    #[test]
    fn captcha_rejections_are_recognised() {
        let captcha = StreamErrorKind::Rejected {
            value: "CaptchaChallenge".to_string(),
            message: String::new(),
        };
        assert!(captcha.is_captcha());
        assert!(!StreamErrorKind::Filtered.is_retryable());
        assert!(StreamErrorKind::Transport(TransportFailure::SendTimeout).is_retryable());
        assert!(StreamErrorKind::ChallengeTimeout.is_challenge_failure());
        assert!(!StreamErrorKind::ProvisionFailed {
            status: 401,
            body: String::new()
        }
        .is_challenge_failure());
    }

    #[test]
    fn transport_failures_keep_their_step() -> anyhow::Result<()> {
        let closed = StreamErrorKind::Transport(TransportFailure::Closed {
            code: 1000,
            reason: String::new(),
            context_too_long: true,
        });
        assert_eq!(
            closed.to_string(),
            "connection closed (1000): ; please check if the chat context is too long"
        );

        let encoded = serde_json::to_value(StreamEvent::Error(closed.clone()))?;
        assert_eq!(encoded["data"]["kind"], "transport");
        assert_eq!(encoded["data"]["detail"]["failure"], "closed");
        assert_eq!(encoded["data"]["detail"]["code"], 1000);
        let decoded: StreamEvent = serde_json::from_value(encoded)?;
        assert_eq!(decoded, StreamEvent::Error(closed));

        let unresponsive = serde_json::to_value(StreamErrorKind::Transport(
            TransportFailure::ServerUnresponsive,
        ))?;
        assert_eq!(unresponsive["detail"]["failure"], "server_unresponsive");
        Ok(())
    }
}
