//! Minimal Chrome DevTools Protocol client over a blocking websocket.
//!
//! Only what the challenge flow needs: numbered command/response
//! correlation, a backlog for events that arrive while a command is in
//! flight, and a launcher that starts a throwaway browser profile.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tempfile::TempDir;
use tracing::{debug, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message as WsMessage, WebSocket};

use crate::error::{Result, SydneyError, TransportError};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
const LISTENING_PREFIX: &str = "DevTools listening on ";
const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "microsoft-edge",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DevtoolsEvent {
    pub method: String,
    pub params: Value,
}

pub trait DevtoolsSession: Send {
    /// Send one command and wait for its result object.
    fn call(&mut self, method: &str, params: Value) -> Result<Value>;

    /// Next protocol event, or `None` if nothing arrived within `wait`.
    fn next_event(&mut self, wait: Duration) -> Result<Option<DevtoolsEvent>>;
}

pub trait BrowserLauncher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn DevtoolsSession>>;
}

type CdpSocket = WebSocket<MaybeTlsStream<TcpStream>>;

struct CdpConnection {
    ws: CdpSocket,
    next_id: u64,
    session_id: Option<String>,
    backlog: VecDeque<DevtoolsEvent>,
}

impl CdpConnection {
    fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tungstenite::connect(url)
            .map_err(|err| TransportError::HandshakeFailed(format!("devtools {url}: {err}")))?;
        Ok(Self {
            ws,
            next_id: 0,
            session_id: None,
            backlog: VecDeque::new(),
        })
    }

    fn read_json(&mut self, wait: Duration) -> Result<Option<Value>> {
        if let MaybeTlsStream::Plain(stream) = self.ws.get_mut() {
            let _ = stream.set_read_timeout(Some(wait.max(Duration::from_millis(1))));
        }
        match self.ws.read() {
            Ok(WsMessage::Text(text)) => serde_json::from_str(text.as_str())
                .map(Some)
                .map_err(|err| SydneyError::MalformedFrame(format!("devtools message: {err}"))),
            Ok(WsMessage::Close(_)) => Err(TransportError::Closed {
                code: 1000,
                reason: "browser closed the devtools connection".to_string(),
                context_hint: None,
            }
            .into()),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(err) => Err(TransportError::Protocol(format!("devtools: {err}")).into()),
        }
    }

    fn queue_event(&mut self, message: &Value) {
        if let Some(method) = message.get("method").and_then(Value::as_str) {
            self.backlog.push_back(DevtoolsEvent {
                method: method.to_string(),
                params: message.get("params").cloned().unwrap_or(Value::Null),
            });
        }
    }
}

impl DevtoolsSession for CdpConnection {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let mut command = json!({"id": id, "method": method, "params": params});
        if let Some(session_id) = &self.session_id {
            command["sessionId"] = Value::String(session_id.clone());
        }
        self.ws
            .send(WsMessage::Text(command.to_string().into()))
            .map_err(|err| TransportError::Protocol(format!("devtools send: {err}")))?;

        let deadline = Instant::now() + COMMAND_TIMEOUT;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let Some(message) = self.read_json(remaining)? else {
                continue;
            };
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                self.queue_event(&message);
                continue;
            }
            if let Some(error) = message.get("error") {
                return Err(SydneyError::Other(format!("devtools {method} failed: {error}")));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(SydneyError::Other(format!("devtools {method} timed out")))
    }

    fn next_event(&mut self, wait: Duration) -> Result<Option<DevtoolsEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        let Some(message) = self.read_json(wait)? else {
            return Ok(None);
        };
        self.queue_event(&message);
        Ok(self.backlog.pop_front())
    }
}

/// A browser process with its own temporary profile. Killed on drop.
struct BrowserProcess {
    child: Child,
    _profile: TempDir,
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct ChromeSession {
    cdp: CdpConnection,
    _process: BrowserProcess,
}

impl DevtoolsSession for ChromeSession {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.cdp.call(method, params)
    }

    fn next_event(&mut self, wait: Duration) -> Result<Option<DevtoolsEvent>> {
        self.cdp.next_event(wait)
    }
}

/// Starts a visible Chromium-family browser with remote debugging on an
/// ephemeral port and attaches to a fresh page.
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    executable: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }

    fn spawn(&self, profile: &TempDir) -> Result<Child> {
        let candidates: Vec<PathBuf> = match &self.executable {
            Some(path) => vec![path.clone()],
            None => BROWSER_CANDIDATES.iter().map(PathBuf::from).collect(),
        };
        let mut last_error = None;
        for candidate in candidates {
            let spawned = Command::new(&candidate)
                .arg("--remote-debugging-port=0")
                .arg(format!("--user-data-dir={}", profile.path().display()))
                .args([
                    "--no-first-run",
                    "--no-default-browser-check",
                    "--disable-default-apps",
                    "about:blank",
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn();
            match spawned {
                Ok(child) => {
                    debug!(browser = %candidate.display(), "launched browser");
                    return Ok(child);
                }
                Err(err) => last_error = Some(format!("{}: {err}", candidate.display())),
            }
        }
        Err(SydneyError::Config(format!(
            "cannot launch a browser ({})",
            last_error.unwrap_or_else(|| "no candidates".to_string())
        )))
    }
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Box<dyn DevtoolsSession>> {
        let profile = tempfile::Builder::new()
            .prefix("sydney-browser-")
            .tempdir()?;
        let mut child = self.spawn(&profile)?;
        let stderr = child.stderr.take();
        let process = BrowserProcess {
            child,
            _profile: profile,
        };

        let (endpoint_tx, endpoint_rx) = mpsc::channel();
        if let Some(stderr) = stderr {
            std::thread::Builder::new()
                .name("sydney-browser-stderr".to_string())
                .spawn(move || {
                    let mut endpoint_tx = Some(endpoint_tx);
                    for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
                        if let Some(url) = line.trim().strip_prefix(LISTENING_PREFIX) {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(url.trim().to_string());
                            }
                        }
                    }
                })?;
        }
        let endpoint = endpoint_rx.recv_timeout(STARTUP_TIMEOUT).map_err(|_| {
            SydneyError::Other("browser did not expose a devtools endpoint".to_string())
        })?;
        debug!(endpoint = endpoint.as_str(), "devtools endpoint ready");

        let mut cdp = CdpConnection::connect(&endpoint)?;
        let target = cdp.call("Target.createTarget", json!({"url": "about:blank"}))?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| SydneyError::Other("devtools returned no target id".to_string()))?
            .to_string();
        let attached = cdp.call(
            "Target.attachToTarget",
            json!({"targetId": target_id, "flatten": true}),
        )?;
        match attached.get("sessionId").and_then(Value::as_str) {
            Some(session_id) => cdp.session_id = Some(session_id.to_string()),
            None => warn!("devtools attach returned no session id"),
        }
        Ok(Box::new(ChromeSession {
            cdp,
            _process: process,
        }))
    }
}
