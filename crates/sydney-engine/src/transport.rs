//! WebSocket transport: dialing, protocol negotiation, keep-alive, and the
//! read/write timeout discipline.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sydney_contracts::conversation::Conversation;
use sydney_contracts::events::CONTEXT_TOO_LONG_HINT;
use sydney_contracts::session::{HeaderList, SessionContext};
use sydney_contracts::wire::{encode_frame, split_frames, KEEP_ALIVE_FRAME, NEGOTIATION_FRAME};
use tracing::debug;
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::HandshakeError;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message as WsMessage, WebSocket};

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::error::{is_tungstenite_transport_error, Result, SydneyError, TransportError};

pub const NORMAL_CLOSE_HINT: &str = CONTEXT_TOO_LONG_HINT;

const KEEP_ALIVE_MODULUS: u64 = 6;
const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub write: Duration,
    pub read: Duration,
    /// Granularity at which reads wake up to observe cancellation.
    pub poll_slice: Duration,
    pub connect: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            write: Duration::from_secs(5),
            read: Duration::from_secs(30),
            poll_slice: Duration::from_millis(250),
            connect: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketRead {
    Text(String),
    /// Binary, ping, pong and raw frames.
    Other,
    /// Nothing arrived within the wait.
    Idle,
    Closed { code: u16, reason: String },
}

pub trait FrameSocket: Send {
    fn send_text(&mut self, text: &str, timeout: Duration) -> Result<()>;
    fn receive(&mut self, wait: Duration) -> Result<SocketRead>;
    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub url: String,
    pub headers: HeaderList,
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
}

pub struct DialedSocket {
    pub socket: Box<dyn FrameSocket>,
    /// `Set-Cookie` values from the upgrade response.
    pub set_cookies: Vec<String>,
}

pub trait WsDialer: Send + Sync {
    fn dial(&self, request: &DialRequest) -> Result<DialedSocket>;
}

/// Chat hub URL with the access token as a query parameter when present.
pub fn chat_hub_url(base: &str, sec_access_token: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|err| SydneyError::Config(format!("invalid chat hub url {base}: {err}")))?;
    if !sec_access_token.is_empty() {
        url.query_pairs_mut()
            .append_pair("sec_access_token", sec_access_token);
    }
    Ok(url.to_string())
}

/// An open, negotiated chat connection.
pub struct Connection {
    socket: Box<dyn FrameSocket>,
    clock: Arc<dyn Clock>,
    timeouts: TransportTimeouts,
    cancel: CancelSignal,
    closed: bool,
}

impl Connection {
    pub fn open(
        dialer: &dyn WsDialer,
        session: &SessionContext,
        conversation: &Conversation,
        clock: Arc<dyn Clock>,
        timeouts: TransportTimeouts,
        cancel: CancelSignal,
    ) -> Result<Self> {
        let request = DialRequest {
            url: chat_hub_url(&session.endpoints.chat_hub, &conversation.sec_access_token)?,
            headers: session.chat_headers(),
            proxy: session.proxy.clone(),
            connect_timeout: timeouts.connect,
        };
        let dialed = dialer.dial(&request)?;
        let refreshed = session
            .cookies
            .absorb_set_cookies(dialed.set_cookies.iter().map(String::as_str));
        if refreshed > 0 {
            debug!(refreshed, "cookies updated by websocket upgrade");
        }
        let mut connection = Self {
            socket: dialed.socket,
            clock,
            timeouts,
            cancel,
            closed: false,
        };
        connection.cancel.check()?;
        connection.negotiate()?;
        Ok(connection)
    }

    fn negotiate(&mut self) -> Result<()> {
        self.send(NEGOTIATION_FRAME)?;
        // Protocol ack; its content carries nothing.
        self.receive()?;
        self.send(KEEP_ALIVE_FRAME)
    }

    pub fn send(&mut self, payload: &str) -> Result<()> {
        self.cancel.check()?;
        debug!(payload, "sending frame");
        self.socket
            .send_text(&encode_frame(payload), self.timeouts.write)
    }

    /// Read one physical message and return its non-empty logical frames.
    /// Non-text messages yield no frames.
    pub fn receive(&mut self) -> Result<Vec<String>> {
        let mut waited = Duration::ZERO;
        loop {
            self.cancel.check()?;
            let wait = self.timeouts.poll_slice.min(self.timeouts.read);
            match self.socket.receive(wait)? {
                SocketRead::Text(text) => {
                    if text.is_empty() {
                        return Err(TransportError::EmptyResponse.into());
                    }
                    let frames: Vec<String> =
                        split_frames(&text).into_iter().map(str::to_string).collect();
                    for frame in &frames {
                        debug!(frame = frame.as_str(), "received frame");
                    }
                    self.keep_alive_if_due()?;
                    return Ok(frames);
                }
                SocketRead::Other => {
                    self.keep_alive_if_due()?;
                    return Ok(Vec::new());
                }
                SocketRead::Idle => {
                    waited += wait;
                    if waited >= self.timeouts.read {
                        return Err(TransportError::ServerUnresponsive.into());
                    }
                }
                SocketRead::Closed { code, reason } => {
                    self.closed = true;
                    return Err(TransportError::Closed {
                        code,
                        reason,
                        context_hint: (code == NORMAL_CLOSURE).then_some(NORMAL_CLOSE_HINT),
                    }
                    .into());
                }
            }
        }
    }

    fn keep_alive_if_due(&mut self) -> Result<()> {
        if self.clock.unix_seconds() % KEEP_ALIVE_MODULUS == 0 {
            debug!("sending keep-alive");
            self.send(KEEP_ALIVE_FRAME)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.socket.close();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Synchronous tungstenite dialer over rustls, with optional HTTP CONNECT
/// proxy tunnelling.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteDialer;

impl WsDialer for TungsteniteDialer {
    fn dial(&self, request: &DialRequest) -> Result<DialedSocket> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::HandshakeFailed(format!("invalid request: {err}")))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                TransportError::HandshakeFailed(format!("invalid header name {name}: {err}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                TransportError::HandshakeFailed(format!("invalid header value for {name}: {err}"))
            })?;
            ws_request.headers_mut().insert(name, value);
        }

        let uri = ws_request.uri();
        let host = uri
            .host()
            .ok_or_else(|| TransportError::HandshakeFailed("url has no host".to_string()))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("ws") { 80 } else { 443 });

        let stream = match request.proxy.as_deref().filter(|proxy| !proxy.is_empty()) {
            Some(proxy) => connect_via_proxy(proxy, &host, port, request.connect_timeout)?,
            None => connect_direct(&host, port, request.connect_timeout)?,
        };
        stream.set_read_timeout(Some(request.connect_timeout))?;
        stream.set_write_timeout(Some(request.connect_timeout))?;

        let (ws, response) = tungstenite::client_tls_with_config(ws_request, stream, None, None)
            .map_err(|err| match err {
                HandshakeError::Failure(err) => handshake_failure(err),
                HandshakeError::Interrupted(_) => {
                    TransportError::HandshakeFailed("handshake interrupted".to_string())
                }
            })?;
        let set_cookies = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        Ok(DialedSocket {
            socket: Box::new(TungsteniteSocket { ws }),
            set_cookies,
        })
    }
}

fn connect_direct(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let mut last_error = io::Error::new(ErrorKind::NotFound, format!("{host} did not resolve"));
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = err,
        }
    }
    Err(TransportError::Io(last_error).into())
}

fn connect_via_proxy(proxy: &str, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let proxy_url = reqwest::Url::parse(proxy)
        .map_err(|err| SydneyError::Config(format!("invalid proxy {proxy}: {err}")))?;
    if !matches!(proxy_url.scheme(), "http" | "https") {
        return Err(SydneyError::Config(format!(
            "unsupported proxy scheme for websocket: {}",
            proxy_url.scheme()
        )));
    }
    let proxy_host = proxy_url
        .host_str()
        .ok_or_else(|| SydneyError::Config(format!("proxy has no host: {proxy}")))?;
    let proxy_port = proxy_url.port_or_known_default().unwrap_or(8080);
    let mut stream = connect_direct(proxy_host, proxy_port, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if !proxy_url.username().is_empty() {
        let credentials = format!(
            "{}:{}",
            proxy_url.username(),
            proxy_url.password().unwrap_or_default()
        );
        connect.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    connect.push_str("\r\n");
    stream.write_all(connect.as_bytes())?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 || response.len() > 8192 {
            return Err(TransportError::HandshakeFailed(
                "proxy closed the tunnel request".to_string(),
            )
            .into());
        }
        response.push(byte[0]);
    }
    let status_line = String::from_utf8_lossy(&response);
    let status_line = status_line.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(TransportError::HandshakeFailed(format!(
            "proxy refused tunnel: {status_line}"
        ))
        .into());
    }
    Ok(stream)
}

struct TungsteniteSocket {
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl TungsteniteSocket {
    fn tcp(&mut self) -> Option<&mut TcpStream> {
        match self.ws.get_mut() {
            MaybeTlsStream::Plain(stream) => Some(stream),
            MaybeTlsStream::Rustls(stream) => Some(stream.get_mut()),
            _ => None,
        }
    }
}

impl FrameSocket for TungsteniteSocket {
    fn send_text(&mut self, text: &str, timeout: Duration) -> Result<()> {
        if let Some(stream) = self.tcp() {
            let _ = stream.set_write_timeout(Some(timeout));
        }
        self.ws
            .send(WsMessage::Text(text.to_string().into()))
            .map_err(send_failure)
    }

    fn receive(&mut self, wait: Duration) -> Result<SocketRead> {
        if let Some(stream) = self.tcp() {
            let _ = stream.set_read_timeout(Some(wait.max(Duration::from_millis(1))));
        }
        read_outcome(self.ws.read())
    }

    fn close(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}

/// A non-101 upgrade response carries the status the server answered with.
fn handshake_failure(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => TransportError::HandshakeFailed(format!(
            "cannot establish a websocket connection (status {})",
            response.status()
        )),
        other => TransportError::HandshakeFailed(other.to_string()),
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn send_failure(err: tungstenite::Error) -> SydneyError {
    match err {
        tungstenite::Error::Io(err) if is_timeout(&err) => TransportError::SendTimeout.into(),
        other => map_ws_error(other),
    }
}

fn read_outcome(read: tungstenite::Result<WsMessage>) -> Result<SocketRead> {
    match read {
        Ok(WsMessage::Text(text)) => Ok(SocketRead::Text(text.to_string())),
        Ok(WsMessage::Close(frame)) => Ok(close_read(frame)),
        Ok(_) => Ok(SocketRead::Other),
        Err(tungstenite::Error::Io(err)) if is_timeout(&err) => Ok(SocketRead::Idle),
        Err(tungstenite::Error::ConnectionClosed) => Ok(SocketRead::Closed {
            code: NORMAL_CLOSURE,
            reason: String::new(),
        }),
        Err(err) => Err(map_ws_error(err)),
    }
}

fn close_read(frame: Option<CloseFrame>) -> SocketRead {
    match frame {
        Some(frame) => SocketRead::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        None => SocketRead::Closed {
            code: 1005,
            reason: String::new(),
        },
    }
}

fn map_ws_error(err: tungstenite::Error) -> SydneyError {
    if is_tungstenite_transport_error(&err) {
        if let tungstenite::Error::Io(io_err) = err {
            return TransportError::Io(io_err).into();
        }
    }
    TransportError::Protocol(err.to_string()).into()
}

#[cfg(test)]
mod tests {
    use sydney_contracts::cookies::CookieJar;
    use sydney_contracts::random::SequenceRandom;
    use sydney_contracts::session::SessionSettings;

    use super::*;
    use crate::testing::{FixedClock, ScriptedDialer, ScriptedSocket};

    fn session() -> SessionContext {
        let mut random = SequenceRandom::new(vec![0], 1);
        SessionContext::new(
            SessionSettings::default(),
            CookieJar::from_header("_U=abc"),
            &mut random,
        )
    }

    fn open(socket: ScriptedSocket, clock: FixedClock) -> Result<Connection> {
        let dialer = ScriptedDialer::new(socket).with_set_cookies(&["MUID=m1; path=/"]);
        Connection::open(
            &dialer,
            &session(),
            &Conversation {
                sec_access_token: "a+b/c=".to_string(),
                ..Conversation::default()
            },
            Arc::new(clock),
            TransportTimeouts::default(),
            CancelSignal::new(),
        )
    }

    #[test]
    fn chat_hub_url_escapes_token() -> anyhow::Result<()> {
        assert_eq!(
            chat_hub_url("wss://sydney.bing.com/sydney/ChatHub", "a+b/c=")?,
            "wss://sydney.bing.com/sydney/ChatHub?sec_access_token=a%2Bb%2Fc%3D"
        );
        assert_eq!(
            chat_hub_url("wss://sydney.bing.com/sydney/ChatHub", "")?,
            "wss://sydney.bing.com/sydney/ChatHub"
        );
        Ok(())
    }

    #[test]
    fn open_negotiates_and_dials_with_session_headers() -> anyhow::Result<()> {
        let socket = ScriptedSocket::new(vec![SocketRead::Text("{}\u{1e}".to_string())]);
        let sent = socket.sent();
        let dialer = ScriptedDialer::new(socket).with_set_cookies(&["MUID=m1; path=/"]);
        let dialed = dialer.requests();
        let session = session();
        let _connection = Connection::open(
            &dialer,
            &session,
            &Conversation {
                sec_access_token: "tok".to_string(),
                ..Conversation::default()
            },
            Arc::new(FixedClock::new(1)),
            TransportTimeouts::default(),
            CancelSignal::new(),
        )?;

        assert_eq!(
            sent.snapshot(),
            vec![
                encode_frame(NEGOTIATION_FRAME),
                encode_frame(KEEP_ALIVE_FRAME)
            ]
        );
        let requests = dialed.snapshot();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.ends_with("?sec_access_token=tok"));
        assert!(requests[0]
            .headers
            .iter()
            .any(|(name, value)| name == "cookie" && value == "_U=abc"));
        assert_eq!(session.cookies.get("MUID").as_deref(), Some("m1"));
        Ok(())
    }

    #[test]
    fn keep_alive_follows_clock_modulus() -> anyhow::Result<()> {
        let clock = FixedClock::new(1);
        let socket = ScriptedSocket::new(vec![
            SocketRead::Text("{}\u{1e}".to_string()),
            SocketRead::Text("{\"type\":6}\u{1e}".to_string()),
            SocketRead::Text("{\"type\":6}\u{1e}".to_string()),
            SocketRead::Other,
        ]);
        let sent = socket.sent();
        let mut connection = open(socket, clock.clone())?;
        let baseline = sent.snapshot().len();

        clock.set(7);
        connection.receive()?;
        assert_eq!(sent.snapshot().len(), baseline);

        clock.set(12);
        connection.receive()?;
        assert_eq!(sent.snapshot().len(), baseline + 1);
        assert_eq!(sent.snapshot().last(), Some(&encode_frame(KEEP_ALIVE_FRAME)));

        clock.set(18);
        assert!(connection.receive()?.is_empty());
        assert_eq!(sent.snapshot().len(), baseline + 2);
        Ok(())
    }

    #[test]
    fn receive_splits_and_skips_empty_frames() -> anyhow::Result<()> {
        let socket = ScriptedSocket::new(vec![
            SocketRead::Text("{}\u{1e}".to_string()),
            SocketRead::Text("A\u{1e}\u{1e}B".to_string()),
        ]);
        let mut connection = open(socket, FixedClock::new(1))?;
        assert_eq!(connection.receive()?, vec!["A".to_string(), "B".to_string()]);
        Ok(())
    }

    #[test]
    fn empty_message_is_fatal() -> anyhow::Result<()> {
        let socket = ScriptedSocket::new(vec![
            SocketRead::Text("{}\u{1e}".to_string()),
            SocketRead::Text(String::new()),
        ]);
        let mut connection = open(socket, FixedClock::new(1))?;
        assert!(matches!(
            connection.receive(),
            Err(SydneyError::Transport(TransportError::EmptyResponse))
        ));
        Ok(())
    }

    #[test]
    fn normal_close_hints_at_context_length() -> anyhow::Result<()> {
        let socket = ScriptedSocket::new(vec![
            SocketRead::Text("{}\u{1e}".to_string()),
            SocketRead::Closed {
                code: 1000,
                reason: String::new(),
            },
        ]);
        let mut connection = open(socket, FixedClock::new(1))?;
        let err = connection.receive().err();
        assert!(matches!(
            err,
            Some(SydneyError::Transport(TransportError::Closed {
                code: 1000,
                context_hint: Some(NORMAL_CLOSE_HINT),
                ..
            }))
        ));
        Ok(())
    }

    #[test]
    fn idle_past_read_timeout_is_unresponsive() -> anyhow::Result<()> {
        let socket = ScriptedSocket::new(vec![SocketRead::Text("{}\u{1e}".to_string())]);
        let dialer = ScriptedDialer::new(socket);
        let timeouts = TransportTimeouts {
            read: Duration::from_millis(40),
            poll_slice: Duration::from_millis(10),
            ..TransportTimeouts::default()
        };
        let mut connection = Connection::open(
            &dialer,
            &session(),
            &Conversation::default(),
            Arc::new(FixedClock::new(1)),
            timeouts,
            CancelSignal::new(),
        )?;
        assert!(matches!(
            connection.receive(),
            Err(SydneyError::Transport(TransportError::ServerUnresponsive))
        ));
        Ok(())
    }

    #[test]
    fn rejected_upgrade_is_a_handshake_failure() -> anyhow::Result<()> {
        let response = tungstenite::http::Response::builder()
            .status(403)
            .body(None)?;
        let err = handshake_failure(tungstenite::Error::Http(Box::new(response)));
        assert!(
            matches!(&err, TransportError::HandshakeFailed(detail) if detail.contains("403")),
            "{err}"
        );
        assert!(matches!(
            handshake_failure(tungstenite::Error::AlreadyClosed),
            TransportError::HandshakeFailed(_)
        ));
        Ok(())
    }

    #[test]
    fn write_timeout_is_a_send_timeout() {
        for kind in [ErrorKind::TimedOut, ErrorKind::WouldBlock] {
            let err = send_failure(tungstenite::Error::Io(io::Error::from(kind)));
            assert!(matches!(
                err,
                SydneyError::Transport(TransportError::SendTimeout)
            ));
        }
        let reset = send_failure(tungstenite::Error::Io(io::Error::from(
            ErrorKind::ConnectionReset,
        )));
        assert!(matches!(reset, SydneyError::Transport(TransportError::Io(_))));
        assert!(matches!(
            send_failure(tungstenite::Error::AlreadyClosed),
            SydneyError::Transport(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn read_outcomes_map_to_socket_reads() -> anyhow::Result<()> {
        assert_eq!(
            read_outcome(Ok(WsMessage::Text("hi".into())))?,
            SocketRead::Text("hi".to_string())
        );
        assert_eq!(
            read_outcome(Ok(WsMessage::Binary(tungstenite::Bytes::new())))?,
            SocketRead::Other
        );
        assert_eq!(
            read_outcome(Ok(WsMessage::Close(None)))?,
            SocketRead::Closed {
                code: 1005,
                reason: String::new()
            }
        );
        assert_eq!(
            read_outcome(Err(tungstenite::Error::Io(io::Error::from(
                ErrorKind::TimedOut
            ))))?,
            SocketRead::Idle
        );
        assert_eq!(
            read_outcome(Err(tungstenite::Error::ConnectionClosed))?,
            SocketRead::Closed {
                code: NORMAL_CLOSURE,
                reason: String::new()
            }
        );
        assert!(matches!(
            read_outcome(Err(tungstenite::Error::Io(io::Error::from(
                ErrorKind::BrokenPipe
            )))),
            Err(SydneyError::Transport(TransportError::Io(_)))
        ));
        Ok(())
    }

    #[test]
    fn cancellation_stops_reads() -> anyhow::Result<()> {
        let socket = ScriptedSocket::new(vec![
            SocketRead::Text("{}\u{1e}".to_string()),
            SocketRead::Text("A".to_string()),
        ]);
        let closed = socket.closed_flag();
        let cancel = CancelSignal::new();
        let mut connection = Connection::open(
            &ScriptedDialer::new(socket),
            &session(),
            &Conversation::default(),
            Arc::new(FixedClock::new(1)),
            TransportTimeouts::default(),
            cancel.clone(),
        )?;
        cancel.cancel();
        assert!(matches!(connection.receive(), Err(SydneyError::Cancelled)));
        drop(connection);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        Ok(())
    }
}
