//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::clock::{Clock, Sleeper};
use crate::error::{Result, SydneyError, TransportError};
use crate::http::{HttpReply, HttpRequest, HttpTransport};
use crate::transport::{DialRequest, DialedSocket, FrameSocket, SocketRead, WsDialer};

#[derive(Debug)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, item: T) {
        if let Ok(mut items) = self.items.lock() {
            items.push(item);
        }
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }
}

pub struct ScriptedSocket {
    script: VecDeque<SocketRead>,
    sent: Recorder<String>,
    closed: Arc<AtomicBool>,
    /// Sends past this many time out.
    send_limit: Option<usize>,
}

impl ScriptedSocket {
    pub fn new(script: Vec<SocketRead>) -> Self {
        Self {
            script: script.into(),
            sent: Recorder::default(),
            closed: Arc::new(AtomicBool::new(false)),
            send_limit: None,
        }
    }

    /// Physical text messages, with the negotiation ack prepended.
    pub fn with_messages(messages: &[&str]) -> Self {
        let mut script = vec![SocketRead::Text("{}\u{1e}".to_string())];
        script.extend(
            messages
                .iter()
                .map(|message| SocketRead::Text(message.to_string())),
        );
        Self::new(script)
    }

    pub fn with_send_timeout_after(mut self, sends: usize) -> Self {
        self.send_limit = Some(sends);
        self
    }

    pub fn sent(&self) -> Recorder<String> {
        self.sent.clone()
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl FrameSocket for ScriptedSocket {
    fn send_text(&mut self, text: &str, _timeout: Duration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol("socket closed".to_string()).into());
        }
        if self
            .send_limit
            .is_some_and(|limit| self.sent.snapshot().len() >= limit)
        {
            return Err(TransportError::SendTimeout.into());
        }
        self.sent.push(text.to_string());
        Ok(())
    }

    fn receive(&mut self, _wait: Duration) -> Result<SocketRead> {
        Ok(self.script.pop_front().unwrap_or(SocketRead::Idle))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct ScriptedDialer {
    sockets: Mutex<VecDeque<ScriptedSocket>>,
    set_cookies: Vec<String>,
    requests: Recorder<DialRequest>,
}

impl ScriptedDialer {
    pub fn new(socket: ScriptedSocket) -> Self {
        Self::sequence(vec![socket])
    }

    pub fn sequence(sockets: Vec<ScriptedSocket>) -> Self {
        Self {
            sockets: Mutex::new(sockets.into()),
            set_cookies: Vec::new(),
            requests: Recorder::default(),
        }
    }

    pub fn with_set_cookies(mut self, cookies: &[&str]) -> Self {
        self.set_cookies = cookies.iter().map(|cookie| cookie.to_string()).collect();
        self
    }

    pub fn requests(&self) -> Recorder<DialRequest> {
        self.requests.clone()
    }
}

impl WsDialer for ScriptedDialer {
    fn dial(&self, request: &DialRequest) -> Result<DialedSocket> {
        self.requests.push(request.clone());
        let socket = self
            .sockets
            .lock()
            .ok()
            .and_then(|mut sockets| sockets.pop_front())
            .ok_or_else(|| TransportError::HandshakeFailed("no scripted socket".to_string()))?;
        Ok(DialedSocket {
            socket: Box::new(socket),
            set_cookies: self.set_cookies.clone(),
        })
    }
}

/// Replies routed by URL substring. A route replays its replies in order and
/// then keeps repeating the last one.
#[derive(Default)]
pub struct ScriptedHttp {
    routes: Mutex<Vec<(String, VecDeque<std::result::Result<HttpReply, String>>)>>,
    requests: Recorder<HttpRequest>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, needle: &str, replies: Vec<HttpReply>) -> Self {
        self.route_results(needle, replies.into_iter().map(Ok).collect())
    }

    pub fn route_results(
        self,
        needle: &str,
        replies: Vec<std::result::Result<HttpReply, String>>,
    ) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.push((needle.to_string(), replies.into()));
        }
        self
    }

    pub fn requests(&self) -> Recorder<HttpRequest> {
        self.requests.clone()
    }
}

impl HttpTransport for ScriptedHttp {
    fn execute(&self, request: HttpRequest) -> Result<HttpReply> {
        self.requests.push(request.clone());
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| SydneyError::Other("scripted http poisoned".to_string()))?;
        let Some((_, replies)) = routes
            .iter_mut()
            .find(|(needle, _)| request.url.contains(needle.as_str()))
        else {
            return Err(SydneyError::Http(format!("unscripted url {}", request.url)));
        };
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        match reply {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(SydneyError::Http(message)),
            None => Err(SydneyError::Http(format!("no reply for {}", request.url))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    seconds: Arc<AtomicU64>,
}

impl FixedClock {
    pub fn new(seconds: u64) -> Self {
        Self {
            seconds: Arc::new(AtomicU64::new(seconds)),
        }
    }

    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn unix_seconds(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    sleeps: Recorder<Duration>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.snapshot()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelSignal) -> Result<()> {
        cancel.check()?;
        self.sleeps.push(duration);
        Ok(())
    }
}
