//! Streaming client for the Bing Chat ("Sydney") conversation protocol.
//!
//! A turn provisions a conversation, opens the chat hub websocket, sends one
//! request and classifies the frames that come back into `StreamEvent`s. Each
//! turn runs on its own worker thread; the caller reads events from a
//! `TurnStream` and may cancel it at any time.

pub mod account;
pub mod cancel;
pub mod challenge;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod media;
pub mod provision;
pub mod request;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod testing;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use sydney_contracts::cookies::{CookieJar, CookieMap, CookieStore};
use sydney_contracts::events::{
    GeneratedImages, GeneratedMusic, GenerativeImage, GenerativeMusic, StreamErrorKind,
    StreamEvent,
};
use sydney_contracts::random::{RandomSource, ThreadRandom};
use sydney_contracts::session::{ConversationStyle, SessionContext};
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::challenge::{
    BrowserChallenge, BypassChallenge, ChallengeRequest, ChallengeResolver, ChallengeStrategy,
    ChromeLauncher,
};
use crate::classifier::StreamClassifier;
use crate::clock::{Clock, Sleeper, SystemClock, ThreadSleeper};
use crate::config::ClientConfig;
use crate::error::{Result, SydneyError};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::media::MediaPoller;
use crate::request::{build_request, encode_request, OutboundTurn};
use crate::transport::{Connection, TransportTimeouts, TungsteniteDialer, WsDialer};

pub use crate::error::TransportError;

const CAPTCHA_VALUE: &str = "CaptchaChallenge";

/// One user prompt and the per-turn overrides that go with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnRequest {
    pub prompt: String,
    /// Earlier conversation text, sent as a synthetic web-page context.
    pub prior_context: String,
    pub image_url: Option<String>,
    pub style: Option<ConversationStyle>,
    pub locale: Option<String>,
    pub no_search: Option<bool>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// The pluggable pieces a client talks through.
pub struct Collaborators {
    pub http: Arc<dyn HttpTransport>,
    pub dialer: Arc<dyn WsDialer>,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub random: Box<dyn RandomSource>,
    pub cookie_store: Arc<dyn CookieStore>,
    pub challenge: Option<Arc<dyn ChallengeResolver>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub timeouts: TransportTimeouts,
    pub max_challenge_retries: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeouts: TransportTimeouts::default(),
            max_challenge_retries: 1,
        }
    }
}

#[derive(Clone)]
pub struct SydneyClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    session: SessionContext,
    http: Arc<dyn HttpTransport>,
    dialer: Arc<dyn WsDialer>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    random: Mutex<Box<dyn RandomSource>>,
    cookie_store: Arc<dyn CookieStore>,
    challenge: Option<Arc<dyn ChallengeResolver>>,
    options: ClientOptions,
}

enum TurnOutcome {
    Finished,
    Captcha {
        conversation_id: String,
        message_id: String,
        message: String,
    },
}

impl SydneyClient {
    pub fn new(session: SessionContext, collaborators: Collaborators, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session,
                http: collaborators.http,
                dialer: collaborators.dialer,
                clock: collaborators.clock,
                sleeper: collaborators.sleeper,
                random: Mutex::new(collaborators.random),
                cookie_store: collaborators.cookie_store,
                challenge: collaborators.challenge,
                options,
            }),
        }
    }

    /// Production client: reqwest and tungstenite transports, the cookie file
    /// from `config`, and the configured challenge strategy.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut random = ThreadRandom::new();
        let store = Arc::new(config.cookie_store());
        let cookies = CookieJar::new(config.initial_cookies(store.as_ref())?);
        let session = SessionContext::new(config.session_settings()?, cookies, &mut random);
        let http: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(config.session.proxy.as_deref())?);
        let challenge: Arc<dyn ChallengeResolver> = match config.challenge {
            ChallengeStrategy::Browser => Arc::new(BrowserChallenge::new(Box::new(
                ChromeLauncher::new(config.browser.clone()),
            ))),
            ChallengeStrategy::Bypass => Arc::new(BypassChallenge::new(
                config.bypass_server.clone().unwrap_or_default(),
                Arc::clone(&http),
            )),
        };
        let collaborators = Collaborators {
            http,
            dialer: Arc::new(TungsteniteDialer),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
            random: Box::new(random),
            cookie_store: store,
            challenge: Some(challenge),
        };
        let options = ClientOptions {
            max_challenge_retries: config.max_challenge_retries,
            ..ClientOptions::default()
        };
        Ok(Self::new(session, collaborators, options))
    }

    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    pub fn cookies(&self) -> CookieMap {
        self.inner.session.cookies.snapshot()
    }

    /// Start a turn on a worker thread. Events arrive in order on the
    /// returned stream; the stream ends after a terminal frame or an `Error`
    /// event.
    pub fn ask_stream(&self, request: TurnRequest, cancel: CancelSignal) -> TurnStream {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let worker_cancel = cancel.clone();
        let worker_tx = tx.clone();
        let spawned = thread::Builder::new()
            .name("sydney-turn".to_string())
            .spawn(move || inner.run_turn(&request, &worker_cancel, &worker_tx));
        if let Err(err) = spawned {
            let _ = tx.send(StreamEvent::Error(StreamErrorKind::Other(format!(
                "cannot start turn worker: {err}"
            ))));
        }
        TurnStream { rx, cancel }
    }

    pub fn fetch_user_name(&self) -> Result<String> {
        account::fetch_user_name(self.inner.http.as_ref(), &self.inner.session)
    }

    pub fn upload_image(&self, bytes: &[u8]) -> Result<String> {
        upload::upload_image(self.inner.http.as_ref(), &self.inner.session, bytes)
    }

    pub fn generate_images(
        &self,
        trigger: &GenerativeImage,
        cancel: &CancelSignal,
    ) -> Result<GeneratedImages> {
        self.inner
            .poller()
            .poll_images(&self.inner.session, trigger, cancel)
    }

    pub fn generate_music(
        &self,
        trigger: &GenerativeMusic,
        cancel: &CancelSignal,
    ) -> Result<GeneratedMusic> {
        let mut random = self.inner.fork_random();
        self.inner
            .poller()
            .poll_music(&self.inner.session, trigger, &mut *random, cancel)
    }

    /// Run the configured challenge strategy outside of a turn.
    pub fn resolve_challenge(&self, cancel: &CancelSignal) -> Result<usize> {
        let message_id = self.inner.random().uuid().to_string();
        self.inner
            .resolve_challenge(&self.inner.session, "", &message_id, cancel)
    }

    pub fn save_cookies(&self) -> Result<()> {
        self.inner
            .cookie_store
            .save(&self.inner.session.cookies.snapshot())
            .map_err(|err| SydneyError::Other(format!("cannot save cookies: {err:#}")))
    }
}

impl ClientInner {
    fn random(&self) -> MutexGuard<'_, Box<dyn RandomSource>> {
        self.random
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A private source for long blocking work; the shared lock is released
    /// before this returns.
    fn fork_random(&self) -> Box<dyn RandomSource> {
        self.random().fork()
    }

    fn poller(&self) -> MediaPoller {
        MediaPoller::new(Arc::clone(&self.http), Arc::clone(&self.sleeper))
    }

    fn persist_cookies(&self, session: &SessionContext) {
        if let Err(err) = self.cookie_store.save(&session.cookies.snapshot()) {
            warn!(error = %err, "cannot save cookies");
        }
    }

    fn run_turn(&self, request: &TurnRequest, cancel: &CancelSignal, tx: &Sender<StreamEvent>) {
        let session = self.session.with_overrides(
            request.style,
            request.locale.as_deref(),
            request.no_search,
        );
        let mut challenges = 0;
        loop {
            let captcha = match self.run_attempt(&session, request, cancel, tx) {
                Ok(TurnOutcome::Finished) => return,
                Ok(TurnOutcome::Captcha {
                    conversation_id,
                    message_id,
                    message,
                }) => (conversation_id, message_id, message),
                Err(SydneyError::ProvisionRejected { value, message }) if value == CAPTCHA_VALUE => {
                    let message_id = self.random().uuid().to_string();
                    (String::new(), message_id, message)
                }
                Err(err) => {
                    debug!(error = %err, "turn failed");
                    let _ = tx.send(StreamEvent::Error(err.to_stream_kind()));
                    return;
                }
            };
            let (conversation_id, message_id, message) = captcha;
            if challenges >= self.options.max_challenge_retries {
                let _ = tx.send(StreamEvent::Error(StreamErrorKind::Rejected {
                    value: CAPTCHA_VALUE.to_string(),
                    message,
                }));
                return;
            }
            challenges += 1;
            if tx.send(StreamEvent::SolvingCaptcha(message)).is_err() {
                return;
            }
            if let Err(err) =
                self.resolve_challenge(&session, &conversation_id, &message_id, cancel)
            {
                warn!(error = %err, "captcha resolution failed");
                let _ = tx.send(StreamEvent::Error(err.to_stream_kind()));
                return;
            }
        }
    }

    fn run_attempt(
        &self,
        session: &SessionContext,
        request: &TurnRequest,
        cancel: &CancelSignal,
        tx: &Sender<StreamEvent>,
    ) -> Result<TurnOutcome> {
        cancel.check()?;
        let conversation = provision::provision(self.http.as_ref(), session)?;
        self.persist_cookies(session);

        let mut connection = Connection::open(
            self.dialer.as_ref(),
            session,
            &conversation,
            Arc::clone(&self.clock),
            self.options.timeouts,
            cancel.clone(),
        )?;
        let (turn, payload) = {
            let mut random = self.random();
            let turn = OutboundTurn::new(
                request.prompt.as_str(),
                request.prior_context.as_str(),
                request.image_url.clone(),
                &mut **random,
            );
            let payload = build_request(session, &conversation, &turn, &mut **random);
            (turn, payload)
        };
        connection.send(&encode_request(&payload)?)?;

        let mut classifier = StreamClassifier::new();
        loop {
            let frames = connection.receive()?;
            for frame in frames {
                cancel.check()?;
                for event in classifier.feed(&frame) {
                    if let StreamEvent::Error(kind @ StreamErrorKind::Rejected { message, .. }) =
                        &event
                    {
                        if kind.is_captcha() {
                            connection.close();
                            return Ok(TurnOutcome::Captcha {
                                conversation_id: conversation.conversation_id.clone(),
                                message_id: turn.request_id.clone(),
                                message: message.clone(),
                            });
                        }
                    }
                    if tx.send(event).is_err() {
                        debug!("turn stream dropped");
                        connection.close();
                        return Ok(TurnOutcome::Finished);
                    }
                }
                if classifier.is_finished() {
                    connection.close();
                    return Ok(TurnOutcome::Finished);
                }
            }
        }
    }

    /// Solve a challenge, merge the cookie diff into the shared jar and
    /// persist it. Returns how many cookies changed.
    fn resolve_challenge(
        &self,
        session: &SessionContext,
        conversation_id: &str,
        message_id: &str,
        cancel: &CancelSignal,
    ) -> Result<usize> {
        let resolver = self
            .challenge
            .as_ref()
            .ok_or_else(|| SydneyError::Config("no challenge strategy configured".to_string()))?;
        let request = ChallengeRequest {
            session,
            conversation_id,
            message_id,
        };
        let mut random = self.fork_random();
        let diff = resolver.resolve(&request, &mut *random, cancel)?;
        let changed = session.cookies.merge(&diff);
        self.persist_cookies(session);
        info!(strategy = resolver.name(), changed, "captcha resolved");
        Ok(changed)
    }
}

/// Live events of one turn. Dropping the stream cancels the turn.
pub struct TurnStream {
    rx: Receiver<StreamEvent>,
    cancel: CancelSignal,
}

impl TurnStream {
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Iterator for TurnStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
