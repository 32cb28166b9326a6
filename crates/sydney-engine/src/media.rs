//! Polling the image and music creators after the assistant triggers them.
//!
//! Both pollers block for up to `attempts * interval`; sleeps go through the
//! injected `Sleeper` so callers can cancel them.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use sydney_contracts::events::{GeneratedImages, GeneratedMusic, GenerativeImage, GenerativeMusic};
use sydney_contracts::random::RandomSource;
use sydney_contracts::session::{set_header, HeaderList, SessionContext};
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::clock::Sleeper;
use crate::error::{truncate_text, Result, SydneyError};
use crate::http::{HttpRequest, HttpTransport};

pub const DEFAULT_ATTEMPTS: u32 = 15;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const IMAGE_RESULTS_URL: &str = "https://www.bing.com/images/create/async/results/";
const MUSIC_PAGE_URL: &str = "https://www.bing.com/videos/music";
const MUSIC_API_URL: &str = "https://www.bing.com/videos/api/custom/music";
const MUSIC_REFERER: &str = "https://www.bing.com/search?q=Bing+AI&showconv=1&wlexpsignin=1";
const THUMBNAIL_URL: &str = "https://th.bing.com/th?&id=";
const IMAGE_REJECTIONS: &[&str] = &["please try again", "has been blocked"];

/// Inner payload of a music poll, itself JSON-encoded inside `RawResponse`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MusicStatus {
    id: String,
    status: String,
    error_message: String,
    gpt_prompt: String,
    lyrics: String,
    audio_key: String,
    image_key: String,
    video_key: String,
    duration: f64,
    musical_style: String,
}

#[derive(Debug, Deserialize)]
struct MusicEnvelope {
    #[serde(rename = "RawResponse", default)]
    raw_response: String,
}

pub struct MediaPoller {
    http: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    attempts: u32,
    interval: Duration,
}

impl MediaPoller {
    pub fn new(http: Arc<dyn HttpTransport>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            http,
            sleeper,
            attempts: DEFAULT_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_cadence(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }

    /// Run `attempt` until it yields a value, sleeping between tries.
    fn poll<T>(
        &self,
        cancel: &CancelSignal,
        mut attempt: impl FnMut(u32) -> Result<Option<T>>,
    ) -> Result<T> {
        for index in 0..self.attempts {
            if index > 0 {
                self.sleeper.sleep(self.interval, cancel)?;
            }
            cancel.check()?;
            if let Some(value) = attempt(index + 1)? {
                return Ok(value);
            }
        }
        Err(SydneyError::GenerationTimeout {
            attempts: self.attempts,
        })
    }

    pub fn poll_images(
        &self,
        session: &SessionContext,
        trigger: &GenerativeImage,
        cancel: &CancelSignal,
    ) -> Result<GeneratedImages> {
        let started = Instant::now();
        let headers = session.image_headers();
        let reply = self.http.execute(
            HttpRequest::get(&trigger.url)
                .with_headers(headers.clone())
                .with_timeout(REQUEST_TIMEOUT)
                .without_redirects(),
        )?;
        check_image_rejection(&reply.body)?;
        let result_id = image_result_id(&reply.body)
            .or_else(|| reply.header("location").and_then(image_result_id))
            .ok_or_else(|| SydneyError::Http("cannot find image creation result".to_string()))?;

        let results_url = reqwest::Url::parse_with_params(
            &format!("{IMAGE_RESULTS_URL}{result_id}"),
            &[
                ("q", trigger.text.as_str()),
                ("partner", "sydney"),
                ("showselective", "1"),
                ("IID", "images.as"),
            ],
        )
        .map_err(|err| SydneyError::http("invalid image result url", err))?
        .to_string();
        info!(url = results_url.as_str(), "image result url");

        let image_urls = self.poll(cancel, |attempt| {
            let reply = self.http.execute(
                HttpRequest::get(&results_url)
                    .with_headers(headers.clone())
                    .with_timeout(REQUEST_TIMEOUT),
            )?;
            check_image_rejection(&reply.body)?;
            let urls = image_urls(&reply.body);
            if urls.is_empty() {
                debug!(attempt, "no images yet");
                return Ok(None);
            }
            Ok(Some(urls))
        })?;
        Ok(GeneratedImages {
            trigger: trigger.clone(),
            image_urls,
            duration_ms: elapsed_ms(started),
        })
    }

    pub fn poll_music(
        &self,
        session: &SessionContext,
        trigger: &GenerativeMusic,
        random: &mut dyn RandomSource,
        cancel: &CancelSignal,
    ) -> Result<GeneratedMusic> {
        let started = Instant::now();
        let mut headers = session.image_headers();
        set_header(&mut headers, "referer", MUSIC_REFERER);

        let page_url = reqwest::Url::parse_with_params(
            MUSIC_PAGE_URL,
            &[
                ("vdpp", "suno"),
                ("kseed", "8000"),
                ("SFX", "3"),
                ("q", ""),
                ("iframeid", trigger.iframe_id.as_str()),
                ("requestid", trigger.request_id.as_str()),
            ],
        )
        .map_err(|err| SydneyError::http("invalid music page url", err))?
        .to_string();
        let reply = self.http.execute(
            HttpRequest::get(&page_url)
                .with_headers(headers.clone())
                .with_timeout(REQUEST_TIMEOUT),
        )?;
        if !reply.is_success() {
            return Err(SydneyError::Http(format!(
                "videos/music status: {}",
                reply.status
            )));
        }
        let skey = music_skey(&reply.body)
            .ok_or_else(|| SydneyError::Http("cannot find music creation skey".to_string()))?;

        let ig = random.hex(16).to_uppercase();
        let api_url = reqwest::Url::parse_with_params(
            MUSIC_API_URL,
            &[
                ("skey", skey.as_str()),
                ("safesearch", "Moderate"),
                ("vdpp", "suno"),
                ("requestid", trigger.request_id.as_str()),
                ("ig", ig.as_str()),
                ("iid", "vsn"),
                ("sfx", "1"),
            ],
        )
        .map_err(|err| SydneyError::http("invalid music api url", err))?
        .to_string();
        info!(url = api_url.as_str(), "music result url");
        let mut poll_headers: HeaderList = headers;
        set_header(&mut poll_headers, "referer", page_url.as_str());

        let status = self.poll(cancel, |attempt| {
            let reply = self.http.execute(
                HttpRequest::get(&api_url)
                    .with_headers(poll_headers.clone())
                    .with_timeout(REQUEST_TIMEOUT),
            )?;
            let status = decode_music_status(&reply.body)?;
            match status.status.as_str() {
                "running" => {
                    debug!(attempt, "music creation is running");
                    Ok(None)
                }
                "complete" => Ok(Some(status)),
                _ => {
                    warn!(id = status.id.as_str(), status = status.status.as_str(), "music creation failed");
                    Err(SydneyError::GenerationRejected(format!(
                        "music creation failed: {}",
                        status.error_message
                    )))
                }
            }
        })?;

        Ok(GeneratedMusic {
            iframe_id: trigger.iframe_id.clone(),
            request_id: trigger.request_id.clone(),
            cover_img_url: format!("{THUMBNAIL_URL}{}", status.image_key),
            music_url: format!("{THUMBNAIL_URL}{}", status.audio_key),
            video_url: format!("{THUMBNAIL_URL}{}", status.video_key),
            duration_secs: status.duration,
            musical_style: status.musical_style,
            title: status.gpt_prompt,
            lyrics: status.lyrics,
            elapsed_ms: elapsed_ms(started),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn check_image_rejection(body: &str) -> Result<()> {
    let lowered = body.to_lowercase();
    match IMAGE_REJECTIONS.iter().find(|marker| lowered.contains(*marker)) {
        Some(marker) => Err(SydneyError::GenerationRejected(format!(
            "image creator answered \"{marker}\""
        ))),
        None => Ok(()),
    }
}

static IMAGE_RESULT_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/images/create/async/results/(.*?)\?").ok());
static IMAGE_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<img class="mimg".*?src="(.*?)""#).ok());
static MUSIC_SKEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"skey=(.*?)&amp;").ok());

fn image_result_id(text: &str) -> Option<String> {
    IMAGE_RESULT_ID
        .as_ref()?
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

fn image_urls(body: &str) -> Vec<String> {
    let Some(pattern) = IMAGE_URL.as_ref() else {
        return Vec::new();
    };
    pattern
        .captures_iter(body)
        .filter_map(|captures| captures.get(1))
        .map(|url| url.as_str().to_string())
        .collect()
}

fn music_skey(body: &str) -> Option<String> {
    MUSIC_SKEY
        .as_ref()?
        .captures(body)
        .and_then(|captures| captures.get(1))
        .map(|skey| skey.as_str().to_string())
}

fn decode_music_status(body: &str) -> Result<MusicStatus> {
    let envelope: MusicEnvelope = serde_json::from_str(body).map_err(|err| {
        SydneyError::http(
            &format!("cannot decode music response {}", truncate_text(body, 128)),
            err,
        )
    })?;
    serde_json::from_str(&envelope.raw_response)
        .map_err(|err| SydneyError::http("cannot decode inner music response", err))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sydney_contracts::cookies::CookieJar;
    use sydney_contracts::random::SequenceRandom;
    use sydney_contracts::session::SessionSettings;

    use super::*;
    use crate::http::HttpReply;
    use crate::testing::{RecordingSleeper, ScriptedHttp};

    fn session() -> SessionContext {
        SessionContext::new(
            SessionSettings::default(),
            CookieJar::from_header("_U=abc"),
            &mut SequenceRandom::new(vec![0], 2),
        )
    }

    fn trigger() -> GenerativeImage {
        GenerativeImage {
            text: "a red fox".to_string(),
            url: "https://www.bing.com/images/create?q=a+red+fox&iframeid=m-1".to_string(),
        }
    }

    const CREATE_PAGE: &str =
        r#"<div data-c="/images/create/async/results/1-abc?q=a+red+fox&amp;IG=1"></div>"#;

    fn music_reply(status: serde_json::Value) -> HttpReply {
        HttpReply::ok(json!({ "RawResponse": status.to_string() }).to_string())
    }

    #[test]
    fn images_after_four_misses_sleep_four_times() -> anyhow::Result<()> {
        let miss = HttpReply::ok("<div>still working</div>");
        let hit = HttpReply::ok(
            r#"<img class="mimg" alt="" src="https://th.bing.com/1.jpg"/><img class="mimg" src="https://th.bing.com/2.jpg"/>"#,
        );
        let http = ScriptedHttp::new()
            .route("images/create?", vec![HttpReply::ok(CREATE_PAGE)])
            .route(
                "async/results/1-abc",
                vec![miss.clone(), miss.clone(), miss.clone(), miss, hit],
            );
        let requests = http.requests();
        let sleeper = RecordingSleeper::default();
        let poller = MediaPoller::new(Arc::new(http), Arc::new(sleeper.clone()));

        let result = poller.poll_images(&session(), &trigger(), &CancelSignal::new())?;
        assert_eq!(
            result.image_urls,
            vec![
                "https://th.bing.com/1.jpg".to_string(),
                "https://th.bing.com/2.jpg".to_string()
            ]
        );
        assert_eq!(result.trigger, trigger());
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(3); 4]);

        let requests = requests.snapshot();
        assert_eq!(requests.len(), 6);
        assert!(!requests[0].follow_redirects);
        assert_eq!(
            requests[1].url,
            "https://www.bing.com/images/create/async/results/1-abc?q=a+red+fox&partner=sydney&showselective=1&IID=images.as"
        );
        Ok(())
    }

    #[test]
    fn image_result_id_falls_back_to_location() -> anyhow::Result<()> {
        let http = ScriptedHttp::new()
            .route(
                "images/create?",
                vec![HttpReply {
                    status: 302,
                    ..HttpReply::default()
                }
                .with_header("Location", "/images/create/async/results/9-z?q=x")],
            )
            .route(
                "async/results/9-z",
                vec![HttpReply::ok(r#"<img class="mimg" src="u"/>"#)],
            );
        let poller = MediaPoller::new(Arc::new(http), Arc::new(RecordingSleeper::default()));
        let result = poller.poll_images(&session(), &trigger(), &CancelSignal::new())?;
        assert_eq!(result.image_urls, vec!["u".to_string()]);
        Ok(())
    }

    #[test]
    fn page_patterns_are_shared_across_calls() {
        assert!(IMAGE_RESULT_ID.is_some() && IMAGE_URL.is_some() && MUSIC_SKEY.is_some());
        let page = r#"<img class="mimg" src="a"/><img class="mimg" src="b"/>"#;
        assert_eq!(image_urls(page), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(image_urls(page), image_urls(page));
        assert_eq!(music_skey("x?skey=k1&amp;y=2").as_deref(), Some("k1"));
        assert_eq!(
            image_result_id("/images/create/async/results/7-q?x").as_deref(),
            Some("7-q")
        );
    }

    #[test]
    fn image_rejection_short_circuits() {
        let http = ScriptedHttp::new()
            .route("images/create?", vec![HttpReply::ok(CREATE_PAGE)])
            .route(
                "async/results/",
                vec![HttpReply::ok("<div>Something went wrong, please try again.</div>")],
            );
        let sleeper = RecordingSleeper::default();
        let poller = MediaPoller::new(Arc::new(http), Arc::new(sleeper.clone()));
        let result = poller.poll_images(&session(), &trigger(), &CancelSignal::new());
        assert!(matches!(result, Err(SydneyError::GenerationRejected(_))));
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn images_time_out_after_all_attempts() {
        let http = ScriptedHttp::new()
            .route("images/create?", vec![HttpReply::ok(CREATE_PAGE)])
            .route("async/results/", vec![HttpReply::ok("pending")]);
        let sleeper = RecordingSleeper::default();
        let poller = MediaPoller::new(Arc::new(http), Arc::new(sleeper.clone()));
        let result = poller.poll_images(&session(), &trigger(), &CancelSignal::new());
        assert!(matches!(
            result,
            Err(SydneyError::GenerationTimeout { attempts: 15 })
        ));
        assert_eq!(sleeper.sleeps().len(), 14);
    }

    #[test]
    fn missing_result_id_is_an_error() {
        let http = ScriptedHttp::new().route("images/create?", vec![HttpReply::ok("<html/>")]);
        let poller = MediaPoller::new(Arc::new(http), Arc::new(RecordingSleeper::default()));
        let result = poller.poll_images(&session(), &trigger(), &CancelSignal::new());
        assert!(matches!(result, Err(SydneyError::Http(message)) if message.contains("cannot find")));
    }

    #[test]
    fn cancelled_poll_makes_no_attempt() {
        let http = ScriptedHttp::new()
            .route("images/create?", vec![HttpReply::ok(CREATE_PAGE)])
            .route("async/results/", vec![HttpReply::ok("pending")]);
        let cancel = CancelSignal::new();
        cancel.cancel();
        let poller = MediaPoller::new(Arc::new(http), Arc::new(RecordingSleeper::default()));
        let result = poller.poll_images(&session(), &trigger(), &cancel);
        assert!(matches!(result, Err(SydneyError::Cancelled)));
    }

    fn music_trigger() -> GenerativeMusic {
        GenerativeMusic {
            text: "a sea shanty".to_string(),
            iframe_id: "if-1".to_string(),
            request_id: "r-1".to_string(),
        }
    }

    #[test]
    fn music_completes_after_running() -> anyhow::Result<()> {
        let http = ScriptedHttp::new()
            .route(
                "videos/music?",
                vec![HttpReply::ok(r#"<a href="/x?skey=SK-1&amp;other=1">"#)],
            )
            .route(
                "api/custom/music",
                vec![
                    music_reply(json!({"status": "running"})),
                    music_reply(json!({
                        "id": "song-1",
                        "status": "complete",
                        "gptPrompt": "Shanty",
                        "lyrics": "Yo ho",
                        "audioKey": "A1",
                        "imageKey": "I1",
                        "videoKey": "V1",
                        "duration": 61.5,
                        "musicalStyle": "folk"
                    })),
                ],
            );
        let requests = http.requests();
        let sleeper = RecordingSleeper::default();
        let poller = MediaPoller::new(Arc::new(http), Arc::new(sleeper.clone()));
        let music = poller.poll_music(
            &session(),
            &music_trigger(),
            &mut SequenceRandom::new(vec![0], 0xcd),
            &CancelSignal::new(),
        )?;
        assert_eq!(music.music_url, "https://th.bing.com/th?&id=A1");
        assert_eq!(music.cover_img_url, "https://th.bing.com/th?&id=I1");
        assert_eq!(music.video_url, "https://th.bing.com/th?&id=V1");
        assert_eq!(music.title, "Shanty");
        assert_eq!(music.musical_style, "folk");
        assert_eq!(music.duration_secs, 61.5);
        assert_eq!(music.iframe_id, "if-1");
        assert_eq!(sleeper.sleeps().len(), 1);

        let requests = requests.snapshot();
        assert_eq!(
            requests[0].url,
            "https://www.bing.com/videos/music?vdpp=suno&kseed=8000&SFX=3&q=&iframeid=if-1&requestid=r-1"
        );
        assert_eq!(requests[0].header("referer"), Some(MUSIC_REFERER));
        assert!(requests[1].url.contains("skey=SK-1"));
        assert!(requests[1].url.contains(&format!("ig={}", "CD".repeat(16))));
        assert_eq!(requests[1].header("referer"), Some(requests[0].url.as_str()));
        Ok(())
    }

    #[test]
    fn music_failure_status_is_rejected() {
        let http = ScriptedHttp::new()
            .route("videos/music?", vec![HttpReply::ok("skey=S&amp;")])
            .route(
                "api/custom/music",
                vec![music_reply(json!({"status": "failed", "errorMessage": "quota"}))],
            );
        let poller = MediaPoller::new(Arc::new(http), Arc::new(RecordingSleeper::default()));
        let result = poller.poll_music(
            &session(),
            &music_trigger(),
            &mut SequenceRandom::new(vec![0], 0),
            &CancelSignal::new(),
        );
        assert!(
            matches!(result, Err(SydneyError::GenerationRejected(message)) if message == "music creation failed: quota")
        );
    }

    #[test]
    fn music_page_error_status_fails_fast() {
        let http = ScriptedHttp::new().route(
            "videos/music?",
            vec![HttpReply {
                status: 403,
                ..HttpReply::default()
            }],
        );
        let poller = MediaPoller::new(Arc::new(http), Arc::new(RecordingSleeper::default()));
        let result = poller.poll_music(
            &session(),
            &music_trigger(),
            &mut SequenceRandom::new(vec![0], 0),
            &CancelSignal::new(),
        );
        assert!(matches!(result, Err(SydneyError::Http(message)) if message == "videos/music status: 403"));
    }
}
