//! Blocking HTTP seam. Everything the engine sends over plain HTTP goes
//! through `HttpTransport`, so tests can script the upstream.

use std::time::Duration;

use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::Client as HttpClient;
use reqwest::redirect::Policy as RedirectPolicy;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sydney_contracts::session::{header_value, HeaderList};

use crate::error::{truncate_text, Result, SydneyError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    Empty,
    Json(Value),
    /// Text-only multipart form fields, in order.
    Multipart(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HeaderList,
    pub body: HttpBody,
    pub timeout: Option<Duration>,
    pub follow_redirects: bool,
}

impl HttpRequest {
    fn new(method: HttpMethod, url: impl Into<String>, body: HttpBody) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderList::new(),
            body,
            timeout: None,
            follow_redirects: true,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url, HttpBody::Empty)
    }

    pub fn post_json(url: impl Into<String>, payload: Value) -> Self {
        Self::new(HttpMethod::Post, url, HttpBody::Json(payload))
    }

    pub fn post_multipart(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self::new(HttpMethod::Post, url, HttpBody::Multipart(fields))
    }

    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: HeaderList,
    pub body: String,
}

impl HttpReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: HeaderList::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Every value of a repeated header, such as `set-cookie`.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Decode the body, failing on a non-2xx status first.
    pub fn json_or_error<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        if !self.is_success() {
            return Err(SydneyError::Http(format!(
                "{what} request failed ({}): {}",
                self.status,
                truncate_text(&self.body, 512)
            )));
        }
        serde_json::from_str(&self.body)
            .map_err(|err| SydneyError::http(&format!("{what} returned invalid JSON payload"), err))
    }
}

pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: HttpRequest) -> Result<HttpReply>;

    fn get(&self, url: &str, headers: HeaderList) -> Result<HttpReply> {
        self.execute(HttpRequest::get(url).with_headers(headers))
    }

    fn post_json(&self, url: &str, headers: HeaderList, payload: Value) -> Result<HttpReply> {
        self.execute(HttpRequest::post_json(url, payload).with_headers(headers))
    }

    fn post_multipart(
        &self,
        url: &str,
        headers: HeaderList,
        fields: Vec<(String, String)>,
    ) -> Result<HttpReply> {
        self.execute(HttpRequest::post_multipart(url, fields).with_headers(headers))
    }
}

/// reqwest-backed transport with an optional proxy. Keeps a second client
/// that does not follow redirects, for endpoints whose answer is a
/// `Location` header.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    follow: HttpClient,
    manual: HttpClient,
}

impl ReqwestTransport {
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        Ok(Self {
            follow: build_client(proxy, RedirectPolicy::default())?,
            manual: build_client(proxy, RedirectPolicy::none())?,
        })
    }
}

fn build_client(proxy: Option<&str>, redirect: RedirectPolicy) -> Result<HttpClient> {
    let mut builder = HttpClient::builder()
        .redirect(redirect)
        .timeout(DEFAULT_TIMEOUT);
    if let Some(proxy) = proxy.map(str::trim).filter(|proxy| !proxy.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|err| SydneyError::Config(format!("invalid proxy {proxy}: {err}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| SydneyError::http("http client build failed", err))
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: HttpRequest) -> Result<HttpReply> {
        let client = if request.follow_redirects {
            &self.follow
        } else {
            &self.manual
        };
        let mut builder = match request.method {
            HttpMethod::Get => client.get(&request.url),
            HttpMethod::Post => client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            HttpBody::Empty => builder,
            HttpBody::Json(payload) => builder.json(&payload),
            HttpBody::Multipart(fields) => {
                let form = fields
                    .into_iter()
                    .fold(MultipartForm::new(), |form, (name, value)| form.text(name, value));
                builder.multipart(form)
            }
        };

        let response = builder
            .send()
            .map_err(|err| SydneyError::http(&format!("request to {} failed", request.url), err))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .text()
            .map_err(|err| SydneyError::http("response body read failed", err))?;
        Ok(HttpReply {
            status,
            headers,
            body,
        })
    }
}
