use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use sydney_contracts::session::{HeaderList, SessionContext, SEARCH_REFERER};

use crate::error::{Result, SydneyError};
use crate::http::{HttpRequest, HttpTransport};

const ACCOUNT_TIMEOUT: Duration = Duration::from_secs(15);
const ACCOUNT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36 Edg/114.0.1788.0";

/// Display name of the account the session cookies belong to.
pub fn fetch_user_name(http: &dyn HttpTransport, session: &SessionContext) -> Result<String> {
    let cookie = session.cookies.header();
    if cookie.is_empty() {
        return Err(SydneyError::Config("no cookies loaded".to_string()));
    }
    let headers: HeaderList = vec![
        ("user-agent".to_string(), ACCOUNT_USER_AGENT.to_string()),
        ("cookie".to_string(), cookie),
    ];
    let reply = http.execute(
        HttpRequest::get(SEARCH_REFERER)
            .with_headers(headers)
            .with_timeout(ACCOUNT_TIMEOUT),
    )?;
    if reply.status != 200 {
        return Err(SydneyError::Http(format!(
            "http status code is not 200: {}",
            reply.status
        )));
    }
    extract_user_name(&reply.body).ok_or_else(|| {
        SydneyError::Other(
            "cannot identify current user, please check if cookie is expired".to_string(),
        )
    })
}

static USER_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"data-clarity-mask="true" title="(.*?)""#).ok());

fn extract_user_name(body: &str) -> Option<String> {
    USER_NAME
        .as_ref()?
        .captures(body)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().to_string())
}
