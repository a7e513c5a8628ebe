use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("header `{name}` not found")]
pub struct HeaderNotFound {
    pub name: String,
}

/// Ordered `(name, value)` header pairs, kept in the order they were encountered.
///
/// Names are stored title-cased (`Content-Type`), and lookups title-case the search
/// key before comparing, so `get("content-type")` finds a stored `Content-Type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a hyper header map. Repeated headers produce one pair per value.
    pub fn from_header_map(headers: &hyper::HeaderMap) -> Self {
        let pairs = headers
            .iter()
            .map(|(name, value)| {
                (
                    title_case(name.as_str()),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self(pairs)
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((title_case(name), value.into()));
    }

    pub fn get(&self, name: &str) -> Result<&str, HeaderNotFound> {
        let search_key = title_case(name);
        self.0
            .iter()
            .find(|(key, _)| *key == search_key)
            .map(|(_, value)| value.as_str())
            .ok_or(HeaderNotFound { name: search_key })
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize headers")
    }

    pub(crate) fn from_json(json: &str, field_name: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).with_context(|| format!("deserialize {field_name} headers"))
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (title_case(&name), value))
                .collect(),
        )
    }
}

/// Title-cases a header name: every letter that follows a non-letter is uppercased and
/// every other letter is lowercased (`x-request-ID` becomes `X-Request-Id`).
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut previous_is_alpha = false;
    for ch in name.chars() {
        if ch.is_alphabetic() {
            if previous_is_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_is_alpha = true;
        } else {
            out.push(ch);
            previous_is_alpha = false;
        }
    }
    out
}

/// Reference to an immutable body blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Lowercase hex SHA-256 of the blob content.
    pub key: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    RequestCaptured,
    ResponseCaptured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub started_at_unix_ms: i64,
    pub ended_at_unix_ms: Option<i64>,
    pub remote_addr: String,
    pub method: String,
    pub path: String,
    pub request_headers: HeaderList,
    pub request_body: Option<BlobRef>,
    pub status_code: Option<u16>,
    pub reason_phrase: String,
    pub response_headers: HeaderList,
    pub response_body: Option<BlobRef>,
}

impl Message {
    pub fn now_unix_ms() -> anyhow::Result<i64> {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time before unix epoch")?;
        Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn state(&self) -> MessageState {
        if self.status_code.is_some() {
            MessageState::ResponseCaptured
        } else {
            MessageState::RequestCaptured
        }
    }

    /// Undefined until the response has been captured.
    pub fn duration(&self) -> Option<Duration> {
        if self.state() != MessageState::ResponseCaptured {
            return None;
        }
        let ended_at = self.ended_at_unix_ms?;
        let elapsed_ms = ended_at.checked_sub(self.started_at_unix_ms)?;
        u64::try_from(elapsed_ms).ok().map(Duration::from_millis)
    }

    pub fn request_header(&self, name: &str) -> Result<&str, HeaderNotFound> {
        self.request_headers.get(name)
    }

    pub fn request_header_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.request_headers.get_or(name, default)
    }

    pub fn response_header(&self, name: &str) -> Result<&str, HeaderNotFound> {
        self.response_headers.get(name)
    }

    pub fn response_header_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.response_headers.get_or(name, default)
    }

    /// One-line request summary, e.g. `GET /api/users`.
    pub fn request_line(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Status line for finalized messages, e.g. `200 OK`; empty while pending.
    pub fn response_line(&self) -> String {
        match self.status_code {
            Some(status) => format!("{status} {}", self.reason_phrase)
                .trim_end()
                .to_owned(),
            None => String::new(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Request-phase fields for a message that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub started_at_unix_ms: i64,
    pub ended_at_unix_ms: i64,
    pub remote_addr: String,
    pub method: String,
    pub path: String,
    pub request_headers: HeaderList,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::header::{self, HeaderMap, HeaderValue};

    use super::{HeaderList, HeaderNotFound, Message, MessageId, MessageState, title_case};

    fn pending_message() -> Message {
        Message {
            id: MessageId(1),
            started_at_unix_ms: 1_000,
            ended_at_unix_ms: Some(1_250),
            remote_addr: "127.0.0.1".to_owned(),
            method: "POST".to_owned(),
            path: "/api/items".to_owned(),
            request_headers: [("content-type".to_owned(), "application/json".to_owned())]
                .into_iter()
                .collect(),
            request_body: None,
            status_code: None,
            reason_phrase: String::new(),
            response_headers: HeaderList::new(),
            response_body: None,
        }
    }

    #[test]
    fn title_case_matches_header_conventions() {
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("X-REQUEST-ID"), "X-Request-Id");
        assert_eq!(title_case("www-authenticate"), "Www-Authenticate");
        assert_eq!(title_case("x_forwarded_for"), "X_Forwarded_For");
        assert_eq!(title_case("etag2x"), "Etag2X");
    }

    #[test]
    fn header_lookup_is_case_insensitive_by_title_casing() {
        let message = pending_message();
        assert_eq!(message.request_header("content-type"), Ok("application/json"));
        assert_eq!(message.request_header("CONTENT-TYPE"), Ok("application/json"));
    }

    #[test]
    fn missing_header_is_an_error_unless_a_fallback_is_given() {
        let message = pending_message();
        assert_eq!(
            message.request_header("accept"),
            Err(HeaderNotFound {
                name: "Accept".to_owned()
            })
        );
        assert_eq!(message.request_header_or("accept", "*/*"), "*/*");
    }

    #[test]
    fn present_but_empty_header_is_not_missing() {
        let mut headers = HeaderList::new();
        headers.push("x-empty", "");
        assert_eq!(headers.get("X-Empty"), Ok(""));
        assert_eq!(headers.get_or("x-empty", "fallback"), "");
    }

    #[test]
    fn header_map_snapshot_keeps_repeated_values_in_order() {
        let mut map = HeaderMap::new();
        map.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        map.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        map.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let headers = HeaderList::from_header_map(&map);
        let cookies: Vec<_> = headers
            .iter()
            .filter(|(name, _)| *name == "Set-Cookie")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(headers.get("content-type"), Ok("text/plain"));
    }

    #[test]
    fn duration_is_undefined_until_response_is_captured() {
        let mut message = pending_message();
        assert_eq!(message.state(), MessageState::RequestCaptured);
        assert_eq!(message.duration(), None);

        message.status_code = Some(200);
        message.reason_phrase = "OK".to_owned();
        assert_eq!(message.state(), MessageState::ResponseCaptured);
        assert_eq!(message.duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn summary_lines_follow_request_and_status() {
        let mut message = pending_message();
        assert_eq!(message.request_line(), "POST /api/items");
        assert_eq!(message.response_line(), "");

        message.status_code = Some(204);
        message.reason_phrase = "No Content".to_owned();
        assert_eq!(message.response_line(), "204 No Content");

        message.reason_phrase.clear();
        assert_eq!(message.response_line(), "204");
    }

    #[test]
    fn headers_round_trip_through_json_as_pairs() {
        let headers: HeaderList = [("accept".to_owned(), "*/*".to_owned())]
            .into_iter()
            .collect();
        let json = headers.to_json().unwrap();
        assert_eq!(json, r#"[["Accept","*/*"]]"#);
        assert_eq!(HeaderList::from_json(&json, "request").unwrap(), headers);
    }
}
