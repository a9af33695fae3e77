use std::borrow::Cow;
use bytes::Bytes;
use chrono::{DateTime, Duration, DurationRound, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response { status, headers: Vec::new(), body: Bytes::new() }
    }

    pub fn ok() -> Self {
        Response::new(200)
    }

    /// Replaces any previous value of the header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// `Created` and `Last-Modified`, each rounded up to a whole second.
    pub fn set_timestamps(&mut self, created: DateTime<Utc>, last_modified: DateTime<Utc>) {
        self.set_header("Last-Modified", http_date(round_up_to_second(last_modified)));
        self.set_header("Created", http_date(round_up_to_second(created)));
    }
}

/// Clients that drop sub-second precision would otherwise see the resource as
/// older than it is and answer with stale conditional requests.
pub fn round_up_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    let second = Duration::seconds(1);
    match at.duration_trunc(second) {
        Ok(truncated) if truncated < at => truncated + second,
        Ok(truncated) => truncated,
        Err(_) => at,
    }
}

/// RFC 1123 date, as used in HTTP headers.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
