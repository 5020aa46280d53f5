//! HTTP message model shared by the decoder and the encoder.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpKind {
    /// Request line plus headers.
    #[default]
    Request,
    /// Status line plus headers.
    Response,
}

/// Protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpVersion {
    /// Major number.
    pub major: u8,
    /// Minor number.
    pub minor: u8,
}

impl HttpVersion {
    /// HTTP/1.0
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    /// HTTP/1.1
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Keep-alive negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// No explicit value; the connection's idle timer decides.
    Timer,
    /// Close once the response has been flushed.
    Close,
    /// Keep the connection for this long after the last activity.
    For(Duration),
}

impl KeepAlive {
    /// Interprets a `Keep-Alive: timeout=<secs>` value.
    ///
    /// Negative means "timer decides", zero means close.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs < 0.0 {
            KeepAlive::Timer
        } else if secs == 0.0 {
            KeepAlive::Close
        } else {
            KeepAlive::For(Duration::from_secs_f64(secs.min(u32::MAX as f64)))
        }
    }
}

/// One HTTP request or response.
///
/// Header names keep their original case; lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpMessage {
    /// Request or response.
    pub kind: HttpKind,
    /// Protocol version; required to encode.
    pub version: Option<HttpVersion>,
    /// Request method.
    pub method: String,
    /// Request target exactly as sent (origin-form or absolute).
    pub url: String,
    /// Path component of `url`, without the query.
    pub path: String,
    /// Decoded query parameters; last duplicate wins.
    pub params: BTreeMap<String, String>,
    /// Response status code.
    pub status: u16,
    /// Response reason phrase; the canonical one is used when empty.
    pub reason: String,
    /// Headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Body after chunk framing and gzip have been removed.
    pub body: Vec<u8>,
    /// Keep-alive negotiated by this message.
    pub keep_alive: Option<KeepAlive>,
    /// Body is (or should be) sent with chunked transfer coding.
    pub chunked: bool,
    /// Body is (or should be) gzip content-encoded on the wire.
    pub gzip: bool,
    /// The peer requested a protocol upgrade.
    pub upgrade: bool,
}

impl HttpMessage {
    /// An HTTP/1.1 request.
    pub fn request(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: HttpKind::Request,
            version: Some(HttpVersion::HTTP_11),
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// An HTTP/1.1 response.
    pub fn response(status: u16) -> Self {
        Self {
            kind: HttpKind::Response,
            version: Some(HttpVersion::HTTP_11),
            status,
            ..Default::default()
        }
    }

    /// Replaces the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a header, replacing any existing value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// True for requests.
    pub fn is_request(&self) -> bool {
        self.kind == HttpKind::Request
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True if the header is present.
    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Appends a header without touching existing ones.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Sets a header, replacing all existing values.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_header(&name);
        self.headers.push((name, value.into()));
    }

    /// Removes every value of a header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Query parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_case_insensitive() {
        let mut msg = HttpMessage::request("GET", "/");
        msg.add_header("Content-Type", "text/plain");
        assert_eq!(msg.header("content-type"), Some("text/plain"));
        assert!(msg.has_header("CONTENT-TYPE"));
        assert_eq!(msg.header("accept"), None);
    }

    #[test]
    fn test_set_header_replaces() {
        let mut msg = HttpMessage::response(200);
        msg.add_header("X-A", "1");
        msg.add_header("x-a", "2");
        msg.set_header("X-A", "3");
        assert_eq!(msg.headers, vec![("X-A".to_string(), "3".to_string())]);
        msg.remove_header("x-a");
        assert!(msg.headers.is_empty());
    }

    #[test]
    fn test_keep_alive_from_secs() {
        assert_eq!(KeepAlive::from_secs_f64(-1.0), KeepAlive::Timer);
        assert_eq!(KeepAlive::from_secs_f64(0.0), KeepAlive::Close);
        assert_eq!(
            KeepAlive::from_secs_f64(2.5),
            KeepAlive::For(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_version_display() {
        assert_eq!(HttpVersion::HTTP_10.to_string(), "HTTP/1.0");
        assert!(HttpVersion::HTTP_11 > HttpVersion::HTTP_10);
    }

    #[test]
    fn test_default_has_no_version() {
        let msg = HttpMessage::default();
        assert!(msg.version.is_none());
        assert!(msg.is_request());
    }
}
