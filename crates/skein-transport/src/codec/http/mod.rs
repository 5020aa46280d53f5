//! HTTP/1.x codec.
//!
//! Decoding drives the incremental [`parser`] (message framing over
//! `httparse`) across the readable region of the inbound buffer. Parser
//! progress is tracked as an offset into that region; the buffer's read
//! cursor only moves once a whole message has been parsed, so a partial
//! message always yields `Pause` with nothing consumed.
//!
//! Encoding writes the start line, merged headers and the framed body into the
//! outbound buffer and rolls the buffer back if any step fails.

pub mod message;
pub mod parser;
pub mod url;

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, trace};

use crate::buffer::ByteBuffer;
use crate::codec::{CodecResult, Status};
use crate::error::CodecError;

pub use message::{HttpKind, HttpMessage, HttpVersion, KeepAlive};
pub use parser::{
    HeadInfo, MessageKind, ParseError, Parser, ParserHandler, ParserLimits, ParserType,
};
pub use url::{decode_query, RequestTarget};

/// Header names the encoder always computes itself.
const CODEC_OWNED_HEADERS: [&str; 4] = [
    "host",
    "content-length",
    "transfer-encoding",
    "content-encoding",
];

/// Default headers only written on responses.
const RESPONSE_ONLY_HEADERS: [&str; 2] = ["allow", "server"];

/// Collects framing callbacks into an [`HttpMessage`].
#[derive(Debug, Default)]
struct MessageBuilder {
    url: String,
    reason: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    expect_no_body: bool,
}

impl MessageBuilder {
    fn clear(&mut self) {
        let expect_no_body = self.expect_no_body;
        *self = Self::default();
        self.expect_no_body = expect_no_body;
    }
}

impl ParserHandler for MessageBuilder {
    fn on_message_begin(&mut self) {
        self.clear();
    }

    fn on_url(&mut self, url: &str) {
        self.url.push_str(url);
    }

    fn on_status(&mut self, reason: &str) {
        self.reason.push_str(reason);
    }

    fn on_header(&mut self, name: &str, value: &[u8]) {
        self.headers
            .push((name.to_string(), String::from_utf8_lossy(value).into_owned()));
    }

    fn on_headers_complete(&mut self, head: &HeadInfo<'_>) -> bool {
        head.kind == MessageKind::Response && self.expect_no_body
    }

    fn on_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }
}

/// HTTP request/response codec.
#[derive(Debug)]
pub struct HttpCodec {
    parser: Parser,
    builder: MessageBuilder,
    scan_offset: usize,
    default_headers: Vec<(String, String)>,
    keep_alive: Option<KeepAlive>,
}

impl Default for HttpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCodec {
    /// Creates a codec that accepts both requests and responses.
    pub fn new() -> Self {
        Self::with_limits(ParserLimits::default())
    }

    /// Creates a codec with explicit tokenizer limits.
    pub fn with_limits(limits: ParserLimits) -> Self {
        Self {
            parser: Parser::with_limits(ParserType::Both, limits),
            builder: MessageBuilder::default(),
            scan_offset: 0,
            default_headers: vec![
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Allow".to_string(), "POST,GET".to_string()),
                ("Server".to_string(), "skein".to_string()),
            ],
            keep_alive: None,
        }
    }

    /// Adds or replaces a header written on every encoded message.
    pub fn set_default_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_default_header(&name);
        self.default_headers.push((name, value.into()));
    }

    /// Removes a default header.
    pub fn remove_default_header(&mut self, name: &str) {
        self.default_headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// The current default header table.
    pub fn default_headers(&self) -> &[(String, String)] {
        &self.default_headers
    }

    /// Keep-alive negotiated by the most recently decoded message.
    pub fn keep_alive(&self) -> Option<KeepAlive> {
        self.keep_alive
    }

    /// Drops any partially parsed message.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.builder.clear();
        self.scan_offset = 0;
    }

    /// Decodes at most one message from the readable region of `buf`.
    pub fn decode(&mut self, buf: &mut ByteBuffer) -> CodecResult<HttpMessage> {
        let pending = buf
            .peek_raw()
            .get(self.scan_offset..)
            .unwrap_or_default();
        if pending.is_empty() && !self.parser.is_complete() {
            return Ok(Status::Pause);
        }

        match self.parser.execute(pending, &mut self.builder) {
            Ok(consumed) => self.scan_offset += consumed,
            Err(e) => {
                debug!(error = %e, offset = self.scan_offset, "HTTP parse failed");
                self.reset();
                return Err(CodecError::HttpParse(e.to_string()));
            }
        }

        if !self.parser.is_complete() {
            trace!(scanned = self.scan_offset, "HTTP message incomplete");
            return Ok(Status::Pause);
        }
        self.complete(buf).map(Status::Ready)
    }

    /// Completes a read-until-close message when the peer has closed.
    pub fn decode_eof(&mut self, buf: &mut ByteBuffer) -> CodecResult<HttpMessage> {
        match self.parser.finish_eof(&mut self.builder) {
            Ok(true) => self.complete(buf).map(Status::Ready),
            Ok(false) => Ok(Status::Closed),
            Err(e) => {
                self.reset();
                Err(CodecError::HttpParse(e.to_string()))
            }
        }
    }

    fn complete(&mut self, buf: &mut ByteBuffer) -> Result<HttpMessage, CodecError> {
        let consumed = self.scan_offset;
        let result = self.build_message();
        self.builder.expect_no_body = false;
        self.reset();
        let msg = result?;
        buf.skip(consumed)?;
        self.keep_alive = msg.keep_alive;
        debug!(
            kind = ?msg.kind,
            method = %msg.method,
            status = msg.status,
            body_len = msg.body.len(),
            consumed,
            "decoded HTTP message"
        );
        Ok(msg)
    }

    fn build_message(&mut self) -> Result<HttpMessage, CodecError> {
        let (major, minor) = self.parser.version();
        let kind = match self.parser.kind() {
            Some(MessageKind::Response) => HttpKind::Response,
            _ => HttpKind::Request,
        };
        let mut msg = HttpMessage {
            kind,
            version: Some(HttpVersion { major, minor }),
            headers: std::mem::take(&mut self.builder.headers),
            body: std::mem::take(&mut self.builder.body),
            chunked: self.parser.is_chunked(),
            upgrade: self.parser.is_upgrade(),
            ..Default::default()
        };

        match kind {
            HttpKind::Request => {
                msg.method = self.parser.method().to_string();
                msg.url = std::mem::take(&mut self.builder.url);
                let target = RequestTarget::parse(&msg.url)?;
                if let Some(query) = &target.query {
                    msg.params = decode_query(query);
                }
                msg.path = target.path;
            }
            HttpKind::Response => {
                msg.status = self.parser.status_code();
                msg.reason = std::mem::take(&mut self.builder.reason);
            }
        }

        msg.keep_alive = Some(self.negotiate_keep_alive(&msg));

        if msg
            .header("content-encoding")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
        {
            msg.gzip = true;
            msg.body = gunzip(&msg.body)?;
        }
        Ok(msg)
    }

    fn negotiate_keep_alive(&self, msg: &HttpMessage) -> KeepAlive {
        if !self.parser.should_keep_alive() {
            return KeepAlive::Close;
        }
        msg.header("keep-alive")
            .and_then(|value| {
                value.split(',').find_map(|param| {
                    let (k, v) = param.split_once('=')?;
                    if k.trim().eq_ignore_ascii_case("timeout") {
                        v.trim().parse::<f64>().ok()
                    } else {
                        None
                    }
                })
            })
            .map(KeepAlive::from_secs_f64)
            .unwrap_or(KeepAlive::Timer)
    }

    /// Appends one encoded message to `out`, or leaves `out` untouched on error.
    pub fn encode(&mut self, msg: &HttpMessage, out: &mut ByteBuffer) -> Result<(), CodecError> {
        let version = msg.version.ok_or(CodecError::MissingField("version"))?;
        let target = match msg.kind {
            HttpKind::Request => {
                if msg.method.is_empty() {
                    return Err(CodecError::MissingField("method"));
                }
                Some(RequestTarget::parse(&msg.url)?)
            }
            HttpKind::Response => {
                if msg.status == 0 {
                    return Err(CodecError::MissingField("status"));
                }
                None
            }
        };

        let chunked = msg.chunked
            || msg
                .header("transfer-encoding")
                .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        let gzip = msg.gzip
            || msg
                .header("content-encoding")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"));
        let body = if gzip {
            gzip_bytes(&msg.body)?
        } else {
            msg.body.clone()
        };

        // relative to the read cursor: growth may compact and move it
        let before = out.readable_len();
        let result = self.write_message(msg, version, target.as_ref(), chunked, gzip, &body, out);
        if let Err(e) = result {
            out.set_write_index(out.read_index() + before)?;
            return Err(e);
        }

        if msg.is_request() {
            self.builder.expect_no_body = msg.method.eq_ignore_ascii_case("HEAD");
        }
        trace!(bytes = out.readable_len() - before, "encoded HTTP message");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_message(
        &self,
        msg: &HttpMessage,
        version: HttpVersion,
        target: Option<&RequestTarget>,
        chunked: bool,
        gzip: bool,
        body: &[u8],
        out: &mut ByteBuffer,
    ) -> Result<(), CodecError> {
        match target {
            Some(target) => {
                out.write_formatted(format_args!(
                    "{} {} {}\r\n",
                    msg.method,
                    target.origin_form(),
                    version
                ))?;
                let host = target
                    .host_header()
                    .or_else(|| msg.header("host").map(str::to_string));
                if let Some(host) = host {
                    out.write_formatted(format_args!("Host: {host}\r\n"))?;
                }
            }
            None => {
                let reason = if msg.reason.is_empty() {
                    ::http::StatusCode::from_u16(msg.status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("Unknown")
                } else {
                    msg.reason.as_str()
                };
                out.write_formatted(format_args!("{} {} {}\r\n", version, msg.status, reason))?;
            }
        }

        for (name, value) in &self.default_headers {
            let lower = name.to_ascii_lowercase();
            if CODEC_OWNED_HEADERS.contains(&lower.as_str())
                || (msg.is_request() && RESPONSE_ONLY_HEADERS.contains(&lower.as_str()))
                || msg.has_header(name)
            {
                continue;
            }
            let value = if lower == "connection" && msg.keep_alive == Some(KeepAlive::Close) {
                "close"
            } else {
                value.as_str()
            };
            out.write_formatted(format_args!("{name}: {value}\r\n"))?;
        }

        for (name, value) in &msg.headers {
            if CODEC_OWNED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            out.write_formatted(format_args!("{name}: {value}\r\n"))?;
        }

        if gzip {
            out.write(b"Content-Encoding: gzip\r\n")?;
        }

        if chunked {
            out.write(b"Transfer-Encoding: chunked\r\n\r\n")?;
            if !body.is_empty() {
                out.write_formatted(format_args!("{:x}\r\n", body.len()))?;
                out.write(body)?;
                out.write(b"\r\n")?;
            }
            out.write(b"0\r\n\r\n")?;
        } else {
            out.write_formatted(format_args!("Content-Length: {}\r\n\r\n", body.len()))?;
            out.write(body)?;
        }
        Ok(())
    }
}

fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Gzip(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Gzip(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| CodecError::Gzip(e.to_string()))?;
    Ok(decoded)
}
