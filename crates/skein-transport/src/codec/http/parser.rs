//! Incremental HTTP/1.x message framing on top of `httparse`.
//!
//! `httparse` tokenizes the start line, header section, chunk-size lines and
//! trailers. [`Parser`] adds what it leaves out: body framing (Content-Length,
//! chunked, read-until-close), size limits and connection persistence.
//!
//! [`Parser::execute`] returns how many bytes it consumed. A header section
//! or chunk-size line is only consumed once complete; the unconsumed tail must
//! be presented again, followed by more data, on the next call. Parsing stops
//! at the end of one message so pipelined requests are never swallowed.

use thiserror::Error;

/// Largest start line plus header section accepted.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 80 * 1024;

/// Largest body accepted.
pub const DEFAULT_MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Headers (or trailers) accepted per message.
pub const MAX_HEADERS: usize = 100;

/// Longest chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

const RESPONSE_PREFIX: &[u8] = b"HTTP/";

/// Framing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The start line or a header line is malformed.
    #[error("malformed message head: {0}")]
    Head(#[from] httparse::Error),
    /// The status code is below 100.
    #[error("invalid status code")]
    InvalidStatus,
    /// Content-Length is not a number, or repeated with a different value.
    #[error("invalid Content-Length")]
    InvalidContentLength,
    /// A chunk-size line is not hexadecimal.
    #[error("invalid chunk size")]
    InvalidChunkSize,
    /// Chunk data was not followed by CRLF.
    #[error("missing CRLF after chunk data")]
    InvalidChunkTerminator,
    /// The header section exceeds the configured limit.
    #[error("header section too large")]
    HeaderTooLarge,
    /// The body exceeds the configured limit.
    #[error("body too large")]
    BodyTooLarge,
    /// The stream ended inside a message.
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl From<httparse::InvalidChunkSize> for ParseError {
    fn from(_: httparse::InvalidChunkSize) -> Self {
        ParseError::InvalidChunkSize
    }
}

/// Which start lines are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    /// Request lines only.
    Request,
    /// Status lines only.
    Response,
    /// Either; decided by the `HTTP/` prefix.
    Both,
}

/// Request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Request line seen.
    Request,
    /// Status line seen.
    Response,
}

/// Summary handed to [`ParserHandler::on_headers_complete`].
#[derive(Debug, Clone)]
pub struct HeadInfo<'a> {
    /// Request or response.
    pub kind: MessageKind,
    /// Request method, empty for responses.
    pub method: &'a str,
    /// Status code, 0 for requests.
    pub status_code: u16,
    /// Declared Content-Length.
    pub content_length: Option<u64>,
    /// Transfer-Encoding ends in `chunked`.
    pub chunked: bool,
}

/// Message callbacks. Every method has an empty default.
pub trait ParserHandler {
    /// A new message starts.
    fn on_message_begin(&mut self) {}
    /// Request target.
    fn on_url(&mut self, _url: &str) {}
    /// Response reason phrase.
    fn on_status(&mut self, _reason: &str) {}
    /// One header or trailer, value trimmed.
    fn on_header(&mut self, _name: &str, _value: &[u8]) {}
    /// End of the header section. Return true to treat the message as bodiless
    /// (for example a response to `HEAD`).
    fn on_headers_complete(&mut self, _head: &HeadInfo<'_>) -> bool {
        false
    }
    /// A run of body bytes (chunk framing already removed).
    fn on_body(&mut self, _data: &[u8]) {}
    /// A chunk-size line.
    fn on_chunk_header(&mut self, _size: u64) {}
    /// End of a chunk, including the terminating zero-size chunk.
    fn on_chunk_complete(&mut self) {}
    /// The message is complete.
    fn on_message_complete(&mut self) {}
}

/// Size limits.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    /// See [`DEFAULT_MAX_HEADER_BYTES`].
    pub max_header_bytes: usize,
    /// See [`DEFAULT_MAX_BODY_BYTES`].
    pub max_body_bytes: u64,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    UntilEof,
    Complete,
}

/// Frames one message at a time; call [`reset`](Parser::reset) before the
/// next.
#[derive(Debug, Clone)]
pub struct Parser {
    parser_type: ParserType,
    limits: ParserLimits,
    state: State,
    kind: Option<MessageKind>,
    method: String,
    minor: u8,
    status_code: u16,
    content_length: Option<u64>,
    chunked: bool,
    conn_close: bool,
    conn_keep_alive: bool,
    conn_upgrade: bool,
    has_upgrade_header: bool,
    until_eof: bool,
    body_bytes: u64,
}

impl Parser {
    /// Creates a parser for the given start-line type.
    pub fn new(parser_type: ParserType) -> Self {
        Self::with_limits(parser_type, ParserLimits::default())
    }

    /// Creates a parser with explicit limits.
    pub fn with_limits(parser_type: ParserType, limits: ParserLimits) -> Self {
        Self {
            parser_type,
            limits,
            state: State::Head,
            kind: None,
            method: String::new(),
            minor: 1,
            status_code: 0,
            content_length: None,
            chunked: false,
            conn_close: false,
            conn_keep_alive: false,
            conn_upgrade: false,
            has_upgrade_header: false,
            until_eof: false,
            body_bytes: 0,
        }
    }

    /// Prepares for the next message, keeping type and limits.
    pub fn reset(&mut self) {
        *self = Self::with_limits(self.parser_type, self.limits);
    }

    /// True once a full message has been parsed.
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// True while no header section has been accepted yet.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head
    }

    /// Kind of the message being parsed, once the header section is seen.
    pub fn kind(&self) -> Option<MessageKind> {
        self.kind
    }

    /// Request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// `(major, minor)` version.
    pub fn version(&self) -> (u8, u8) {
        (1, self.minor)
    }

    /// Response status code.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Declared Content-Length.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Chunked transfer coding in use.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Protocol upgrade requested.
    pub fn is_upgrade(&self) -> bool {
        self.has_upgrade_header && self.conn_upgrade || self.method == "CONNECT"
    }

    /// Whether the connection may carry another message after this one.
    pub fn should_keep_alive(&self) -> bool {
        if self.until_eof {
            return false;
        }
        if self.minor >= 1 {
            !self.conn_close
        } else {
            self.conn_keep_alive && !self.conn_close
        }
    }

    /// Feeds bytes; returns how many were consumed.
    pub fn execute<H: ParserHandler>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<usize, ParseError> {
        let mut pos = 0;
        loop {
            let rest = &data[pos..];
            match self.state {
                State::Complete => break,
                State::Head => {
                    // stray CRLF between pipelined messages
                    let blank = leading_blank_lines(rest);
                    if blank > 0 {
                        pos += blank;
                        continue;
                    }
                    if rest.is_empty() || rest == b"\r" {
                        break;
                    }
                    let Some(len) = self.parse_head(rest, handler)? else {
                        break;
                    };
                    pos += len;
                    self.headers_complete(handler)?;
                }
                State::Body { remaining } => {
                    let take = remaining.min(rest.len() as u64) as usize;
                    if take == 0 {
                        break;
                    }
                    handler.on_body(&rest[..take]);
                    pos += take;
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.finish(handler);
                    } else {
                        self.state = State::Body { remaining: left };
                    }
                }
                State::ChunkSize => match httparse::parse_chunk_size(rest)? {
                    httparse::Status::Complete((len, size)) => {
                        pos += len;
                        self.add_body_bytes(size)?;
                        handler.on_chunk_header(size);
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                    httparse::Status::Partial => {
                        if rest.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidChunkSize);
                        }
                        break;
                    }
                },
                State::ChunkData { remaining } => {
                    let take = remaining.min(rest.len() as u64) as usize;
                    if take == 0 {
                        break;
                    }
                    handler.on_body(&rest[..take]);
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                }
                State::ChunkDataEnd => {
                    if rest.first() == Some(&b'\n') {
                        pos += 1;
                    } else if rest.len() < 2 {
                        break;
                    } else if &rest[..2] == b"\r\n" {
                        pos += 2;
                    } else {
                        return Err(ParseError::InvalidChunkTerminator);
                    }
                    handler.on_chunk_complete();
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    match httparse::parse_headers(rest, &mut headers)? {
                        httparse::Status::Complete((len, trailers)) => {
                            pos += len;
                            self.report_headers(trailers, handler)?;
                            handler.on_chunk_complete();
                            self.finish(handler);
                        }
                        httparse::Status::Partial => {
                            self.check_head_len(rest.len())?;
                            break;
                        }
                    }
                }
                State::UntilEof => {
                    if rest.is_empty() {
                        break;
                    }
                    self.add_body_bytes(rest.len() as u64)?;
                    handler.on_body(rest);
                    pos = data.len();
                }
            }
        }
        Ok(pos)
    }

    /// Signals end of stream.
    ///
    /// Returns true if this completed a read-until-close message, false if
    /// no message had started, and an error if the stream ended mid-body.
    pub fn finish_eof<H: ParserHandler>(&mut self, handler: &mut H) -> Result<bool, ParseError> {
        match self.state {
            State::UntilEof => {
                self.finish(handler);
                Ok(true)
            }
            State::Complete => Ok(true),
            State::Head => Ok(false),
            _ => Err(ParseError::UnexpectedEof),
        }
    }

    fn finish<H: ParserHandler>(&mut self, handler: &mut H) {
        self.state = State::Complete;
        handler.on_message_complete();
    }

    fn check_head_len(&self, len: usize) -> Result<(), ParseError> {
        if len > self.limits.max_header_bytes {
            return Err(ParseError::HeaderTooLarge);
        }
        Ok(())
    }

    fn add_body_bytes(&mut self, n: u64) -> Result<(), ParseError> {
        self.body_bytes = self.body_bytes.saturating_add(n);
        if self.body_bytes > self.limits.max_body_bytes {
            return Err(ParseError::BodyTooLarge);
        }
        Ok(())
    }

    /// Parses a complete header section from the front of `data`, returning
    /// its length, or `None` if more bytes are needed.
    fn parse_head<H: ParserHandler>(
        &mut self,
        data: &[u8],
        handler: &mut H,
    ) -> Result<Option<usize>, ParseError> {
        let is_response = match self.parser_type {
            ParserType::Request => false,
            ParserType::Response => true,
            ParserType::Both => {
                if data.len() < RESPONSE_PREFIX.len() && RESPONSE_PREFIX.starts_with(data) {
                    return Ok(None);
                }
                data.starts_with(RESPONSE_PREFIX)
            }
        };

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        if is_response {
            let mut res = httparse::Response::new(&mut headers);
            let httparse::Status::Complete(len) = res.parse(data)? else {
                self.check_head_len(data.len())?;
                return Ok(None);
            };
            self.check_head_len(len)?;
            self.status_code = res.code.unwrap_or_default();
            if self.status_code < 100 {
                return Err(ParseError::InvalidStatus);
            }
            self.kind = Some(MessageKind::Response);
            self.minor = res.version.unwrap_or(1);
            handler.on_message_begin();
            handler.on_status(res.reason.unwrap_or_default());
            self.report_headers(res.headers, handler)?;
            Ok(Some(len))
        } else {
            let mut req = httparse::Request::new(&mut headers);
            let httparse::Status::Complete(len) = req.parse(data)? else {
                self.check_head_len(data.len())?;
                return Ok(None);
            };
            self.check_head_len(len)?;
            self.kind = Some(MessageKind::Request);
            self.minor = req.version.unwrap_or(1);
            self.method = req.method.unwrap_or_default().to_string();
            handler.on_message_begin();
            handler.on_url(req.path.unwrap_or_default());
            self.report_headers(req.headers, handler)?;
            Ok(Some(len))
        }
    }

    fn report_headers<H: ParserHandler>(
        &mut self,
        headers: &[httparse::Header<'_>],
        handler: &mut H,
    ) -> Result<(), ParseError> {
        for header in headers {
            let value = trim_ows(header.value);
            handler.on_header(header.name, value);
            if self.state == State::Head {
                self.inspect_header(header.name, value)?;
            }
        }
        Ok(())
    }

    fn inspect_header(&mut self, name: &str, value: &[u8]) -> Result<(), ParseError> {
        if name.eq_ignore_ascii_case("content-length") {
            let len: u64 = std::str::from_utf8(value)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or(ParseError::InvalidContentLength)?;
            match self.content_length {
                Some(prev) if prev != len => return Err(ParseError::InvalidContentLength),
                _ => self.content_length = Some(len),
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            let last = value
                .rsplit(|&b| b == b',')
                .next()
                .map(trim_ows)
                .unwrap_or_default();
            self.chunked = last.eq_ignore_ascii_case(b"chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(|&b| b == b',').map(trim_ows) {
                if token.eq_ignore_ascii_case(b"close") {
                    self.conn_close = true;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    self.conn_keep_alive = true;
                } else if token.eq_ignore_ascii_case(b"upgrade") {
                    self.conn_upgrade = true;
                }
            }
        } else if name.eq_ignore_ascii_case("upgrade") {
            self.has_upgrade_header = true;
        }
        Ok(())
    }

    fn headers_complete<H: ParserHandler>(&mut self, handler: &mut H) -> Result<(), ParseError> {
        let kind = self.kind.unwrap_or(MessageKind::Request);
        let head = HeadInfo {
            kind,
            method: &self.method,
            status_code: self.status_code,
            content_length: self.content_length,
            chunked: self.chunked,
        };
        let skip_body = handler.on_headers_complete(&head);

        let bodiless_status = kind == MessageKind::Response
            && (self.status_code / 100 == 1 || self.status_code == 204 || self.status_code == 304);

        if skip_body || bodiless_status || self.is_upgrade() {
            self.finish(handler);
        } else if self.chunked {
            self.state = State::ChunkSize;
        } else if let Some(len) = self.content_length {
            self.add_body_bytes(len)?;
            if len == 0 {
                self.finish(handler);
            } else {
                self.state = State::Body { remaining: len };
            }
        } else if kind == MessageKind::Request {
            self.finish(handler);
        } else {
            self.until_eof = true;
            self.state = State::UntilEof;
        }
        Ok(())
    }
}

fn leading_blank_lines(data: &[u8]) -> usize {
    let mut n = 0;
    loop {
        match &data[n..] {
            [b'\r', b'\n', ..] => n += 2,
            [b'\n', ..] => n += 1,
            _ => return n,
        }
    }
}

fn trim_ows(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}
