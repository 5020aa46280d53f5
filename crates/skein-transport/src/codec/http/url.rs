//! Request-target and query-string handling.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::error::CodecError;

/// A request target split into the parts the encoder needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    /// Lowercased scheme, when the target was in absolute form.
    pub scheme: Option<String>,
    /// Host, when the target was in absolute form.
    pub host: Option<String>,
    /// Explicit port, or the scheme default (80/443).
    pub port: u16,
    /// Path without the query; `/` when absent.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
}

impl RequestTarget {
    /// Parses an origin-form (`/a?b`), asterisk-form (`*`) or absolute-form
    /// (`http://host:port/a?b`) target.
    pub fn parse(url: &str) -> Result<Self, CodecError> {
        if url.is_empty() {
            return Err(CodecError::MissingField("url"));
        }

        if let Some((scheme, rest)) = url.split_once("://") {
            let scheme = scheme.to_ascii_lowercase();
            let default_port = match scheme.as_str() {
                "http" => 80,
                "https" => 443,
                _ => return Err(CodecError::InvalidUrl(url.to_string())),
            };
            let (authority, tail) = match rest.find(['/', '?']) {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, ""),
            };
            // userinfo is never forwarded
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            let (host, port) = split_authority(authority, default_port)
                .ok_or_else(|| CodecError::InvalidUrl(url.to_string()))?;
            let (path, query) = split_path(tail);
            return Ok(Self {
                scheme: Some(scheme),
                host: Some(host),
                port,
                path,
                query,
            });
        }

        if url.starts_with('/') || url == "*" {
            let (path, query) = split_path(url);
            return Ok(Self {
                scheme: None,
                host: None,
                port: 80,
                path,
                query,
            });
        }

        Err(CodecError::InvalidUrl(url.to_string()))
    }

    /// Value for the `Host` header, omitting a default port.
    pub fn host_header(&self) -> Option<String> {
        let host = self.host.as_ref()?;
        let default = match self.scheme.as_deref() {
            Some("https") => 443,
            _ => 80,
        };
        Some(if self.port == default {
            host.clone()
        } else {
            format!("{}:{}", host, self.port)
        })
    }

    /// Path plus query, as written on the request line.
    pub fn origin_form(&self) -> Cow<'_, str> {
        match &self.query {
            Some(q) => Cow::Owned(format!("{}?{}", self.path, q)),
            None => Cow::Borrowed(&self.path),
        }
    }
}

fn split_path(tail: &str) -> (String, Option<String>) {
    let (path, query) = match tail.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (tail, None),
    };
    let path = if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    };
    (path, query)
}

fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some((format!("[{host}]"), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((authority.to_string(), default_port)),
    }
}

/// Decodes `a=1&b=2` into a map.
///
/// The last occurrence of a duplicate key wins; a pair without `=` becomes a
/// key with an empty value; empty pairs are ignored.
pub fn decode_query(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key.is_empty() {
            continue;
        }
        params.insert(percent_decode(key), percent_decode(value));
    }
    params
}

fn percent_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
