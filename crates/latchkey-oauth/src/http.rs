//! Minimal HTTP/1.1 framing for the one-shot capture endpoint.
//!
//! Only the request line is decoded. Headers and body are left to the
//! caller to drain and discard.

use std::collections::HashMap;

use crate::error::ParseError;

/// Protocol version written on every response.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// Decoded request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    /// Raw query string after the first `?`. `None` when the target has no `?`.
    pub query: Option<String>,
    pub version: String,
}

impl ParsedRequest {
    /// Decoded query parameters, empty when there is no query.
    pub fn query_params(&self) -> Result<HashMap<String, String>, ParseError> {
        match &self.query {
            Some(query) => parse_query(query),
            None => Ok(HashMap::new()),
        }
    }
}

/// Parse the request line out of a raw request buffer.
pub fn parse_request(bytes: &[u8]) -> Result<ParsedRequest, ParseError> {
    if bytes.is_empty() {
        return Err(ParseError::Empty);
    }

    let line_end = bytes
        .windows(2)
        .position(|w| w == b"\r\n")
        .or_else(|| bytes.iter().position(|&b| b == b'\n'))
        .unwrap_or(bytes.len());

    let line = std::str::from_utf8(&bytes[..line_end]).map_err(|_| ParseError::Malformed)?;

    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ParseError::Malformed);
    }

    let (path, query) = match parts[1].split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (parts[1], None),
    };

    Ok(ParsedRequest {
        method: parts[0].to_string(),
        path: path.to_string(),
        query,
        version: parts[2].to_string(),
    })
}

/// Parse an `application/x-www-form-urlencoded` query string.
///
/// Duplicate keys: last occurrence wins.
pub fn parse_query(query: &str) -> Result<HashMap<String, String>, ParseError> {
    let mut params = HashMap::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode_component(key)?, decode_component(value)?);
    }

    Ok(params)
}

fn decode_component(raw: &str) -> Result<String, ParseError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ParseError::InvalidEncoding)
}

/// Serialize a complete `Connection: close` response.
pub fn write_response(
    status_code: u16,
    status_text: &str,
    content_type: &str,
    body: &[u8],
) -> Vec<u8> {
    let head = format!(
        "{HTTP_VERSION} {status_code} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}
