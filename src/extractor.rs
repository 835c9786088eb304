//! Builds an [`Email`] from raw RFC 5322 bytes.
//!
//! Only `text/plain` content ends up in the body. Multipart trees are walked
//! to a bounded depth; anything malformed below the top-level header block
//! degrades to the undecoded body instead of failing the message.

use crate::encoding::{self, TransferEncoding};
use crate::error::ParseError;
use crate::headers::{ContentType, HeaderBlock, HeaderField};
use crate::model::{extract_address, split_address_list, Email, HeaderMap};

/// Body used when a multipart message carries no `text/plain` part.
pub const NO_TEXT_PLACEHOLDER: &str = "[No text content found in multipart message]";

pub const DEFAULT_MAX_DEPTH: usize = 8;

#[derive(Debug, thiserror::Error)]
enum MimeError {
    #[error("multipart nesting deeper than {0}")]
    TooDeep(usize),
    #[error("boundary '{0}' never appears in the body")]
    BoundaryNotFound(String),
}

#[derive(Debug, Clone)]
pub struct ContentExtractor {
    max_depth: usize,
}

impl Default for ContentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentExtractor {
    pub fn new() -> Self {
        ContentExtractor {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        ContentExtractor {
            max_depth: max_depth.max(1),
        }
    }

    pub fn extract(&self, raw: &[u8]) -> Result<Email, ParseError> {
        let headers = HeaderBlock::parse(raw)?;
        let body = &raw[headers.body_start..];

        let from = headers
            .first("from")
            .map(|v| extract_address(&encoding::decode_encoded_words(&v)))
            .unwrap_or_default();

        let to = headers
            .all("to")
            .flat_map(|h| split_address_list(&encoding::decode_encoded_words(&h.value())))
            .collect();

        let subject = headers
            .first("subject")
            .map(|v| encoding::decode_encoded_words(&v).trim().to_string())
            .unwrap_or_default();

        let body = self.extract_body(&headers, body);

        Ok(Email {
            from,
            to,
            subject,
            body,
            headers: collect_headers(&headers.fields),
        })
    }

    fn extract_body(&self, headers: &HeaderBlock, body: &[u8]) -> String {
        let transfer =
            TransferEncoding::from_header(headers.first("content-transfer-encoding").as_deref());

        let Some(content_type) = headers.first("content-type") else {
            return decode_text(body, transfer, None);
        };

        let parsed = ContentType::parse(&content_type);
        if !parsed.is_multipart() {
            return decode_text(body, transfer, parsed.charset());
        }

        let Some(boundary) = parsed.param("boundary").filter(|b| !b.is_empty()) else {
            log::debug!("Multipart message without boundary, treating as single part");
            return decode_text(body, transfer, parsed.charset());
        };

        let mut text = String::new();
        match self.walk_multipart(body, boundary, 1, &mut text) {
            Ok(()) if text.is_empty() => NO_TEXT_PLACEHOLDER.to_string(),
            Ok(()) => text,
            Err(e) => {
                log::warn!("Falling back to raw body: {}", e);
                encoding::decode_charset(body, None)
            }
        }
    }

    fn walk_multipart(
        &self,
        body: &[u8],
        boundary: &str,
        depth: usize,
        text: &mut String,
    ) -> Result<(), MimeError> {
        if depth > self.max_depth {
            return Err(MimeError::TooDeep(self.max_depth));
        }

        for part in split_parts(body, boundary)? {
            let headers = match HeaderBlock::parse(part) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::debug!("Skipping part with unreadable headers: {}", e);
                    continue;
                }
            };
            let part_body = &part[headers.body_start..];

            // RFC 2046: parts without a Content-Type are text/plain
            let parsed = ContentType::parse(
                headers
                    .first("content-type")
                    .as_deref()
                    .unwrap_or("text/plain"),
            );

            if parsed.is_multipart() {
                if let Some(nested) = parsed.param("boundary").filter(|b| !b.is_empty()) {
                    match self.walk_multipart(part_body, nested, depth + 1, text) {
                        Ok(()) => {}
                        Err(MimeError::BoundaryNotFound(b)) => {
                            log::debug!("Skipping nested part, boundary '{}' not found", b);
                        }
                        Err(e) => return Err(e),
                    }
                }
                continue;
            }

            if parsed.mime_type != "text/plain" || is_attachment(&headers) {
                continue;
            }

            let transfer = TransferEncoding::from_header(
                headers.first("content-transfer-encoding").as_deref(),
            );
            text.push_str(&decode_text(part_body, transfer, parsed.charset()));
            text.push('\n');
        }

        Ok(())
    }
}

fn decode_text(raw: &[u8], transfer: TransferEncoding, charset: Option<&str>) -> String {
    let bytes = encoding::decode_transfer_or_raw(raw, transfer);
    encoding::decode_charset(&bytes, charset)
}

fn is_attachment(headers: &HeaderBlock) -> bool {
    headers
        .first("content-disposition")
        .map(|v| v.to_ascii_lowercase().starts_with("attachment"))
        .unwrap_or(false)
}

/// Group header values under their first-seen name, preserving order.
fn collect_headers(fields: &[HeaderField]) -> HeaderMap {
    let mut map: HeaderMap = Vec::new();
    for field in fields {
        let value = field.value();
        match map.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&field.name)) {
            Some((_, values)) => values.push(value),
            None => map.push((field.name.clone(), vec![value])),
        }
    }
    map
}

fn trim_end_whitespace(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., last] = line {
        if last.is_ascii_whitespace() {
            line = rest;
        } else {
            break;
        }
    }
    line
}

fn strip_line_break(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}

/// Slice a multipart body into its parts. The preamble and epilogue are
/// dropped; a missing close delimiter ends the last part at end of input.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, MimeError> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut found = false;
    let mut pos = 0;

    while pos < body.len() {
        let line_end = body[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i)
            .unwrap_or(body.len());
        let next = (line_end + 1).min(body.len());
        let line = trim_end_whitespace(&body[pos..line_end]);

        if let Some(rest) = line.strip_prefix(delimiter) {
            let closing = rest == b"--";
            if rest.is_empty() || closing {
                found = true;
                if let Some(start) = part_start.take() {
                    parts.push(strip_line_break(&body[start..pos]));
                }
                if closing {
                    return Ok(parts);
                }
                part_start = Some(next);
            }
        }
        pos = next;
    }

    if !found {
        return Err(MimeError::BoundaryNotFound(boundary.to_string()));
    }
    if let Some(start) = part_start {
        if start < body.len() {
            parts.push(&body[start..]);
        }
    }
    Ok(parts)
}
