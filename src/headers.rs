//! Internet-message header framing.
//!
//! Fields keep their byte spans into the original message so the forwarder
//! can copy them back verbatim and replace only what it rewrites.

use crate::encoding;
use crate::error::ParseError;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField {
    pub name: String,
    /// Value as written, folding included.
    pub raw_value: String,
    /// Whole field including its final line break.
    pub span: Range<usize>,
    value_start: usize,
}

impl HeaderField {
    pub fn value(&self) -> String {
        encoding::unfold(&self.raw_value).trim().to_string()
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub fields: Vec<HeaderField>,
    /// The empty line ending the header block, when there is one.
    pub separator: Option<Range<usize>>,
    pub body_start: usize,
    pub line_ending: &'static str,
}

impl HeaderBlock {
    /// Split `raw` into header fields and the offset where the body starts.
    ///
    /// A line without a colon after at least one field is taken as the start
    /// of a body with a missing separator. Input that does not open with a
    /// header field cannot be framed and is rejected.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }

        let mut fields: Vec<HeaderField> = Vec::new();
        let mut separator = None;
        let mut line_ending = None;
        let mut pos = 0;
        let mut body_start = raw.len();

        while pos < raw.len() {
            let newline = raw[pos..].iter().position(|&b| b == b'\n').map(|i| pos + i);
            let next = newline.map(|i| i + 1).unwrap_or(raw.len());
            let content_end = match newline {
                Some(i) if i > pos && raw[i - 1] == b'\r' => i - 1,
                Some(i) => i,
                None => raw.len(),
            };
            if line_ending.is_none() && newline.is_some() {
                line_ending = Some(if content_end < next - 1 { "\r\n" } else { "\n" });
            }
            let line = &raw[pos..content_end];

            if line.is_empty() {
                separator = Some(pos..next);
                body_start = next;
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                let Some(last) = fields.last_mut() else {
                    return Err(ParseError::Headers(
                        "continuation line before first header".to_string(),
                    ));
                };
                last.raw_value =
                    String::from_utf8_lossy(&raw[last.value_start..content_end]).into_owned();
                last.span.end = next;
                pos = next;
                continue;
            }

            match field_name(line) {
                Some((name, colon)) => {
                    let value_start = pos + colon + 1;
                    fields.push(HeaderField {
                        name,
                        raw_value: String::from_utf8_lossy(&raw[value_start..content_end])
                            .into_owned(),
                        span: pos..next,
                        value_start,
                    });
                }
                None if fields.is_empty() => {
                    return Err(ParseError::Headers(format!(
                        "first line is not a header field: {}",
                        String::from_utf8_lossy(&line[..line.len().min(60)])
                    )));
                }
                None => {
                    log::debug!("Header block ended without a blank line");
                    body_start = pos;
                    break;
                }
            }
            pos = next;
        }

        Ok(HeaderBlock {
            fields,
            separator,
            body_start,
            line_ending: line_ending.unwrap_or("\r\n"),
        })
    }

    /// First value of `name`, unfolded and trimmed.
    pub fn first(&self, name: &str) -> Option<String> {
        self.fields.iter().find(|f| f.is(name)).map(HeaderField::value)
    }

    pub fn all(&self, name: &str) -> impl Iterator<Item = &HeaderField> + '_ {
        let name = name.to_string();
        self.fields.iter().filter(move |f| f.is(&name))
    }
}

/// The field name and colon offset, if `line` opens a header field.
fn field_name(line: &[u8]) -> Option<(String, usize)> {
    let colon = line.iter().position(|&b| b == b':')?;
    // obsolete syntax allows whitespace before the colon
    let name = std::str::from_utf8(&line[..colon]).ok()?.trim_end();
    let valid = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':');
    valid.then(|| (name.to_string(), colon))
}

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentType {
    pub mime_type: String,
    pub params: Vec<(String, String)>,
}

impl ContentType {
    pub fn parse(value: &str) -> Self {
        let mut segments = split_params(value).into_iter();
        let mime_type = segments
            .next()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "text/plain".to_string());

        let params = segments
            .filter_map(|segment| {
                let (key, value) = segment.split_once('=')?;
                let key = key.trim().to_ascii_lowercase();
                (!key.is_empty()).then(|| (key, unquote(value.trim())))
            })
            .collect();

        ContentType { mime_type, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.mime_type.starts_with("multipart/")
    }

    pub fn charset(&self) -> Option<&str> {
        self.param("charset")
    }
}

fn split_params(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ';' if !in_quotes => out.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    out.push(current);
    out
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"') else {
        return value.to_string();
    };
    let inner = inner.strip_suffix('"').unwrap_or(inner);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(ch);
        }
    }
    out
}
