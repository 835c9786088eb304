//! Rebuilds a message for forwarding.
//!
//! Decision headers go in front of the original header block, the Subject
//! may be replaced, and everything after the header block is copied byte for
//! byte. The body is never re-serialized, so MIME boundaries and attachments
//! reach the next hop untouched.

use crate::config::{HeaderNames, ServerConfig};
use crate::encoding;
use crate::error::ParseError;
use crate::headers::HeaderBlock;
use crate::model::AnalysisResult;

/// Longest free-text value written into a decision header.
const MAX_REASON_BYTES: usize = 900;

/// Decision headers to add, plus the Subject to set.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderEdits {
    pub added: Vec<(String, String)>,
    /// Replaces the first `Subject`, or is added when there is none.
    pub subject: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRewriter {
    headers: HeaderNames,
    modify_subject: bool,
    subject_prefix: String,
}

impl MessageRewriter {
    pub fn new(headers: HeaderNames, modify_subject: bool, subject_prefix: impl Into<String>) -> Self {
        MessageRewriter {
            headers,
            modify_subject,
            subject_prefix: subject_prefix.into(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.headers.clone(),
            config.modify_subject,
            config.subject_prefix.clone(),
        )
    }

    /// Header changes that carry one decision. `subject` is the first
    /// `Subject` value of the message, if it has one; `fold` is the line
    /// break used when an encoded value has to be folded.
    pub fn edits(
        &self,
        result: &AnalysisResult,
        error: Option<&str>,
        subject: Option<&str>,
        fold: &str,
    ) -> HeaderEdits {
        let mut added = vec![
            (
                self.headers.spam.clone(),
                if result.is_spam { "true" } else { "false" }.to_string(),
            ),
            (self.headers.score.clone(), format!("{:.4}", result.score)),
            (
                self.headers.reason.clone(),
                encoding::encode_header_value(&header_text(&result.explanation), fold),
            ),
        ];
        if let Some(error) = error {
            added.push((
                self.headers.error.clone(),
                encoding::encode_header_value(&header_text(error), fold),
            ));
        }

        let subject = (self.modify_subject && result.is_spam).then(|| match subject {
            Some(value) => {
                let decoded = encoding::decode_encoded_words(value);
                encoding::encode_header_value(&self.prefixed(&decoded), fold)
            }
            None => self.subject_prefix.trim_end().to_string(),
        });

        HeaderEdits { added, subject }
    }

    /// Produce the outbound copy of `raw`. `error` is the analysis failure,
    /// if any, and is reported in its own header.
    pub fn rewrite(
        &self,
        raw: &[u8],
        result: &AnalysisResult,
        error: Option<&str>,
    ) -> Result<Vec<u8>, ParseError> {
        let block = HeaderBlock::parse(raw)?;
        let eol = block.line_ending;
        let fold = format!("{} ", eol);
        let edits = self.edits(result, error, block.first("subject").as_deref(), &fold);

        let mut out = Vec::with_capacity(raw.len() + 256);
        let push_header = |out: &mut Vec<u8>, name: &str, value: &str| {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(eol.as_bytes());
        };

        for (name, value) in &edits.added {
            push_header(&mut out, name, value);
        }

        let mut subject = edits.subject.as_deref();
        for field in &block.fields {
            if field.is("subject") {
                if let Some(value) = subject.take() {
                    push_header(&mut out, &field.name, value);
                    continue;
                }
            }
            let bytes = &raw[field.span.clone()];
            out.extend_from_slice(bytes);
            if !bytes.ends_with(b"\n") {
                out.extend_from_slice(eol.as_bytes());
            }
        }
        if let Some(value) = subject {
            push_header(&mut out, "Subject", value);
        }

        match &block.separator {
            Some(separator) => out.extend_from_slice(&raw[separator.clone()]),
            None => out.extend_from_slice(eol.as_bytes()),
        }
        out.extend_from_slice(&raw[block.body_start..]);
        Ok(out)
    }

    fn prefixed(&self, subject: &str) -> String {
        if subject.contains(self.subject_prefix.trim()) {
            subject.to_string()
        } else {
            format!("{}{}", self.subject_prefix, subject)
        }
    }
}

/// Collapse `text` onto one line and bound its length.
fn header_text(text: &str) -> String {
    let single: String = text
        .split(|c: char| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if single.len() <= MAX_REASON_BYTES {
        return single;
    }
    let mut end = MAX_REASON_BYTES;
    while !single.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &single[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(is_spam: bool, score: f64) -> AnalysisResult {
        AnalysisResult {
            is_spam,
            score,
            confidence: 0.9,
            explanation: "Looks like a\nphishing attempt".to_string(),
            analyzed_at: Utc::now(),
            model_used: "gpt-4".to_string(),
            processing_id: None,
        }
    }

    fn rewriter(modify_subject: bool) -> MessageRewriter {
        MessageRewriter::new(HeaderNames::default(), modify_subject, "[**SPAM**] ")
    }

    const MULTIPART: &str = "From: a@b.com\r\n\
        Subject: Win money\r\n\
        Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
        \r\n\
        --XYZ\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Hello world\r\n\
        --XYZ\r\n\
        Content-Type: application/octet-stream\r\n\
        Content-Transfer-Encoding: base64\r\n\
        \r\n\
        AAECAwQF\r\n\
        --XYZ--\r\n";

    fn split(out: &[u8]) -> (String, &[u8]) {
        let text = String::from_utf8_lossy(out);
        let idx = text.find("\r\n\r\n").unwrap();
        (text[..idx].to_string(), &out[idx + 4..])
    }

    #[test]
    fn test_headers_injected_and_body_untouched() {
        let out = rewriter(false)
            .rewrite(MULTIPART.as_bytes(), &result(false, 0.12345), None)
            .unwrap();
        let (headers, body) = split(&out);
        assert!(headers.starts_with(
            "X-Spam-Status: false\r\nX-Spam-Score: 0.1235\r\nX-Spam-Reason: Looks like a phishing attempt\r\nFrom: a@b.com\r\n"
        ));
        assert!(!headers.contains("X-Spam-Error"));
        assert!(headers.contains("Subject: Win money"));

        let original_body = &MULTIPART.as_bytes()[MULTIPART.find("\r\n\r\n").unwrap() + 4..];
        assert_eq!(body, original_body);
    }

    #[test]
    fn test_error_header_present_on_failure() {
        let out = rewriter(false)
            .rewrite(
                MULTIPART.as_bytes(),
                &AnalysisResult::failed("classifier did not answer within 10s"),
                Some("classifier did not answer within 10s"),
            )
            .unwrap();
        let (headers, _) = split(&out);
        assert!(headers.contains("X-Spam-Status: false\r\n"));
        assert!(headers.contains("X-Spam-Error: classifier did not answer within 10s\r\n"));
    }

    #[test]
    fn test_subject_prefixed_only_for_spam() {
        let spam = rewriter(true)
            .rewrite(MULTIPART.as_bytes(), &result(true, 0.9), None)
            .unwrap();
        let (headers, _) = split(&spam);
        assert!(headers.contains("Subject: [**SPAM**] Win money\r\n"));
        assert!(!headers.contains("Subject: Win money"));

        let ham = rewriter(true)
            .rewrite(MULTIPART.as_bytes(), &result(false, 0.1), None)
            .unwrap();
        assert!(split(&ham).0.contains("Subject: Win money\r\n"));
    }

    #[test]
    fn test_subject_prefix_not_doubled() {
        let raw = "Subject: [**SPAM**] again\r\n\r\nbody";
        let out = rewriter(true).rewrite(raw.as_bytes(), &result(true, 0.9), None).unwrap();
        assert!(String::from_utf8_lossy(&out).contains("Subject: [**SPAM**] again\r\n"));
    }

    #[test]
    fn test_encoded_subject_decoded_then_reencoded() {
        let raw = "Subject: =?UTF-8?B?R3LDvMOfZQ==?=\nFrom: x@y.z\n\nbody\n";
        let out = rewriter(true).rewrite(raw.as_bytes(), &result(true, 0.8), None).unwrap();
        let text = String::from_utf8(out).unwrap();
        let subject_line = text.lines().find(|l| l.starts_with("Subject:")).unwrap();
        let value = subject_line.trim_start_matches("Subject:").trim();
        assert_eq!(encoding::decode_encoded_words(value), "[**SPAM**] Grüße");
        assert!(text.ends_with("\n\nbody\n"));
        assert!(text.starts_with("X-Spam-Status: true\nX-Spam-Score: 0.8000\n"));
    }

    #[test]
    fn test_missing_subject_added_for_spam() {
        let raw = "From: x@y.z\r\n\r\nbody";
        let out = rewriter(true).rewrite(raw.as_bytes(), &result(true, 0.8), None).unwrap();
        assert!(String::from_utf8_lossy(&out).contains("Subject: [**SPAM**]\r\n"));
    }

    #[test]
    fn test_headers_only_message_gains_separator() {
        let raw = "From: x@y.z\r\nSubject: hi";
        let out = rewriter(false).rewrite(raw.as_bytes(), &result(false, 0.0), None).unwrap();
        assert!(String::from_utf8_lossy(&out).ends_with("Subject: hi\r\n\r\n"));
    }

    #[test]
    fn test_edits_fold_with_given_break() {
        let long = "word ".repeat(40);
        let mut spam = result(true, 0.91);
        spam.explanation = format!("Grüße {}", long);
        let edits = rewriter(true).edits(&spam, Some("slow"), Some("Hallo"), "\n ");
        let names: Vec<&str> = edits.added.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["X-Spam-Status", "X-Spam-Score", "X-Spam-Reason", "X-Spam-Error"]);
        assert_eq!(edits.added[1].1, "0.9100");
        assert!(edits.added[2].1.contains("?=\n =?UTF-8?B?"));
        assert!(!edits.added[2].1.contains('\r'));
        assert_eq!(edits.subject.as_deref(), Some("[**SPAM**] Hallo"));

        let ham = rewriter(true).edits(&result(false, 0.1), None, Some("Hallo"), "\n ");
        assert_eq!(ham.added.len(), 3);
        assert_eq!(ham.subject, None);
    }

    #[test]
    fn test_unparsable_message_is_error() {
        assert!(rewriter(false)
            .rewrite(b"not a message", &result(false, 0.0), None)
            .is_err());
    }
}
