use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header name paired with every value it carried, in message order.
pub type HeaderMap = Vec<(String, Vec<String>)>;

/// Structured view of one inbound message, built once per transaction.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// Decoded plain-text content.
    pub body: String,
    pub headers: HeaderMap,
}

impl Email {
    /// All values of a header, matched case-insensitively.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    pub fn sender_domain(&self) -> &str {
        match self.from.split_once('@') {
            Some((_, domain)) if !domain.is_empty() => domain,
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub is_spam: bool,
    pub score: f64,
    pub confidence: f64,
    pub explanation: String,
    pub analyzed_at: DateTime<Utc>,
    pub model_used: String,
    pub processing_id: Option<String>,
}

impl AnalysisResult {
    pub const WHITELIST_MODEL: &'static str = "whitelist";
    pub const CACHE_MODEL: &'static str = "cache";
    pub const ERROR_MODEL: &'static str = "error";

    pub fn whitelisted() -> Self {
        AnalysisResult {
            is_spam: false,
            score: 0.0,
            confidence: 1.0,
            explanation: "Sender domain is whitelisted".to_string(),
            analyzed_at: Utc::now(),
            model_used: Self::WHITELIST_MODEL.to_string(),
            processing_id: None,
        }
    }

    /// Fail-open result used when analysis could not complete.
    pub fn failed(reason: impl Into<String>) -> Self {
        AnalysisResult {
            is_spam: false,
            score: 0.0,
            confidence: 0.0,
            explanation: reason.into(),
            analyzed_at: Utc::now(),
            model_used: Self::ERROR_MODEL.to_string(),
            processing_id: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.model_used == Self::ERROR_MODEL
    }
}

/// Memoized decision for one sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub sender_email: String,
    pub is_spam: bool,
    pub score: f64,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(sender: &str, is_spam: bool, score: f64, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        CacheEntry {
            sender_email: normalize_sender(sender),
            is_spam,
            score,
            last_seen: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Cache keys are compared case-insensitively.
pub fn normalize_sender(sender: &str) -> String {
    sender.trim().to_lowercase()
}

/// Pull the bare address out of `Name <user@host>` or `<user@host>`.
pub fn extract_address(value: &str) -> String {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.rfind('<'), value.rfind('>')) {
        if start < end {
            return value[start + 1..end].trim().to_string();
        }
    }
    value.to_string()
}

/// Split an address-list header on top-level commas, ignoring commas inside
/// quoted display names or angle brackets.
pub fn split_address_list(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for ch in value.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                let addr = extract_address(&current);
                if !addr.is_empty() {
                    out.push(addr);
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }

    let addr = extract_address(&current);
    if !addr.is_empty() {
        out.push(addr);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_address() {
        assert_eq!(extract_address("Foo Bar <foo@example.com>"), "foo@example.com");
        assert_eq!(extract_address("<foo@example.com>"), "foo@example.com");
        assert_eq!(extract_address("  foo@example.com "), "foo@example.com");
    }

    #[test]
    fn test_split_address_list_respects_quotes() {
        let list = split_address_list(r#""Doe, Jane" <jane@a.com>, bob@b.com"#);
        assert_eq!(list, vec!["jane@a.com".to_string(), "bob@b.com".to_string()]);
    }

    #[test]
    fn test_cache_entry_normalizes_sender() {
        let entry = CacheEntry::new(" Bar@Unknown.COM ", true, 0.9, chrono::Duration::hours(1));
        assert_eq!(entry.sender_email, "bar@unknown.com");
        assert!(!entry.is_expired_at(Utc::now()));
        assert!(entry.is_expired_at(entry.expires_at));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let email = Email {
            headers: vec![(
                "Received".to_string(),
                vec!["a".to_string(), "b".to_string()],
            )],
            ..Default::default()
        };
        assert_eq!(email.header_values("received").len(), 2);
        assert_eq!(email.header("RECEIVED"), Some("a"));
        assert_eq!(email.header("subject"), None);
    }
}
