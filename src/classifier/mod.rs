//! Remote spam classifiers.
//!
//! Each binding turns an [`Email`] into a prompt, calls its provider and
//! parses the JSON verdict. The spam/ham decision itself is not trusted from
//! here; the engine re-derives it from the score.

mod gemini;
mod openai;

pub use gemini::GeminiClassifier;
pub use openai::OpenAiClassifier;

use crate::config::{ClassifierConfig, Provider};
use crate::error::{ClassifierError, ConfigError};
use crate::model::{AnalysisResult, Email};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub const TRUNCATION_NOTICE: &str = "\n[... Content truncated due to size limits ...]";

pub const SYSTEM_PROMPT: &str = "You are a spam detection system. Respond only with JSON.";

const PROMPT_TEMPLATE: &str = "You are a spam detection system. Analyze the following email and determine if it's spam.
Respond with a JSON object containing:
- is_spam: boolean (true if spam, false if not)
- score: number between 0 and 1 (higher means more likely to be spam)
- confidence: number between 0 and 1 (how confident you are in your assessment)
- explanation: string (brief explanation of why you think it's spam or not)

Email:
From: {from}
To: {to}
Subject: {subject}
Body:
{body}

Respond only with the JSON object and nothing else.";

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn analyze_email(&self, email: &Email) -> Result<AnalysisResult, ClassifierError>;

    fn model_name(&self) -> &str;
}

/// Sampling and size settings shared by every provider.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub max_body_size: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl From<&ClassifierConfig> for GenerationSettings {
    fn from(config: &ClassifierConfig) -> Self {
        GenerationSettings {
            max_body_size: config.max_body_size,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
        }
    }
}

pub fn build(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>, ConfigError> {
    let classifier: Arc<dyn Classifier> = match config.provider {
        Provider::Openai => Arc::new(
            OpenAiClassifier::new(&config.openai, config.into())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
        ),
        Provider::Gemini => Arc::new(
            GeminiClassifier::new(&config.gemini, config.into())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
        ),
    };
    log::info!(
        "Using {:?} classifier model={}",
        config.provider,
        classifier.model_name()
    );
    Ok(classifier)
}

pub fn build_prompt(email: &Email, max_body_size: usize) -> String {
    let to = match email.to.as_slice() {
        [] => String::new(),
        [only] => only.clone(),
        [first, rest @ ..] => format!("{} and {} others", first, rest.len()),
    };

    PROMPT_TEMPLATE
        .replace("{from}", &email.from)
        .replace("{to}", &to)
        .replace("{subject}", &email.subject)
        .replace("{body}", &truncate_body(&email.body, max_body_size))
}

/// Cut `body` to at most `max_bytes` on a character boundary. Zero disables
/// the limit.
pub fn truncate_body(body: &str, max_bytes: usize) -> String {
    if max_bytes == 0 || body.len() <= max_bytes {
        return body.to_string();
    }
    let mut end = max_bytes;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    log::debug!(
        "Body truncated original_size={} truncated_size={}",
        body.len(),
        end
    );
    format!("{}{}", &body[..end], TRUNCATION_NOTICE)
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    is_spam: bool,
    score: f64,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    explanation: String,
}

/// Parse the model's answer. Models often wrap the object in prose or code
/// fences, so on failure the text between the first `{` and the last `}` is
/// tried.
pub fn parse_verdict(
    text: &str,
    model: &str,
    processing_id: Option<String>,
) -> Result<AnalysisResult, ClassifierError> {
    let verdict = match serde_json::from_str::<Verdict>(text.trim()) {
        Ok(v) => v,
        Err(first) => {
            let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
                return Err(ClassifierError::InvalidResponse(format!(
                    "no JSON object in response: {}",
                    first
                )));
            };
            if start >= end {
                return Err(ClassifierError::InvalidResponse(format!(
                    "no JSON object in response: {}",
                    first
                )));
            }
            serde_json::from_str::<Verdict>(&text[start..=end])
                .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?
        }
    };

    if !verdict.score.is_finite() || !verdict.confidence.is_finite() {
        return Err(ClassifierError::InvalidResponse(
            "score is not a finite number".to_string(),
        ));
    }

    Ok(AnalysisResult {
        is_spam: verdict.is_spam,
        score: verdict.score.clamp(0.0, 1.0),
        confidence: verdict.confidence.clamp(0.0, 1.0),
        explanation: verdict.explanation,
        analyzed_at: Utc::now(),
        model_used: model.to_string(),
        processing_id: processing_id.filter(|id| !id.is_empty()),
    })
}

/// Turn a non-2xx reply into [`ClassifierError::Api`].
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ClassifierError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClassifierError::Api {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> Email {
        Email {
            from: "bar@unknown.com".to_string(),
            to: vec!["a@x.com".to_string(), "b@x.com".to_string(), "c@x.com".to_string()],
            subject: "Cheap pills".to_string(),
            body: "Buy now".to_string(),
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_prompt_lists_first_recipient() {
        let prompt = build_prompt(&email(), 4096);
        assert!(prompt.contains("From: bar@unknown.com\n"));
        assert!(prompt.contains("To: a@x.com and 2 others\n"));
        assert!(prompt.contains("Subject: Cheap pills\n"));
        assert!(prompt.contains("Body:\nBuy now\n"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let body = "ab€cd";
        let out = truncate_body(body, 3);
        assert_eq!(out, format!("ab{}", TRUNCATION_NOTICE));
        assert_eq!(truncate_body(body, 0), body);
        assert_eq!(truncate_body(body, 100), body);
    }

    #[test]
    fn test_parse_plain_json() {
        let result = parse_verdict(
            r#"{"is_spam": true, "score": 0.92, "confidence": 0.8, "explanation": "pharma"}"#,
            "gpt-4",
            Some("chatcmpl-1".to_string()),
        )
        .unwrap();
        assert!(result.is_spam);
        assert_eq!(result.score, 0.92);
        assert_eq!(result.model_used, "gpt-4");
        assert_eq!(result.processing_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let text = "Sure! Here is my answer:\n```json\n{\"is_spam\": false, \"score\": 0.1, \"confidence\": 0.9, \"explanation\": \"newsletter\"}\n```";
        let result = parse_verdict(text, "gemini-pro", None).unwrap();
        assert!(!result.is_spam);
        assert_eq!(result.explanation, "newsletter");
    }

    #[test]
    fn test_parse_clamps_out_of_range() {
        let result = parse_verdict(r#"{"score": 1.7, "confidence": -2}"#, "m", None).unwrap();
        assert_eq!(result.score, 1.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(matches!(
            parse_verdict("I cannot help with that.", "m", None),
            Err(ClassifierError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_verdict("} backwards {", "m", None),
            Err(ClassifierError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_verdict(r#"{"explanation": "no score"}"#, "m", None),
            Err(ClassifierError::InvalidResponse(_))
        ));
    }
}
