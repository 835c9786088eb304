use super::{build_prompt, check_status, parse_verdict, Classifier, GenerationSettings};
use crate::config::ProviderConfig;
use crate::error::ClassifierError;
use crate::model::{AnalysisResult, Email};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini `generateContent` client.
pub struct GeminiClassifier {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    settings: GenerationSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiClassifier {
    pub fn new(config: &ProviderConfig, settings: GenerationSettings) -> Result<Self, ClassifierError> {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let endpoint = Url::parse(&format!(
            "{}/models/{}:generateContent",
            base.trim_end_matches('/'),
            config.model_name
        ))
        .map_err(|e| ClassifierError::Unavailable(format!("bad Gemini base_url: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("llm-spam-filter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(GeminiClassifier {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model_name.clone(),
            settings,
        })
    }

    fn request<'a>(&self, prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
                top_p: self.settings.top_p,
                max_output_tokens: self.settings.max_tokens,
            },
        }
    }
}

/// Concatenate the text parts of the first candidate.
fn reply_text(response: GenerateResponse) -> Result<(String, Option<String>), ClassifierError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ClassifierError::InvalidResponse(
            "empty response from Gemini".to_string(),
        ));
    }
    Ok((text, response.response_id))
}

#[async_trait]
impl Classifier for GeminiClassifier {
    async fn analyze_email(&self, email: &Email) -> Result<AnalysisResult, ClassifierError> {
        let prompt = build_prompt(email, self.settings.max_body_size);

        let response = self
            .client
            .post(self.endpoint.clone())
            .query(&[("key", self.api_key.as_str())])
            .json(&self.request(&prompt))
            .send()
            .await?;
        let response: GenerateResponse = check_status(response).await?.json().await?;

        let (text, id) = reply_text(response)?;
        parse_verdict(&text, &self.model, id)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> GeminiClassifier {
        let config = ProviderConfig {
            api_key: "key".to_string(),
            model_name: "gemini-pro".to_string(),
            base_url: None,
        };
        let settings = GenerationSettings {
            max_body_size: 4096,
            max_tokens: 1000,
            temperature: 0.1,
            top_p: 0.9,
        };
        GeminiClassifier::new(&config, settings).unwrap()
    }

    #[test]
    fn test_endpoint_includes_model() {
        assert_eq!(
            classifier().endpoint.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
    }

    #[test]
    fn test_request_uses_camel_case() {
        let body = serde_json::to_value(classifier().request("hi")).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1000);
        assert!(body["generationConfig"].get("topP").is_some());
    }

    #[test]
    fn test_reply_joins_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"{\"score\":"},{"text":"0.3}"}]}}],"responseId":"r-1"}"#,
        )
        .unwrap();
        let (text, id) = reply_text(response).unwrap();
        assert_eq!(text, r#"{"score":0.3}"#);
        assert_eq!(id.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_blocked_prompt_is_invalid_response() {
        let response: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(
            reply_text(response),
            Err(ClassifierError::InvalidResponse(_))
        ));
    }
}
