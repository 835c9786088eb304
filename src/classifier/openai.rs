use super::{build_prompt, check_status, parse_verdict, Classifier, GenerationSettings, SYSTEM_PROMPT};
use crate::config::ProviderConfig;
use crate::error::ClassifierError;
use crate::model::{AnalysisResult, Email};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client for OpenAI and API-compatible servers.
pub struct OpenAiClassifier {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    settings: GenerationSettings,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClassifier {
    pub fn new(config: &ProviderConfig, settings: GenerationSettings) -> Result<Self, ClassifierError> {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let endpoint = Url::parse(&format!("{}/chat/completions", base.trim_end_matches('/')))
            .map_err(|e| ClassifierError::Unavailable(format!("bad OpenAI base_url: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("llm-spam-filter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(OpenAiClassifier {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model_name.clone(),
            settings,
        })
    }

    fn request<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        }
    }
}

fn reply_text(response: ChatResponse) -> Result<(String, Option<String>), ClassifierError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ClassifierError::InvalidResponse("empty response from OpenAI".to_string()))?;
    Ok((content, response.id))
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn analyze_email(&self, email: &Email) -> Result<AnalysisResult, ClassifierError> {
        let prompt = build_prompt(email, self.settings.max_body_size);
        debug!("Sending {} byte prompt to {}", prompt.len(), self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&self.request(&prompt))
            .send()
            .await?;
        let response: ChatResponse = check_status(response).await?.json().await?;

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

    fn classifier() -> OpenAiClassifier {
        let config = ProviderConfig {
            api_key: "sk-test".to_string(),
            model_name: "gpt-4".to_string(),
            base_url: Some("http://localhost:8080/v1/".to_string()),
        };
        let settings = GenerationSettings {
            max_body_size: 4096,
            max_tokens: 1000,
            temperature: 0.1,
            top_p: 0.9,
        };
        OpenAiClassifier::new(&config, settings).unwrap()
    }

    #[test]
    fn test_endpoint_from_base_url() {
        assert_eq!(
            classifier().endpoint.as_str(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_request_shape() {
        let c = classifier();
        let body = serde_json::to_value(c.request("hello")).unwrap();
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_reply_text() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"id":"chatcmpl-9","choices":[{"index":0,"message":{"role":"assistant","content":"{\"score\":0.5}"}}]}"#,
        )
        .unwrap();
        let (text, id) = reply_text(response).unwrap();
        assert_eq!(text, r#"{"score":0.5}"#);
        assert_eq!(id.as_deref(), Some("chatcmpl-9"));

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            reply_text(empty),
            Err(ClassifierError::InvalidResponse(_))
        ));
    }
}
