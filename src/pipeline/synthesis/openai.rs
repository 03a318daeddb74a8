//! OpenAI-compatible `/chat/completions` backend (Groq, OpenAI, vLLM, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::llm::{LlmError, LlmGenerate};

pub struct ChatCompletionsGenerator {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatCompletionsGenerator {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(crate::config::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            client,
        })
    }
}

fn map_status(status: StatusCode, body: String) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            LlmError::Unavailable(format!("status {}: {body}", status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => LlmError::Unavailable("rate limited by provider".into()),
        s if s.is_server_error() => LlmError::Unavailable(format!("status {}", s.as_u16())),
        s => LlmError::InvalidResponse(format!("status {}: {body}", s.as_u16())),
    }
}

fn extract_content(response: CompletionResponse) -> Result<String, LlmError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no choices in response".into()))?;
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(LlmError::Refused("blocked by provider content filter".into()));
    }
    choice
        .message
        .and_then(|m| m.content)
        .ok_or_else(|| LlmError::InvalidResponse("choice has no content".into()))
}

#[async_trait]
impl LlmGenerate for ChatCompletionsGenerator {
    async fn generate(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let body = CompletionRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        extract_content(parsed)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sources::http::serve;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Json;
    use serde_json::{json, Value};

    #[test]
    fn content_filter_is_refusal() {
        let response: CompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": null}, "finish_reason": "content_filter"}]
        }))
        .unwrap();
        assert!(matches!(extract_content(response), Err(LlmError::Refused(_))));
    }

    #[test]
    fn empty_choices_is_invalid() {
        let response: CompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(extract_content(response), Err(LlmError::InvalidResponse(_))));
    }

    #[test]
    fn auth_failure_is_unavailable() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "bad key".into()),
            LlmError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "context too long".into()),
            LlmError::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn sends_bearer_key_and_returns_content() {
        let router = axum::Router::new().route(
            "/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer secret")
                );
                assert_eq!(body["messages"][0]["role"], json!("system"));
                assert_eq!(body["max_tokens"], json!(300));
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "SUMMARY: ok"}, "finish_reason": "stop"}]
                }))
            }),
        );
        let base = serve(router).await;
        let generator =
            ChatCompletionsGenerator::new(&base, "secret", "llama-3.3-70b-versatile", 0.2, Duration::from_secs(5))
                .unwrap();
        let text = generator.generate("sys", "prompt", 300).await.unwrap();
        assert_eq!(text, "SUMMARY: ok");
    }
}
