//! Async client for a local Ollama instance.
//!
//! Used for both text generation (`/api/generate`) and label OCR through a
//! vision model (`/api/chat` with base64 images).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Cannot connect to Ollama at {0}")]
    Connection(String),

    #[error("Ollama request timed out after {0}s")]
    Timeout(u64),

    #[error("Ollama returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse Ollama response: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

/// Sampling options forwarded to the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub num_predict: i32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerationOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OllamaError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::config::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|e| OllamaError::HttpClient(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> OllamaError {
        if e.is_connect() {
            OllamaError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            OllamaError::Timeout(self.timeout.as_secs())
        } else {
            OllamaError::HttpClient(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, OllamaError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(OllamaError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Single non-streaming completion through `/api/generate`.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        options: GenerationOptions,
    ) -> Result<String, OllamaError> {
        let body = GenerateRequest {
            model,
            prompt,
            system,
            stream: false,
            options,
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.response)
    }

    /// Chat completion with base64-encoded images attached to the user turn.
    pub async fn chat_with_images(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        images_base64: Vec<String>,
        options: GenerationOptions,
    ) -> Result<String, OllamaError> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                    images: None,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                    images: Some(images_base64),
                },
            ],
            stream: false,
            options,
        };
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.message.content)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, OllamaError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response).await?;
        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    pub async fn is_model_available(&self, model: &str) -> Result<bool, OllamaError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }
}
