use std::sync::Arc;

use async_trait::async_trait;

use super::llm::{LlmError, LlmGenerate};
use crate::pipeline::ollama::{GenerationOptions, OllamaClient, OllamaError};

/// [`LlmGenerate`] backed by a local Ollama text model.
pub struct OllamaGenerator {
    client: Arc<OllamaClient>,
    model: String,
    temperature: f32,
}

impl OllamaGenerator {
    pub fn new(client: Arc<OllamaClient>, model: &str, temperature: f32) -> Self {
        Self {
            client,
            model: model.to_string(),
            temperature,
        }
    }
}

impl From<OllamaError> for LlmError {
    fn from(e: OllamaError) -> Self {
        match e {
            OllamaError::Timeout(_) => LlmError::Timeout,
            OllamaError::Connection(url) => LlmError::Unavailable(format!("cannot connect to {url}")),
            // Ollama answers 404 when the model is not pulled.
            OllamaError::Status { status, body } if status == 404 || status >= 500 => {
                LlmError::Unavailable(format!("status {status}: {body}"))
            }
            OllamaError::Status { status, body } => LlmError::InvalidResponse(format!("status {status}: {body}")),
            OllamaError::ResponseParsing(msg) => LlmError::InvalidResponse(msg),
            OllamaError::HttpClient(msg) => LlmError::Unavailable(msg),
        }
    }
}

#[async_trait]
impl LlmGenerate for OllamaGenerator {
    async fn generate(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let options = GenerationOptions {
            temperature: self.temperature,
            num_predict: i32::try_from(max_tokens).unwrap_or(i32::MAX),
        };
        let text = self.client.generate(&self.model, prompt, system, options).await?;
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sources::http::serve;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Json;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn error_mapping() {
        assert_eq!(LlmError::from(OllamaError::Timeout(60)), LlmError::Timeout);
        assert!(matches!(
            LlmError::from(OllamaError::Connection("http://x".into())),
            LlmError::Unavailable(_)
        ));
        assert!(matches!(
            LlmError::from(OllamaError::Status { status: 404, body: "model not found".into() }),
            LlmError::Unavailable(_)
        ));
        assert!(matches!(
            LlmError::from(OllamaError::Status { status: 400, body: "bad".into() }),
            LlmError::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn generates_through_local_server() {
        let router = axum::Router::new().route(
            "/api/generate",
            post(|| async { Json(json!({"response": "SUMMARY: ok\nWARNINGS:\n- none\nVERDICT: S"})) }),
        );
        let client = Arc::new(OllamaClient::new(&serve(router).await, Duration::from_secs(5)).unwrap());
        let generator = OllamaGenerator::new(client, "llama3.1", 0.2);
        let text = generator.generate("sys", "prompt", 500).await.unwrap();
        assert!(text.starts_with("SUMMARY"));
        assert_eq!(generator.model_name(), "llama3.1");
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let router = axum::Router::new().route(
            "/api/generate",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "out of memory") }),
        );
        let client = Arc::new(OllamaClient::new(&serve(router).await, Duration::from_secs(5)).unwrap());
        let generator = OllamaGenerator::new(client, "llama3.1", 0.2);
        assert!(matches!(
            generator.generate("s", "p", 10).await,
            Err(LlmError::Unavailable(_))
        ));
    }
}
