use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Model call timed out")]
    Timeout,

    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Model refused the request: {0}")]
    Refused(String),

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
}

/// Text generation capability used by the synthesizer and keyword extractor.
#[async_trait]
pub trait LlmGenerate: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, LlmError>;

    /// Model identifier, for logs.
    fn model_name(&self) -> &str;
}

/// Test double returning a fixed script of responses, then repeating the last.
#[cfg(test)]
pub(crate) struct ScriptedLlm {
    responses: std::sync::Mutex<Vec<Result<String, LlmError>>>,
    pub calls: std::sync::atomic::AtomicUsize,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ScriptedLlm {
    pub(crate) fn new(mut responses: Vec<Result<String, LlmError>>) -> Self {
        responses.reverse();
        Self {
            responses: std::sync::Mutex::new(responses),
            calls: std::sync::atomic::AtomicUsize::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn ok(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl LlmGenerate for ScriptedLlm {
    async fn generate(&self, _system: &str, prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop().unwrap()
        } else {
            responses
                .last()
                .cloned()
                .unwrap_or_else(|| Err(LlmError::Unavailable("script exhausted".into())))
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
