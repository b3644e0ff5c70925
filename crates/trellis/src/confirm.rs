//! Human confirmation of link and contact requests.

use std::sync::Mutex;

use async_trait::async_trait;

/// Asks whoever operates the device whether to accept a request.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Confirm: Send + Sync {
    /// Returns true to accept.
    async fn confirm(&self, prompt: &str) -> bool;
}

/// A fixed answer, for tests and headless deployments.
///
/// Every prompt is recorded.
#[derive(Debug)]
pub struct AutoConfirm {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl AutoConfirm {
    pub fn accept() -> Self {
        Self {
            answer: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn reject() -> Self {
        Self {
            answer: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        tracing::debug!(prompt, answer = self.answer, "auto-confirming");
        self.answer
    }
}
