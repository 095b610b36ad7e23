//! AI completion collaborator.
//!
//! Thin client for an OpenRouter-compatible chat-completions endpoint.
//! Failures are never fatal to a step: an unconfigured key, a transport
//! error or an unusable reply all surface as "no completion" and the
//! caller applies its documented fallback.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::ApiConfig;

const COMPLETION_DEADLINE: Duration = Duration::from_secs(30);
const MAX_COMPLETION_TOKENS: u32 = 500;

pub struct AiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl AiClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Run one completion. Returns None on any failure.
    pub async fn complete(&self, prompt: &str) -> Option<String> {
        if self.config.api_key.is_empty() {
            debug!("AI collaborator not configured");
            return None;
        }

        let payload = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": MAX_COMPLETION_TOKENS,
            "temperature": 0.7,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .timeout(COMPLETION_DEADLINE)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        let response = match response {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "completion request failed");
                return None;
            }
        };

        let body: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "completion reply was not JSON");
                return None;
            }
        };
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}
