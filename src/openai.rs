//! Optional prompt enhancement through an OpenAI-compatible chat API.
//! Enhancement is enrichment only: callers fall back to the raw prompt when
//! it fails.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::info;

use crate::config::OpenAiSettings;

#[async_trait]
pub trait PromptEnhancer: Send + Sync {
    async fn enhance(&self, prompt: &str, trigger_word: &str) -> Result<String>;
}

pub struct OpenAiClient {
    http: Client,
    settings: OpenAiSettings,
}

impl OpenAiClient {
    pub fn new(settings: OpenAiSettings, timeout_seconds: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, settings })
    }

    fn system_message(trigger_word: &str) -> String {
        format!(
            "You are an expert at writing prompts for FLUX image generation models.\n\
             \n\
             Your task is to enhance user prompts to work optimally with FLUX, while \
             incorporating the trigger word \"{trigger_word}\" naturally into the prompt.\n\
             \n\
             Guidelines:\n\
             1. The trigger word \"{trigger_word}\" MUST be included in the enhanced prompt\n\
             2. Make the prompt detailed and descriptive\n\
             3. Include relevant art style, lighting, composition details\n\
             4. Keep it concise but effective (max 200 words)\n\
             5. Focus on visual elements and artistic quality\n\
             6. Return ONLY the enhanced prompt text, nothing else"
        )
    }
}

#[async_trait]
impl PromptEnhancer for OpenAiClient {
    async fn enhance(&self, prompt: &str, trigger_word: &str) -> Result<String> {
        info!(trigger_word, "enhancing prompt");

        let body = json!({
            "model": self.settings.model,
            "messages": [
                { "role": "system", "content": Self::system_message(trigger_word) },
                { "role": "user", "content": prompt },
            ],
            "temperature": 0.7,
            "max_tokens": 300,
        });

        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .context("Prompt enhancement request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED {
                bail!(
                    "Prompt enhancement authentication failed (401). Verify the configured \
                     OpenAI API key. Response: {body}"
                );
            }
            bail!("Prompt enhancement request failed with HTTP {status}: {body}");
        }

        let payload: Value = response
            .json()
            .await
            .context("Failed to decode prompt enhancement response")?;
        let enhanced = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default();
        if enhanced.is_empty() {
            bail!("Prompt enhancement returned an empty response");
        }

        info!(
            original_len = prompt.len(),
            enhanced_len = enhanced.len(),
            "prompt enhanced"
        );
        Ok(enhanced.to_string())
    }
}
