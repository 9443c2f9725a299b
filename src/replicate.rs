//! Client for the Replicate training/generation API.
//!
//! The provider is treated as an opaque job system: create a model
//! placeholder, submit a training against it, poll a job, run a prediction,
//! cancel a job. Wire field names follow the provider's snake_case JSON.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::ReplicateSettings;

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com/v1";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(
        "Provider authentication failed (HTTP {status}). Verify that the configured \
         Replicate API key is correct; keys start with 'r8_'. Response: {body}"
    )]
    Auth { status: u16, body: String },

    #[error("Provider request failed with HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Failed to decode provider response: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct CreateModelBody {
    owner: String,
    name: String,
    description: String,
    visibility: &'static str,
    hardware: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedModel {
    pub owner: String,
    pub name: String,
}

/// Fixed FLUX LoRA hyperparameter profile. Only the trigger word and step
/// count are caller-supplied; everything else is a constant of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingInput {
    pub steps: u32,
    pub lora_rank: u32,
    pub optimizer: String,
    pub batch_size: u32,
    pub resolution: String,
    pub autocaption: bool,
    pub autocaption_prefix: String,
    pub input_images: String,
    pub trigger_word: String,
    pub learning_rate: f64,
    pub wandb_project: String,
    pub wandb_save_interval: u32,
    pub wandb_sample_interval: u32,
    pub caption_dropout_rate: f64,
    pub cache_latents_to_disk: bool,
}

impl TrainingInput {
    pub fn flux_profile(archive_url: &str, trigger_word: &str, steps: u32) -> Self {
        Self {
            steps,
            lora_rank: 16,
            optimizer: "adamw8bit".to_string(),
            batch_size: 1,
            resolution: "512,768,1024".to_string(),
            autocaption: true,
            autocaption_prefix: format!("a photo of {trigger_word}"),
            input_images: archive_url.to_string(),
            trigger_word: trigger_word.to_string(),
            learning_rate: 0.0004,
            wandb_project: "flux_train_replicate".to_string(),
            wandb_save_interval: 100,
            wandb_sample_interval: 100,
            caption_dropout_rate: 0.05,
            cache_latents_to_disk: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct TrainBody<'a> {
    destination: &'a str,
    input: &'a TrainingInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedJob {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainingOutput {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub weights: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteJobStatus {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Option<TrainingOutput>,
    #[serde(default)]
    pub logs: String,
}

/// Fixed generation parameter profile around the caller's prompt, seed,
/// aspect ratio and step count.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationInput {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    pub lora_scale: f64,
    pub num_outputs: u32,
    pub aspect_ratio: String,
    pub output_format: String,
    pub guidance_scale: f64,
    pub output_quality: u32,
    pub prompt_strength: f64,
    pub extra_lora_scale: f64,
    pub num_inference_steps: u32,
}

impl GenerationInput {
    pub fn flux_profile(
        prompt: &str,
        seed: Option<i64>,
        aspect_ratio: &str,
        num_inference_steps: u32,
    ) -> Self {
        Self {
            model: "dev".to_string(),
            prompt: prompt.to_string(),
            seed,
            lora_scale: 1.0,
            num_outputs: 1,
            aspect_ratio: aspect_ratio.to_string(),
            output_format: "jpg".to_string(),
            guidance_scale: 3.5,
            output_quality: 90,
            prompt_strength: 0.8,
            extra_lora_scale: 1.0,
            num_inference_steps,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PredictionBody<'a> {
    version: &'a str,
    input: &'a GenerationInput,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionResult {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub logs: String,
}

/// Inbound provider push, identified by the remote job id. On success the
/// output carries the opaque `namespace:version` token.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Option<TrainingOutput>,
    #[serde(default)]
    pub logs: String,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TrainerClient: Send + Sync {
    async fn create_model(
        &self,
        name: &str,
        description: &str,
    ) -> Result<CreatedModel, ProviderError>;

    async fn submit_training(
        &self,
        destination: &str,
        input: &TrainingInput,
    ) -> Result<SubmittedJob, ProviderError>;

    async fn get_status(&self, job_id: &str) -> Result<RemoteJobStatus, ProviderError>;

    /// Synchronous prediction: the call blocks until the provider answers.
    async fn submit_generation(
        &self,
        version: &str,
        input: &GenerationInput,
    ) -> Result<PredictionResult, ProviderError>;

    /// Provider-side cancellation. Exposed, but not part of any local
    /// lifecycle transition.
    async fn cancel(&self, job_id: &str) -> Result<(), ProviderError>;
}

/// Opaque byte download (source images, generated artifacts).
#[async_trait]
pub trait ByteFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct ReplicateClient {
    http: Client,
    settings: ReplicateSettings,
}

impl ReplicateClient {
    pub fn new(settings: ReplicateSettings, timeout_seconds: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.settings.base_url.trim_end_matches('/'))
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED {
                return Err(ProviderError::Auth {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
        wait: bool,
    ) -> Result<T, ProviderError> {
        let mut request = self
            .http
            .post(url)
            .bearer_auth(&self.settings.api_key)
            .json(body);
        if wait {
            request = request.header("Prefer", "wait");
        }
        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Self::decode(response).await
    }
}

#[async_trait]
impl TrainerClient for ReplicateClient {
    async fn create_model(
        &self,
        name: &str,
        description: &str,
    ) -> Result<CreatedModel, ProviderError> {
        info!(model = name, "creating provider model");
        let body = CreateModelBody {
            owner: self.settings.owner.clone(),
            name: name.to_string(),
            description: description.to_string(),
            visibility: "private",
            hardware: "cpu",
        };
        let created: CreatedModel = self.post_json(&self.url("models"), &body, false).await?;
        info!(model = %format!("{}/{}", created.owner, created.name), "provider model created");
        Ok(created)
    }

    async fn submit_training(
        &self,
        destination: &str,
        input: &TrainingInput,
    ) -> Result<SubmittedJob, ProviderError> {
        info!(destination, "submitting training");
        let url = self.url(&format!(
            "models/{}/versions/{}/trainings",
            self.settings.trainer_model, self.settings.trainer_version
        ));
        let body = TrainBody {
            destination,
            input,
            webhook: self.settings.webhook_url.as_deref(),
        };
        let submitted: SubmittedJob = self.post_json(&url, &body, false).await?;
        info!(training_id = %submitted.id, status = %submitted.status, "training submitted");
        Ok(submitted)
    }

    async fn get_status(&self, job_id: &str) -> Result<RemoteJobStatus, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("predictions/{job_id}")))
            .bearer_auth(&self.settings.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Self::decode(response).await
    }

    async fn submit_generation(
        &self,
        version: &str,
        input: &GenerationInput,
    ) -> Result<PredictionResult, ProviderError> {
        info!(version, prompt = %input.prompt, "submitting generation");
        let body = PredictionBody { version, input };
        self.post_json(&self.url("predictions"), &body, true).await
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ProviderError> {
        info!(job_id, "canceling remote job");
        let response = self
            .http
            .post(self.url(&format!("predictions/{job_id}/cancel")))
            .bearer_auth(&self.settings.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ByteFetcher for ReplicateClient {
    // Unauthenticated: fetched URLs are arbitrary hosts, not the provider
    // API, and must not see the bearer token.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("Download of {url} was refused"))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }
}
