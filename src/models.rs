use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote training lifecycle. `succeeded`, `failed` and `canceled` are
/// absorbing: once a job reaches one of them no further transition is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Maps a raw provider status string onto the closed set. Anything the
    /// provider sends outside of it is rejected rather than stored as text.
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.trim() {
            "starting" => Some(Self::Starting),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Processing,
    Succeeded,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local mirror of a remote training job, keyed by the remote-assigned id.
/// Never deleted; terminal records are retained as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub user_id: String,
    pub training_id: String,
    /// Remote model handle, `owner/name` on the provider.
    pub model_ref: String,
    pub status: TrainingStatus,
    /// Present only once the job has succeeded.
    pub model_version: Option<String>,
    pub archive_path: String,
    pub trigger_word: String,
    pub steps: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrainingJob {
    pub fn to_status_response(&self) -> TrainingStatusResponse {
        TrainingStatusResponse {
            training_id: self.training_id.clone(),
            model_ref: self.model_ref.clone(),
            status: self.status,
            model_version: self.model_version.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Generation record. Created in `processing` before the remote call is made
/// so an in-flight generation stays discoverable, and finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub user_id: String,
    pub generation_id: String,
    pub training_id: String,
    pub model_version: String,
    pub prompt: String,
    pub requested_seed: Option<i64>,
    /// Seed the provider actually used, scraped from its logs.
    pub observed_seed: Option<i64>,
    pub status: GenerationStatus,
    pub image_path: Option<String>,
    pub remote_prediction_id: Option<String>,
    pub remote_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-user submission guard and "most recent training" pointer. Reserved
/// (`Pending`) before any remote call, activated with the remote id after
/// persistence. The conditional create/update on this record is what makes
/// the duplicate-submission check atomic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TrainingSlot {
    Idle,
    Pending { reserved_at: DateTime<Utc> },
    Active { training_id: String },
}

/// Secondary index entry: remote job id -> owning user. Written alongside the
/// TrainingJob so webhook deliveries can resolve the record without a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIndexEntry {
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// API payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<serde_json::Value> {
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadImagesRequest {
    pub user_id: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImageInfo {
    pub file_name: String,
    pub size_bytes: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadImagesResponse {
    pub image_count: usize,
    pub uploaded_images: Vec<UploadedImageInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTrainingRequest {
    pub user_id: String,
    #[serde(default = "default_model_description")]
    pub model_description: String,
    #[serde(default = "default_trigger_word")]
    pub trigger_word: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTrainingResponse {
    pub training_id: String,
    pub model_ref: String,
    pub status: TrainingStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatusRequest {
    pub user_id: String,
    #[serde(default)]
    pub training_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatusResponse {
    pub training_id: String,
    pub model_ref: String,
    pub status: TrainingStatus,
    pub model_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub user_id: String,
    pub training_id: String,
    pub prompt: String,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: u32,
    #[serde(default)]
    pub enhance_prompt: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub generation_id: String,
    pub status: GenerationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

fn default_model_description() -> String {
    "User model".to_string()
}

fn default_trigger_word() -> String {
    "TOK".to_string()
}

fn default_steps() -> u32 {
    1000
}

fn default_aspect_ratio() -> String {
    "1:1".to_string()
}

fn default_num_inference_steps() -> u32 {
    28
}
