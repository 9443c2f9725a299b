//! In-memory fakes and a harness for exercising the pipelines end to end.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::{
    blob::{BlobStore, MemoryBlobStore},
    models::{TrainingJob, TrainingStatus},
    notify::{Notifier, NotificationMessage},
    openai::PromptEnhancer,
    replicate::{
        ByteFetcher, CreatedModel, GenerationInput, PredictionResult, ProviderError,
        RemoteJobStatus, SubmittedJob, TrainerClient, TrainingInput,
    },
    store::{self, trainings_partition, MemoryRecordStore},
    Deps,
};

/// Scripted stand-in for the remote provider.
#[derive(Default)]
pub struct FakeTrainer {
    next_training: Mutex<(String, String)>,
    fail_submission: Mutex<bool>,
    status: Mutex<Option<RemoteJobStatus>>,
    fail_status: Mutex<bool>,
    generation: Mutex<Option<Result<PredictionResult, ProviderError>>>,
    last_generation_input: Mutex<Option<GenerationInput>>,
}

impl FakeTrainer {
    pub fn new() -> Self {
        let trainer = Self::default();
        trainer.set_next_training("tr-1", "starting");
        trainer
    }

    pub fn set_next_training(&self, id: &str, status: &str) {
        *self.next_training.lock().unwrap() = (id.to_string(), status.to_string());
    }

    pub fn fail_next_submission(&self) {
        *self.fail_submission.lock().unwrap() = true;
    }

    pub fn set_status(&self, status: RemoteJobStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    pub fn fail_next_status(&self) {
        *self.fail_status.lock().unwrap() = true;
    }

    pub fn set_generation(&self, result: Result<PredictionResult, ProviderError>) {
        *self.generation.lock().unwrap() = Some(result);
    }

    pub fn last_generation_input(&self) -> Option<GenerationInput> {
        self.last_generation_input.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrainerClient for FakeTrainer {
    async fn create_model(
        &self,
        name: &str,
        _description: &str,
    ) -> Result<CreatedModel, ProviderError> {
        Ok(CreatedModel {
            owner: "atelier".to_string(),
            name: name.to_string(),
        })
    }

    async fn submit_training(
        &self,
        _destination: &str,
        _input: &TrainingInput,
    ) -> Result<SubmittedJob, ProviderError> {
        if std::mem::take(&mut *self.fail_submission.lock().unwrap()) {
            return Err(ProviderError::Api {
                status: 500,
                body: "training submission refused".to_string(),
            });
        }
        let (id, status) = self.next_training.lock().unwrap().clone();
        Ok(SubmittedJob { id, status })
    }

    async fn get_status(&self, job_id: &str) -> Result<RemoteJobStatus, ProviderError> {
        if std::mem::take(&mut *self.fail_status.lock().unwrap()) {
            return Err(ProviderError::Transport("connection reset".to_string()));
        }
        Ok(self.status.lock().unwrap().clone().unwrap_or(RemoteJobStatus {
            id: job_id.to_string(),
            status: "starting".to_string(),
            output: None,
            logs: String::new(),
        }))
    }

    async fn submit_generation(
        &self,
        _version: &str,
        input: &GenerationInput,
    ) -> Result<PredictionResult, ProviderError> {
        *self.last_generation_input.lock().unwrap() = Some(input.clone());
        match self.generation.lock().unwrap().take() {
            Some(result) => result,
            None => Ok(PredictionResult {
                id: "pred-0".to_string(),
                status: "succeeded".to_string(),
                output: vec!["img://64".to_string()],
                logs: String::new(),
            }),
        }
    }

    async fn cancel(&self, _job_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Resolves `img://<n>` to `n` synthetic bytes; everything else fails.
pub struct FakeFetcher;

#[async_trait]
impl ByteFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let size: usize = url
            .strip_prefix("img://")
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| anyhow!("unreachable url: {url}"))?;
        Ok(vec![7u8; size])
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<NotificationMessage>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NotificationMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: NotificationMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

enum FakeEnhancerMode {
    Fixed(String),
    Failing,
}

struct FakeEnhancer {
    mode: FakeEnhancerMode,
}

#[async_trait]
impl PromptEnhancer for FakeEnhancer {
    async fn enhance(&self, _prompt: &str, _trigger_word: &str) -> Result<String> {
        match &self.mode {
            FakeEnhancerMode::Fixed(text) => Ok(text.clone()),
            FakeEnhancerMode::Failing => Err(anyhow!("enhancer unavailable")),
        }
    }
}

pub struct TestHarness {
    pub deps: Deps,
    pub records: Arc<MemoryRecordStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub trainer: Arc<FakeTrainer>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    pub fn new() -> Self {
        let records = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let trainer = Arc::new(FakeTrainer::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let deps = Deps {
            records: records.clone(),
            blobs: blobs.clone(),
            trainer: trainer.clone(),
            fetcher: Arc::new(FakeFetcher),
            notifier: notifier.clone(),
            enhancer: None,
        };
        Self {
            deps,
            records,
            blobs,
            trainer,
            notifier,
        }
    }

    pub fn with_enhancer(mut self, text: &str) -> Self {
        self.deps.enhancer = Some(Arc::new(FakeEnhancer {
            mode: FakeEnhancerMode::Fixed(text.to_string()),
        }));
        self
    }

    pub fn with_failing_enhancer(mut self) -> Self {
        self.deps.enhancer = Some(Arc::new(FakeEnhancer {
            mode: FakeEnhancerMode::Failing,
        }));
        self
    }

    pub async fn training(&self, user_id: &str, training_id: &str) -> TrainingJob {
        store::get_typed::<TrainingJob>(
            self.records.as_ref(),
            &trainings_partition(user_id),
            training_id,
        )
        .await
        .expect("store read")
        .expect("training record")
        .0
    }

    pub async fn seed_training(
        &self,
        user_id: &str,
        training_id: &str,
        status: TrainingStatus,
        model_version: Option<&str>,
    ) {
        let job = TrainingJob {
            user_id: user_id.to_string(),
            training_id: training_id.to_string(),
            model_ref: format!("atelier/flux_{user_id}_123"),
            status,
            model_version: model_version.map(str::to_string),
            archive_path: format!("{user_id}/archive_seed.zip"),
            trigger_word: "zog".to_string(),
            steps: 800,
            created_at: Utc::now(),
            completed_at: status.is_terminal().then(Utc::now),
        };
        store::put_typed(
            self.records.as_ref(),
            &trainings_partition(user_id),
            training_id,
            &job,
        )
        .await
        .expect("seed training");
    }

    pub async fn complete_training(&self, user_id: &str, training_id: &str, status: TrainingStatus) {
        let partition = trainings_partition(user_id);
        let (mut job, token) =
            store::get_typed::<TrainingJob>(self.records.as_ref(), &partition, training_id)
                .await
                .expect("store read")
                .expect("training record");
        job.status = status;
        job.completed_at = Some(Utc::now());
        store::update_typed(self.records.as_ref(), &partition, training_id, &job, token)
            .await
            .expect("complete training");
    }

    pub async fn generation(
        &self,
        user_id: &str,
        generation_id: &str,
    ) -> crate::models::GenerationJob {
        store::get_typed(
            self.records.as_ref(),
            &store::generations_partition(user_id),
            generation_id,
        )
        .await
        .expect("store read")
        .expect("generation record")
        .0
    }

    pub async fn generations(&self, user_id: &str) -> Vec<crate::models::GenerationJob> {
        let partition = store::generations_partition(user_id);
        let mut jobs = Vec::new();
        for key in self.partition_keys(&partition).await {
            jobs.push(self.generation(user_id, &key).await);
        }
        jobs
    }

    pub async fn generation_count(&self, user_id: &str) -> usize {
        self.partition_keys(&store::generations_partition(user_id))
            .await
            .len()
    }

    pub async fn document(&self, user_id: &str) -> String {
        let bytes = self
            .blobs
            .get(&format!("{user_id}/index.md"))
            .await
            .expect("blob read")
            .expect("ledger document");
        String::from_utf8(bytes).expect("utf8 document")
    }

    async fn partition_keys(&self, partition: &str) -> Vec<String> {
        self.records.keys_in(partition).await
    }
}

pub async fn seed_uploads(harness: &TestHarness, user_id: &str, sizes: &[usize]) {
    for (index, size) in sizes.iter().enumerate() {
        harness
            .blobs
            .put(
                &format!("{user_id}/upload/img_{index:03}.jpg"),
                &vec![0u8; *size],
            )
            .await
            .expect("seed upload");
    }
}
