//! Image generation against a completed training.
//!
//! The record is written in `processing` before the remote call so an
//! in-flight generation is always discoverable, and finalized exactly once at
//! the end of the call, whichever branch ran. Generation is synchronous: the
//! provider call blocks until it answers, there is no reconciler path here.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    ledger,
    models::{
        GenerateRequest, GenerateResponse, GenerationJob, GenerationStatus, TrainingJob,
        TrainingStatus,
    },
    notify::{MessageKind, NotificationMessage},
    replicate::{GenerationInput, PredictionResult},
    store::{self, generations_partition, trainings_partition},
    Deps,
};

/// Best-effort seed extraction from the provider's free-text log. The format
/// is not contractual; when it drifts this returns `None` rather than failing
/// the generation.
pub fn extract_seed_from_logs(logs: &str) -> Option<i64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"Using seed:\s*(\d+)").expect("seed pattern compiles"));
    pattern
        .captures(logs)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

pub async fn generate_image(
    deps: &Deps,
    request: &GenerateRequest,
) -> Result<GenerateResponse, ApiError> {
    let user_id = request.user_id.trim();

    let Some((training, _)) = store::get_typed::<TrainingJob>(
        deps.records.as_ref(),
        &trainings_partition(user_id),
        &request.training_id,
    )
    .await?
    else {
        return Err(ApiError::NotFound("Training not found".to_string()));
    };

    let model_version = match (training.status, training.model_version.as_deref()) {
        (TrainingStatus::Succeeded, Some(version)) if !version.is_empty() => version.to_string(),
        _ => {
            return Err(ApiError::FailedPrecondition(
                "Training is not completed or failed".to_string(),
            ));
        }
    };

    let mut prompt = request.prompt.clone();
    if request.enhance_prompt {
        if let Some(enhancer) = &deps.enhancer {
            match enhancer.enhance(&request.prompt, &training.trigger_word).await {
                Ok(enhanced) => prompt = enhanced,
                Err(err) => {
                    warn!(user_id, "prompt enhancement failed, using the raw prompt: {err:#}");
                }
            }
        }
    }

    // Persisted before the remote call: a crash mid-call leaves a
    // discoverable `processing` record.
    let generation_id = Uuid::new_v4().to_string();
    let mut job = GenerationJob {
        user_id: user_id.to_string(),
        generation_id: generation_id.clone(),
        training_id: request.training_id.clone(),
        model_version: model_version.clone(),
        prompt: prompt.clone(),
        requested_seed: request.seed,
        observed_seed: None,
        status: GenerationStatus::Processing,
        image_path: None,
        remote_prediction_id: None,
        remote_image_url: None,
        created_at: Utc::now(),
        completed_at: None,
    };
    let partition = generations_partition(user_id);
    let token =
        store::put_typed(deps.records.as_ref(), &partition, &generation_id, &job).await?;

    let input = GenerationInput::flux_profile(
        &prompt,
        request.seed,
        &request.aspect_ratio,
        request.num_inference_steps,
    );
    let call = deps.trainer.submit_generation(&model_version, &input).await;

    let mut pipeline_failure: Option<ApiError> = None;
    match &call {
        Ok(prediction) => {
            job.remote_prediction_id = Some(prediction.id.clone());
            if prediction.status.trim() == TrainingStatus::Succeeded.as_str()
                && !prediction.output.is_empty()
            {
                if let Err(err) = finish_success(deps, &mut job, prediction).await {
                    job.status = GenerationStatus::Failed;
                    pipeline_failure = Some(err);
                }
            } else {
                info!(
                    %generation_id,
                    status = %prediction.status,
                    outputs = prediction.output.len(),
                    "generation did not produce an output"
                );
                job.status = GenerationStatus::Failed;
            }
        }
        Err(_) => {
            job.status = GenerationStatus::Failed;
        }
    }

    // Exactly one finalizing write, whichever branch was taken.
    job.completed_at = Some(Utc::now());
    store::update_typed(deps.records.as_ref(), &partition, &generation_id, &job, token).await?;

    if let Err(err) = call {
        return Err(err.into());
    }
    if let Some(err) = pipeline_failure {
        return Err(err);
    }

    Ok(GenerateResponse {
        generation_id,
        status: job.status,
        image_url: job
            .image_path
            .as_deref()
            .map(|path| deps.blobs.public_url(path)),
        seed: job.observed_seed.or(job.requested_seed),
    })
}

async fn finish_success(
    deps: &Deps,
    job: &mut GenerationJob,
    prediction: &PredictionResult,
) -> Result<(), ApiError> {
    let remote_url = prediction.output[0].clone();
    job.remote_image_url = Some(remote_url.clone());
    job.observed_seed = extract_seed_from_logs(&prediction.logs);

    let bytes = deps.fetcher.fetch(&remote_url).await?;
    let image_path = format!("{}/generated/{}.jpg", job.user_id, job.generation_id);
    deps.blobs.put(&image_path, &bytes).await?;

    let prompt_path = format!("{}/generated/{}_prompt.txt", job.user_id, job.generation_id);
    deps.blobs.put(&prompt_path, job.prompt.as_bytes()).await?;

    job.image_path = Some(image_path.clone());
    job.status = GenerationStatus::Succeeded;

    let image_url = deps.blobs.public_url(&image_path);
    if let Err(err) = ledger::append(
        deps.records.as_ref(),
        deps.blobs.as_ref(),
        &job.user_id,
        &ledger::generation_block(job, &image_url),
    )
    .await
    {
        warn!(generation_id = %job.generation_id, "failed to append generation ledger entry: {err}");
    }

    let seed_text = job
        .observed_seed
        .map(|seed| seed.to_string())
        .unwrap_or_default();
    let message = NotificationMessage {
        user_id: job.user_id.clone(),
        text: format!(
            "🎨 Image generated!\n\nPrompt: {}\nSeed: {seed_text}",
            job.prompt
        ),
        image_url: Some(image_url),
        message_type: MessageKind::GenerationComplete,
        metadata: [
            ("GenerationId".to_string(), job.generation_id.clone()),
            ("Seed".to_string(), seed_text),
        ]
        .into(),
    };
    if let Err(err) = deps.notifier.send(message).await {
        warn!(generation_id = %job.generation_id, "failed to send generation notification: {err:#}");
    }

    info!(
        generation_id = %job.generation_id,
        image = %image_path,
        seed = ?job.observed_seed,
        "generation finished"
    );
    Ok(())
}
