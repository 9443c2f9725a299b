//! Training submission pipeline.
//!
//! Order matters: the per-user training slot is reserved first (a conditional
//! create or token-guarded update, so two racing submissions cannot both pass
//! the duplicate check), then the archive is assembled, the remote model
//! created and the training submitted, and only then is the local record
//! persisted together with the remote-id index and the slot activation.
//! Failures before persistence roll the reservation back; failures after a
//! successful remote submission are surfaced and leave the remote training
//! orphaned (no automatic healing).

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{error, info, warn};

use crate::{
    archive::build_upload_archive,
    error::ApiError,
    ledger,
    models::{
        CreateTrainingRequest, CreateTrainingResponse, RemoteIndexEntry, TrainingJob,
        TrainingSlot, TrainingStatus,
    },
    replicate::TrainingInput,
    store::{
        self, control_partition, trainings_partition, RecordStore, RecordToken, StoreError,
        REMOTE_INDEX_PARTITION, TRAINING_SLOT_KEY,
    },
    Deps,
};

/// A `Pending` reservation older than this is treated as the residue of a
/// crashed submission and may be reclaimed.
const STALE_RESERVATION_MINUTES: i64 = 15;

struct SlotReservation {
    prior: TrainingSlot,
    token: RecordToken,
}

pub async fn submit_training(
    deps: &Deps,
    request: &CreateTrainingRequest,
) -> Result<CreateTrainingResponse, ApiError> {
    let user_id = request.user_id.trim();
    let reservation = reserve_training_slot(deps.records.as_ref(), user_id).await?;

    match provision(deps, user_id, request, &reservation).await {
        Ok(response) => Ok(response),
        Err(err) => {
            release_training_slot(deps.records.as_ref(), user_id, reservation).await;
            Err(err)
        }
    }
}

/// Resolves the user's most recent training id from the slot marker.
pub async fn latest_training_id(
    records: &dyn RecordStore,
    user_id: &str,
) -> Result<Option<String>, ApiError> {
    let slot =
        store::get_typed::<TrainingSlot>(records, &control_partition(user_id), TRAINING_SLOT_KEY)
            .await?;
    Ok(match slot {
        Some((TrainingSlot::Active { training_id }, _)) => Some(training_id),
        _ => None,
    })
}

async fn reserve_training_slot(
    records: &dyn RecordStore,
    user_id: &str,
) -> Result<SlotReservation, ApiError> {
    let partition = control_partition(user_id);
    let pending = TrainingSlot::Pending {
        reserved_at: Utc::now(),
    };

    let Some((slot, token)) =
        store::get_typed::<TrainingSlot>(records, &partition, TRAINING_SLOT_KEY).await?
    else {
        return match store::put_typed(records, &partition, TRAINING_SLOT_KEY, &pending).await {
            Ok(token) => Ok(SlotReservation {
                prior: TrainingSlot::Idle,
                token,
            }),
            Err(StoreError::AlreadyExists { .. }) => Err(ApiError::SubmissionInFlight),
            Err(err) => Err(err.into()),
        };
    };

    let prior = match &slot {
        TrainingSlot::Idle => TrainingSlot::Idle,
        TrainingSlot::Pending { reserved_at } => {
            if Utc::now() - *reserved_at < Duration::minutes(STALE_RESERVATION_MINUTES) {
                return Err(ApiError::SubmissionInFlight);
            }
            warn!(user_id, "reclaiming stale training-slot reservation");
            TrainingSlot::Idle
        }
        TrainingSlot::Active { training_id } => {
            let job = store::get_typed::<TrainingJob>(
                records,
                &trainings_partition(user_id),
                training_id,
            )
            .await?;
            if let Some((job, _)) = job {
                if !job.status.is_terminal() {
                    return Err(ApiError::TrainingInFlight {
                        training_id: training_id.clone(),
                        status: job.status.to_string(),
                    });
                }
            }
            slot.clone()
        }
    };

    match store::update_typed(records, &partition, TRAINING_SLOT_KEY, &pending, token).await {
        Ok(token) => Ok(SlotReservation { prior, token }),
        Err(StoreError::VersionConflict { .. }) => Err(ApiError::SubmissionInFlight),
        Err(err) => Err(err.into()),
    }
}

async fn release_training_slot(
    records: &dyn RecordStore,
    user_id: &str,
    reservation: SlotReservation,
) {
    if let Err(err) = store::update_typed(
        records,
        &control_partition(user_id),
        TRAINING_SLOT_KEY,
        &reservation.prior,
        reservation.token,
    )
    .await
    {
        // The reservation stays pending until the staleness window expires.
        warn!(user_id, "failed to release training slot: {err}");
    }
}

async fn provision(
    deps: &Deps,
    user_id: &str,
    request: &CreateTrainingRequest,
    reservation: &SlotReservation,
) -> Result<CreateTrainingResponse, ApiError> {
    let archive = build_upload_archive(deps.blobs.as_ref(), user_id).await?;
    let archive_url = deps.blobs.public_url(&archive.path);

    let disambiguator: u32 = rand::rng().random_range(100..1000);
    let model_name = format!("flux_{user_id}_{disambiguator}");
    let created = deps
        .trainer
        .create_model(&model_name, &request.model_description)
        .await?;
    let model_ref = format!("{}/{}", created.owner, created.name);

    let input = TrainingInput::flux_profile(&archive_url, &request.trigger_word, request.steps);
    let submitted = deps.trainer.submit_training(&model_ref, &input).await?;

    let status = TrainingStatus::from_provider(&submitted.status).unwrap_or_else(|| {
        warn!(
            training_id = %submitted.id,
            status = %submitted.status,
            "provider returned an unrecognized submission status, recording as starting"
        );
        TrainingStatus::Starting
    });
    let job = TrainingJob {
        user_id: user_id.to_string(),
        training_id: submitted.id.clone(),
        model_ref: model_ref.clone(),
        status,
        model_version: None,
        archive_path: archive.path.clone(),
        trigger_word: request.trigger_word.clone(),
        steps: request.steps,
        created_at: Utc::now(),
        completed_at: None,
    };

    // From here on a failure leaves an orphaned remote training: the error is
    // surfaced to the caller and the divergence is not reconciled locally.
    let persisted = persist_training(deps, &job, reservation).await;
    if let Err(err) = &persisted {
        error!(
            user_id,
            training_id = %job.training_id,
            "remote training submitted but local persistence failed, remote job is orphaned: {err}"
        );
    }
    persisted?;

    if let Err(err) = ledger::append(
        deps.records.as_ref(),
        deps.blobs.as_ref(),
        user_id,
        &ledger::training_submitted_block(&job, &archive_url),
    )
    .await
    {
        error!(user_id, training_id = %job.training_id, "failed to record training submission in ledger: {err}");
        return Err(err.into());
    }

    info!(
        user_id,
        training_id = %job.training_id,
        model = %model_ref,
        images = archive.image_count,
        "training provisioned"
    );
    Ok(CreateTrainingResponse {
        training_id: job.training_id,
        model_ref,
        status: job.status,
    })
}

async fn persist_training(
    deps: &Deps,
    job: &TrainingJob,
    reservation: &SlotReservation,
) -> Result<(), ApiError> {
    // Index first: a dangling index entry only costs the webhook path a
    // failed record lookup, while a job without an index entry would never
    // see its webhooks.
    store::put_typed(
        deps.records.as_ref(),
        REMOTE_INDEX_PARTITION,
        &job.training_id,
        &RemoteIndexEntry {
            user_id: job.user_id.clone(),
        },
    )
    .await?;

    store::put_typed(
        deps.records.as_ref(),
        &trainings_partition(&job.user_id),
        &job.training_id,
        job,
    )
    .await?;

    store::update_typed(
        deps.records.as_ref(),
        &control_partition(&job.user_id),
        TRAINING_SLOT_KEY,
        &TrainingSlot::Active {
            training_id: job.training_id.clone(),
        },
        reservation.token,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_uploads, TestHarness};

    fn request(user_id: &str) -> CreateTrainingRequest {
        CreateTrainingRequest {
            user_id: user_id.to_string(),
            model_description: "User model".to_string(),
            trigger_word: "zog".to_string(),
            steps: 800,
        }
    }

    #[tokio::test]
    async fn submission_persists_job_index_and_slot() {
        let harness = TestHarness::new();
        seed_uploads(&harness, "u1", &[100, 200]).await;

        let response = submit_training(&harness.deps, &request("u1"))
            .await
            .expect("submission");
        assert_eq!(response.training_id, "tr-1");
        assert_eq!(response.status, TrainingStatus::Starting);
        assert!(response.model_ref.contains("flux_u1_"));

        let (job, _) = store::get_typed::<TrainingJob>(
            harness.records.as_ref(),
            &trainings_partition("u1"),
            "tr-1",
        )
        .await
        .expect("get")
        .expect("job persisted");
        assert_eq!(job.trigger_word, "zog");
        assert_eq!(job.steps, 800);
        assert!(job.model_version.is_none());

        let (index, _) = store::get_typed::<RemoteIndexEntry>(
            harness.records.as_ref(),
            REMOTE_INDEX_PARTITION,
            "tr-1",
        )
        .await
        .expect("get")
        .expect("index persisted");
        assert_eq!(index.user_id, "u1");

        assert_eq!(
            latest_training_id(harness.records.as_ref(), "u1")
                .await
                .expect("lookup"),
            Some("tr-1".to_string())
        );

        let ledger_doc = harness.document("u1").await;
        assert!(ledger_doc.contains("Training ID: tr-1"));
        assert!(ledger_doc.contains("Trigger Word: zog"));
    }

    #[tokio::test]
    async fn in_flight_training_rejects_a_second_submission() {
        let harness = TestHarness::new();
        seed_uploads(&harness, "u1", &[100]).await;

        submit_training(&harness.deps, &request("u1"))
            .await
            .expect("first submission");

        harness.trainer.set_next_training("tr-2", "starting");
        let err = submit_training(&harness.deps, &request("u1"))
            .await
            .unwrap_err();
        match err {
            ApiError::TrainingInFlight {
                training_id,
                status,
            } => {
                assert_eq!(training_id, "tr-1");
                assert_eq!(status, "starting");
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // And no second record was created.
        assert!(store::get_typed::<TrainingJob>(
            harness.records.as_ref(),
            &trainings_partition("u1"),
            "tr-2",
        )
        .await
        .expect("get")
        .is_none());
    }

    #[tokio::test]
    async fn terminal_training_allows_a_new_submission() {
        let harness = TestHarness::new();
        seed_uploads(&harness, "u1", &[100]).await;

        submit_training(&harness.deps, &request("u1"))
            .await
            .expect("first submission");
        harness.complete_training("u1", "tr-1", TrainingStatus::Failed).await;

        harness.trainer.set_next_training("tr-2", "starting");
        let response = submit_training(&harness.deps, &request("u1"))
            .await
            .expect("second submission");
        assert_eq!(response.training_id, "tr-2");
        assert_eq!(
            latest_training_id(harness.records.as_ref(), "u1")
                .await
                .expect("lookup"),
            Some("tr-2".to_string())
        );
    }

    #[tokio::test]
    async fn zero_uploads_fail_and_release_the_reservation() {
        let harness = TestHarness::new();

        let err = submit_training(&harness.deps, &request("u1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert!(store::get_typed::<TrainingJob>(
            harness.records.as_ref(),
            &trainings_partition("u1"),
            "tr-1",
        )
        .await
        .expect("get")
        .is_none());

        // The reservation was rolled back, so a later submission is allowed.
        seed_uploads(&harness, "u1", &[100]).await;
        submit_training(&harness.deps, &request("u1"))
            .await
            .expect("second attempt");
    }

    #[tokio::test]
    async fn provider_failure_releases_the_reservation() {
        let harness = TestHarness::new();
        seed_uploads(&harness, "u1", &[100]).await;
        harness.trainer.fail_next_submission();

        let err = submit_training(&harness.deps, &request("u1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Provider(_)));

        submit_training(&harness.deps, &request("u1"))
            .await
            .expect("retry after provider failure");
    }
}
