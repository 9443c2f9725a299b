//! Training lifecycle reconciliation.
//!
//! The authoritative state lives in the provider; the local record mirrors
//! it. Two uncoordinated drivers feed the same record: client-triggered polls
//! and provider-pushed webhooks. Both go through [`apply_observation`] and a
//! token-guarded write, so the record store is the sole arbiter of the race.
//! Side effects (notification, ledger block) fire exactly once, on the write
//! that carried the transition into a terminal state.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    error::ApiError,
    ledger,
    models::{TrainingJob, TrainingStatus},
    notify::{MessageKind, NotificationMessage},
    replicate::WebhookPayload,
    store::{self, trainings_partition, StoreError, REMOTE_INDEX_PARTITION},
    Deps,
};

/// One status report from the provider, via poll or webhook.
#[derive(Debug, Clone)]
pub struct Observation {
    pub status: TrainingStatus,
    /// Opaque `namespace:version` token, present on success.
    pub version_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing new: same status, no additional data. Must not re-emit side
    /// effects.
    NoChange,
    /// Moved between non-terminal states or picked up new data.
    Progressed,
    /// Entered a terminal state.
    Completed(TrainingStatus),
}

/// Extracts the version number from a `namespace:version` token. Tokens
/// without a separator are taken whole.
pub fn split_version_token(token: &str) -> &str {
    match token.split_once(':') {
        Some((_, version)) if !version.is_empty() => version,
        _ => token,
    }
}

/// Applies one observation to the local record. Terminal records absorb every
/// further observation.
pub fn apply_observation(
    job: &mut TrainingJob,
    observation: &Observation,
    now: DateTime<Utc>,
) -> Transition {
    if job.status.is_terminal() {
        return Transition::NoChange;
    }

    let incoming_version = match (observation.status, observation.version_token.as_deref()) {
        (TrainingStatus::Succeeded, Some(token)) => Some(split_version_token(token).to_string()),
        _ => None,
    };

    let status_changed = observation.status != job.status;
    let version_changed =
        incoming_version.is_some() && incoming_version != job.model_version;
    if !status_changed && !version_changed {
        return Transition::NoChange;
    }

    job.status = observation.status;
    if let Some(version) = incoming_version {
        job.model_version = Some(version);
    }
    if observation.status.is_terminal() {
        job.completed_at = Some(now);
        Transition::Completed(observation.status)
    } else {
        Transition::Progressed
    }
}

/// Poll driver: refreshes a non-terminal record from the provider and returns
/// the current view. A provider failure keeps the local record (logged, not
/// surfaced); a lost write race defers to the competing writer.
pub async fn refresh_training(
    deps: &Deps,
    user_id: &str,
    training_id: &str,
) -> Result<TrainingJob, ApiError> {
    let partition = trainings_partition(user_id);
    let Some((mut job, token)) =
        store::get_typed::<TrainingJob>(deps.records.as_ref(), &partition, training_id).await?
    else {
        return Err(ApiError::NotFound(format!(
            "Training {training_id} not found"
        )));
    };

    if job.status.is_terminal() {
        return Ok(job);
    }

    let remote = match deps.trainer.get_status(training_id).await {
        Ok(remote) => remote,
        Err(err) => {
            warn!(training_id, "failed to poll provider status: {err}");
            return Ok(job);
        }
    };
    let Some(status) = TrainingStatus::from_provider(&remote.status) else {
        warn!(training_id, status = %remote.status, "provider returned an unrecognized training status");
        return Ok(job);
    };
    let observation = Observation {
        status,
        version_token: remote.output.and_then(|output| output.version),
    };

    let transition = apply_observation(&mut job, &observation, Utc::now());
    if transition == Transition::NoChange {
        return Ok(job);
    }

    match store::update_typed(deps.records.as_ref(), &partition, training_id, &job, token).await {
        Ok(_) => {
            info!(training_id, status = %job.status, "training status updated by poll");
            emit_transition_effects(deps, &job, transition).await;
            Ok(job)
        }
        Err(StoreError::VersionConflict { .. }) => {
            // A webhook (or another poll) got there first; its write owns the
            // side effects.
            info!(training_id, "concurrent writer won the status update, re-reading");
            match store::get_typed::<TrainingJob>(deps.records.as_ref(), &partition, training_id)
                .await?
            {
                Some((fresh, _)) => Ok(fresh),
                None => Err(ApiError::NotFound(format!(
                    "Training {training_id} not found"
                ))),
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Webhook driver. Every failure is logged and swallowed: the provider must
/// see a success response, or it would retry-storm the endpoint.
pub async fn apply_webhook(deps: &Deps, payload: &WebhookPayload) {
    if let Err(err) = try_apply_webhook(deps, payload).await {
        warn!(remote_id = %payload.id, "webhook reconciliation failed: {err}");
    }
}

async fn try_apply_webhook(deps: &Deps, payload: &WebhookPayload) -> Result<(), ApiError> {
    let Some((index, _)) = store::get_typed::<crate::models::RemoteIndexEntry>(
        deps.records.as_ref(),
        REMOTE_INDEX_PARTITION,
        &payload.id,
    )
    .await?
    else {
        warn!(remote_id = %payload.id, "no local training known for webhook delivery");
        return Ok(());
    };

    let partition = trainings_partition(&index.user_id);
    let Some((mut job, token)) =
        store::get_typed::<TrainingJob>(deps.records.as_ref(), &partition, &payload.id).await?
    else {
        warn!(remote_id = %payload.id, user_id = %index.user_id, "remote-index entry points at a missing training record");
        return Ok(());
    };

    let Some(status) = TrainingStatus::from_provider(&payload.status) else {
        warn!(remote_id = %payload.id, status = %payload.status, "webhook carried an unrecognized status");
        return Ok(());
    };
    let observation = Observation {
        status,
        version_token: payload
            .output
            .as_ref()
            .and_then(|output| output.version.clone()),
    };

    let transition = apply_observation(&mut job, &observation, Utc::now());
    if transition == Transition::NoChange {
        debug!(remote_id = %payload.id, "webhook carried no effective change");
        return Ok(());
    }

    match store::update_typed(deps.records.as_ref(), &partition, &payload.id, &job, token).await {
        Ok(_) => {
            info!(remote_id = %payload.id, status = %job.status, "training status updated by webhook");
            emit_transition_effects(deps, &job, transition).await;
            Ok(())
        }
        Err(StoreError::VersionConflict { .. }) => {
            info!(remote_id = %payload.id, "concurrent writer won the webhook update");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Terminal-transition side effects: one notification and one ledger block.
/// Both channels are non-authoritative, so their failures are only logged.
async fn emit_transition_effects(deps: &Deps, job: &TrainingJob, transition: Transition) {
    let Transition::Completed(status) = transition else {
        return;
    };

    let message = match status {
        TrainingStatus::Succeeded => {
            let version = job.model_version.as_deref().unwrap_or("unknown");
            NotificationMessage {
                user_id: job.user_id.clone(),
                text: format!(
                    "✅ Training complete!\n\nModel: {}\nVersion: {version}\n\nYou can now generate images!",
                    job.model_ref
                ),
                image_url: None,
                message_type: MessageKind::TrainingComplete,
                metadata: [
                    ("TrainingId".to_string(), job.training_id.clone()),
                    ("ModelVersion".to_string(), version.to_string()),
                ]
                .into(),
            }
        }
        TrainingStatus::Canceled => NotificationMessage {
            user_id: job.user_id.clone(),
            text: "⚠️ Training was canceled before it finished.".to_string(),
            image_url: None,
            message_type: MessageKind::TrainingComplete,
            metadata: [("TrainingId".to_string(), job.training_id.clone())].into(),
        },
        _ => NotificationMessage {
            user_id: job.user_id.clone(),
            text: "❌ Training failed. Please try again or contact support.".to_string(),
            image_url: None,
            message_type: MessageKind::TrainingComplete,
            metadata: [("TrainingId".to_string(), job.training_id.clone())].into(),
        },
    };
    if let Err(err) = deps.notifier.send(message).await {
        warn!(training_id = %job.training_id, "failed to send completion notification: {err:#}");
    }

    if let Err(err) = ledger::append(
        deps.records.as_ref(),
        deps.blobs.as_ref(),
        &job.user_id,
        &ledger::training_completed_block(job),
    )
    .await
    {
        warn!(training_id = %job.training_id, "failed to append completion ledger entry: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateTrainingRequest;
    use crate::notify::MessageKind;
    use crate::provisioning::submit_training;
    use crate::replicate::{RemoteJobStatus, TrainingOutput};
    use crate::testutil::{seed_uploads, TestHarness};

    fn job(status: TrainingStatus) -> TrainingJob {
        TrainingJob {
            user_id: "u1".to_string(),
            training_id: "tr-1".to_string(),
            model_ref: "atelier/flux_u1_123".to_string(),
            status,
            model_version: None,
            archive_path: "u1/archive_x.zip".to_string(),
            trigger_word: "zog".to_string(),
            steps: 800,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn version_token_splits_on_the_first_colon() {
        assert_eq!(split_version_token("ns:v42"), "v42");
        assert_eq!(split_version_token("owner/model:abcdef"), "abcdef");
        assert_eq!(split_version_token("bare-token"), "bare-token");
        assert_eq!(split_version_token("dangling:"), "dangling:");
    }

    #[test]
    fn success_observation_records_version_and_completion() {
        let mut job = job(TrainingStatus::Processing);
        let transition = apply_observation(
            &mut job,
            &Observation {
                status: TrainingStatus::Succeeded,
                version_token: Some("ns:v42".to_string()),
            },
            Utc::now(),
        );
        assert_eq!(transition, Transition::Completed(TrainingStatus::Succeeded));
        assert_eq!(job.model_version.as_deref(), Some("v42"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_records_absorb_every_observation() {
        let mut job = job(TrainingStatus::Failed);
        job.completed_at = Some(Utc::now());
        for status in [
            TrainingStatus::Starting,
            TrainingStatus::Succeeded,
            TrainingStatus::Failed,
        ] {
            let transition = apply_observation(
                &mut job,
                &Observation {
                    status,
                    version_token: Some("ns:v9".to_string()),
                },
                Utc::now(),
            );
            assert_eq!(transition, Transition::NoChange);
        }
        assert_eq!(job.status, TrainingStatus::Failed);
        assert!(job.model_version.is_none());
    }

    #[test]
    fn repeated_observation_is_a_no_op() {
        let mut job = job(TrainingStatus::Processing);
        let transition = apply_observation(
            &mut job,
            &Observation {
                status: TrainingStatus::Processing,
                version_token: None,
            },
            Utc::now(),
        );
        assert_eq!(transition, Transition::NoChange);
    }

    #[test]
    fn non_terminal_progress_is_reported() {
        let mut job = job(TrainingStatus::Starting);
        let transition = apply_observation(
            &mut job,
            &Observation {
                status: TrainingStatus::Processing,
                version_token: None,
            },
            Utc::now(),
        );
        assert_eq!(transition, Transition::Progressed);
        assert!(job.completed_at.is_none());
    }

    async fn provisioned(harness: &TestHarness) {
        seed_uploads(harness, "u1", &[100]).await;
        submit_training(
            &harness.deps,
            &CreateTrainingRequest {
                user_id: "u1".to_string(),
                model_description: "User model".to_string(),
                trigger_word: "zog".to_string(),
                steps: 800,
            },
        )
        .await
        .expect("provisioned");
    }

    #[tokio::test]
    async fn duplicate_webhook_delivery_notifies_once() {
        let harness = TestHarness::new();
        provisioned(&harness).await;

        let payload = crate::replicate::WebhookPayload {
            id: "tr-1".to_string(),
            status: "succeeded".to_string(),
            output: Some(TrainingOutput {
                version: Some("ns:v42".to_string()),
                weights: None,
            }),
            logs: String::new(),
        };
        apply_webhook(&harness.deps, &payload).await;
        apply_webhook(&harness.deps, &payload).await;

        let sent = harness.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, MessageKind::TrainingComplete);
        assert!(sent[0].text.contains("v42"));

        let job = harness.training("u1", "tr-1").await;
        assert_eq!(job.status, TrainingStatus::Succeeded);
        assert_eq!(job.model_version.as_deref(), Some("v42"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn poll_after_webhook_emits_nothing_further() {
        let harness = TestHarness::new();
        provisioned(&harness).await;

        apply_webhook(
            &harness.deps,
            &crate::replicate::WebhookPayload {
                id: "tr-1".to_string(),
                status: "succeeded".to_string(),
                output: Some(TrainingOutput {
                    version: Some("ns:v42".to_string()),
                    weights: None,
                }),
                logs: String::new(),
            },
        )
        .await;

        // Provider would report the same terminal state on a poll, but the
        // terminal record short-circuits before any remote call.
        harness.trainer.set_status(RemoteJobStatus {
            id: "tr-1".to_string(),
            status: "succeeded".to_string(),
            output: Some(TrainingOutput {
                version: Some("ns:v42".to_string()),
                weights: None,
            }),
            logs: String::new(),
        });
        let job = refresh_training(&harness.deps, "u1", "tr-1")
            .await
            .expect("refresh");
        assert_eq!(job.status, TrainingStatus::Succeeded);
        assert_eq!(harness.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn poll_updates_and_notifies_on_failure_transition() {
        let harness = TestHarness::new();
        provisioned(&harness).await;

        harness.trainer.set_status(RemoteJobStatus {
            id: "tr-1".to_string(),
            status: "failed".to_string(),
            output: None,
            logs: String::new(),
        });
        let job = refresh_training(&harness.deps, "u1", "tr-1")
            .await
            .expect("refresh");
        assert_eq!(job.status, TrainingStatus::Failed);
        assert!(job.completed_at.is_some());

        let sent = harness.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("failed"));

        let ledger_doc = harness.document("u1").await;
        assert!(ledger_doc.contains("Training tr-1 failed"));
    }

    #[tokio::test]
    async fn provider_poll_failure_serves_the_local_record() {
        let harness = TestHarness::new();
        provisioned(&harness).await;

        harness.trainer.fail_next_status();
        let job = refresh_training(&harness.deps, "u1", "tr-1")
            .await
            .expect("refresh despite provider failure");
        assert_eq!(job.status, TrainingStatus::Starting);
        assert!(harness.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn webhook_for_an_unknown_remote_id_is_swallowed() {
        let harness = TestHarness::new();
        apply_webhook(
            &harness.deps,
            &crate::replicate::WebhookPayload {
                id: "tr-unknown".to_string(),
                status: "succeeded".to_string(),
                output: None,
                logs: String::new(),
            },
        )
        .await;
        assert!(harness.notifier.sent().is_empty());
    }
}
