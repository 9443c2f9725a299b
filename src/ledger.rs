//! Per-user activity ledger.
//!
//! The authoritative form is an event log with monotonic sequence numbers,
//! stored as a record under the user's control partition and appended under
//! the same optimistic-concurrency discipline as the job records, so the
//! racing poll and webhook paths cannot lose each other's entries. The
//! human-readable `{user}/index.md` document is rendered from it after every
//! append; it is derived and non-authoritative, so a failed render is only
//! logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    blob::BlobStore,
    models::{GenerationJob, TrainingJob},
    store::{
        self, control_partition, RecordStore, StoreError, LEDGER_KEY,
    },
};

const MAX_APPEND_RETRIES: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub next_seq: u64,
    pub entries: Vec<LedgerEntry>,
}

/// Appends one entry, retrying on token conflicts, and re-renders the
/// markdown document. Returns the sequence number assigned to the entry.
pub async fn append(
    records: &dyn RecordStore,
    blobs: &dyn BlobStore,
    user_id: &str,
    text: &str,
) -> Result<u64, StoreError> {
    let partition = control_partition(user_id);
    for _ in 0..MAX_APPEND_RETRIES {
        match store::get_typed::<LedgerRecord>(records, &partition, LEDGER_KEY).await? {
            Some((mut ledger, token)) => {
                let seq = ledger.next_seq;
                ledger.entries.push(LedgerEntry {
                    seq,
                    at: Utc::now(),
                    text: text.to_string(),
                });
                ledger.next_seq = seq + 1;
                match store::update_typed(records, &partition, LEDGER_KEY, &ledger, token).await {
                    Ok(_) => {
                        render(blobs, user_id, &ledger).await;
                        return Ok(seq);
                    }
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
            None => {
                let ledger = LedgerRecord {
                    next_seq: 1,
                    entries: vec![LedgerEntry {
                        seq: 0,
                        at: Utc::now(),
                        text: text.to_string(),
                    }],
                };
                match store::put_typed(records, &partition, LEDGER_KEY, &ledger).await {
                    Ok(_) => {
                        render(blobs, user_id, &ledger).await;
                        return Ok(0);
                    }
                    Err(StoreError::AlreadyExists { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Err(StoreError::Backend(format!(
        "ledger append for {user_id} exhausted {MAX_APPEND_RETRIES} retries"
    )))
}

async fn render(blobs: &dyn BlobStore, user_id: &str, ledger: &LedgerRecord) {
    let document = render_document(user_id, ledger);
    if let Err(err) = blobs
        .put(&format!("{user_id}/index.md"), document.as_bytes())
        .await
    {
        warn!(user_id, "failed to render ledger document: {err:#}");
    }
}

pub fn render_document(user_id: &str, ledger: &LedgerRecord) -> String {
    let mut document = format!("# User {user_id}\n");
    for entry in &ledger.entries {
        document.push('\n');
        document.push_str(&entry.text);
        document.push('\n');
    }
    document
}

// ---------------------------------------------------------------------------
// Entry blocks
// ---------------------------------------------------------------------------

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn uploads_block(count: usize) -> String {
    format!(
        "## Uploaded Images\n\n- Date: {}\n- Count: {count}",
        stamp(Utc::now())
    )
}

pub fn training_submitted_block(job: &TrainingJob, archive_url: &str) -> String {
    format!(
        "## Training\n\n\
         - Training ID: {}\n\
         - Model ID: {}\n\
         - Status: {}\n\
         - Archive: {archive_url}\n\
         - Trigger Word: {}\n\
         - Steps: {}\n\
         - Started: {}",
        job.training_id,
        job.model_ref,
        job.status,
        job.trigger_word,
        job.steps,
        stamp(job.created_at),
    )
}

pub fn training_completed_block(job: &TrainingJob) -> String {
    format!(
        "## Training {} {}\n\n\
         - Model ID: {}\n\
         - Version: {}\n\
         - Finished: {}",
        job.training_id,
        job.status,
        job.model_ref,
        job.model_version.as_deref().unwrap_or("-"),
        stamp(job.completed_at.unwrap_or_else(Utc::now)),
    )
}

pub fn generation_block(job: &GenerationJob, image_url: &str) -> String {
    let seed = job
        .observed_seed
        .or(job.requested_seed)
        .map(|seed| seed.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "### Generation {}\n\n\
         - Date: {}\n\
         - Prompt: {}\n\
         - Seed: {seed}\n\
         - Image: {image_url}",
        job.generation_id,
        stamp(Utc::now()),
        job.prompt,
    )
}
