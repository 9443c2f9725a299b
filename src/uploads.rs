//! Source-image ingestion. Each URL is fetched, size-checked against the
//! user's existing uploads and stored under the upload prefix. Individual
//! fetch failures are tolerated; the batch only fails when nothing could be
//! fetched at all. A batch consisting entirely of duplicates is a success
//! with zero new blobs.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dedup::{is_duplicate_size, upload_prefix},
    error::ApiError,
    ledger,
    models::UploadedImageInfo,
    Deps,
};

#[derive(Debug)]
pub struct UploadSummary {
    pub stored: usize,
    pub skipped: usize,
    pub images: Vec<UploadedImageInfo>,
}

pub async fn ingest_images(
    deps: &Deps,
    user_id: &str,
    image_urls: &[String],
) -> Result<UploadSummary, ApiError> {
    info!(user_id, count = image_urls.len(), "ingesting source images");

    let batch = Uuid::new_v4().simple().to_string();
    let batch_id = &batch[..8];
    let time_stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

    let mut stored = 0usize;
    let mut skipped = 0usize;
    let mut fetched = 0usize;
    let mut index = 1usize;
    for url in image_urls {
        let bytes = match deps.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%url, "failed to fetch source image: {err:#}");
                continue;
            }
        };
        fetched += 1;

        if is_duplicate_size(deps.blobs.as_ref(), user_id, bytes.len() as u64).await? {
            info!(%url, size = bytes.len(), "skipping image, equivalent size already stored");
            skipped += 1;
            continue;
        }

        let file_name = format!("image_{time_stamp}_{batch_id}_{index:03}.jpg");
        deps.blobs
            .put(&format!("{}{file_name}", upload_prefix(user_id)), &bytes)
            .await?;
        info!(user_id, %file_name, size = bytes.len(), "image stored");
        stored += 1;
        index += 1;
    }

    if fetched == 0 {
        return Err(ApiError::Validation(
            "Failed to download any images".to_string(),
        ));
    }

    let images: Vec<UploadedImageInfo> = deps
        .blobs
        .list(&upload_prefix(user_id))
        .await?
        .into_iter()
        .map(|entry| UploadedImageInfo {
            file_name: entry
                .path
                .rsplit_once('/')
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| entry.path.clone()),
            size_bytes: entry.size,
            url: deps.blobs.public_url(&entry.path),
        })
        .collect();

    if stored > 0 {
        if let Err(err) = ledger::append(
            deps.records.as_ref(),
            deps.blobs.as_ref(),
            user_id,
            &ledger::uploads_block(images.len()),
        )
        .await
        {
            warn!(user_id, "failed to append uploads ledger entry: {err}");
        }
    }

    info!(user_id, stored, skipped, total = images.len(), "image ingestion finished");
    Ok(UploadSummary {
        stored,
        skipped,
        images,
    })
}
