//! Size-fingerprint deduplication for uploaded assets.
//!
//! An incoming image is a near-duplicate if any blob under the user's upload
//! prefix has the exact same byte length. Distinct images sharing a length
//! are falsely skipped; the check never reads content. Read-only, the caller
//! does the write.

use anyhow::Result;

use crate::blob::BlobStore;

pub fn upload_prefix(user_id: &str) -> String {
    format!("{user_id}/upload/")
}

pub async fn is_duplicate_size(
    blobs: &dyn BlobStore,
    user_id: &str,
    size: u64,
) -> Result<bool> {
    let existing = blobs.list(&upload_prefix(user_id)).await?;
    Ok(existing.iter().any(|entry| entry.size == size))
}
