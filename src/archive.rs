//! Training archive assembly: every blob under the user's upload prefix is
//! bundled into one deflate-compressed zip and stored back at the root of the
//! user's area. Zero source images fail the submission before any remote call.

use std::io::{Cursor, Write};

use anyhow::Context;
use chrono::Utc;
use tracing::info;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{blob::BlobStore, dedup::upload_prefix, error::ApiError};

#[derive(Debug)]
pub struct ArchiveInfo {
    pub path: String,
    pub image_count: usize,
}

pub async fn build_upload_archive(
    blobs: &dyn BlobStore,
    user_id: &str,
) -> Result<ArchiveInfo, ApiError> {
    let prefix = upload_prefix(user_id);
    let entries = blobs.list(&prefix).await?;
    if entries.is_empty() {
        return Err(ApiError::Validation(format!(
            "No images found in {prefix}"
        )));
    }

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut cursor);
    let options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut image_count = 0usize;
    for entry in &entries {
        let bytes = blobs
            .get(&entry.path)
            .await?
            .with_context(|| format!("Upload blob vanished while archiving: {}", entry.path))?;
        let file_name = entry
            .path
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(entry.path.as_str());
        writer
            .start_file(file_name, options)
            .with_context(|| format!("Failed to add {file_name} to archive"))?;
        writer
            .write_all(&bytes)
            .with_context(|| format!("Failed to write {file_name} into archive"))?;
        image_count += 1;
    }
    writer.finish().context("Failed to finalize archive")?;

    let path = format!("{user_id}/archive_{}.zip", Utc::now().format("%Y%m%d%H%M%S"));
    blobs.put(&path, &cursor.into_inner()).await?;

    info!(user_id, archive = %path, image_count, "upload archive created");
    Ok(ArchiveInfo { path, image_count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[tokio::test]
    async fn zero_uploads_fail_without_writing_anything() {
        let blobs = MemoryBlobStore::new();
        let err = build_upload_archive(&blobs, "u1").await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert!(blobs.list("u1/").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn bundles_every_upload_into_one_zip() {
        let blobs = MemoryBlobStore::new();
        blobs.put("u1/upload/one.jpg", &[1u8; 64]).await.expect("put");
        blobs.put("u1/upload/two.jpg", &[2u8; 128]).await.expect("put");

        let info = build_upload_archive(&blobs, "u1").await.expect("archive");
        assert_eq!(info.image_count, 2);
        assert!(info.path.starts_with("u1/archive_"));
        assert!(info.path.ends_with(".zip"));

        let bytes = blobs
            .get(&info.path)
            .await
            .expect("get")
            .expect("archive stored");
        let mut zip =
            zip::ZipArchive::new(Cursor::new(bytes)).expect("stored bytes are a zip archive");
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).expect("entry").name().to_string())
            .collect();
        assert_eq!(names, vec!["one.jpg", "two.jpg"]);
    }
}
