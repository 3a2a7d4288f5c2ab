//! Flat-file attachment storage. Each blob lives at `{dir}/{blob_id}` and
//! is served by the HTTP layer under a public base URL.

use std::path::PathBuf;

use anyhow::{Result, bail};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use corridor_types::models::Attachment;

pub struct BlobStore {
    dir: PathBuf,
    public_base: String,
    max_bytes: u64,
}

impl BlobStore {
    pub async fn new(dir: PathBuf, public_base: impl Into<String>, max_bytes: u64) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_base: public_base.into().trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn blob_path(&self, blob_id: &Uuid) -> PathBuf {
        self.dir.join(blob_id.to_string())
    }

    /// Store a blob and return the attachment record to embed in a message.
    /// Nothing is written if the payload exceeds the size cap.
    pub async fn put(&self, file_name: &str, mime_type: &str, data: &[u8]) -> Result<Attachment> {
        if data.len() as u64 > self.max_bytes {
            bail!(
                "attachment {} is {} bytes, cap is {}",
                file_name,
                data.len(),
                self.max_bytes
            );
        }

        let blob_id = Uuid::new_v4();
        fs::write(self.blob_path(&blob_id), data).await?;

        Ok(Attachment {
            url: format!("{}/{}", self.public_base, blob_id),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            byte_size: data.len() as u64,
        })
    }

    /// Remove the blob behind an attachment URL. Missing files are fine,
    /// double deletes happen under races with cleanup.
    pub async fn delete(&self, url: &str) -> Result<()> {
        let blob_id = match url.rsplit('/').next().and_then(|s| s.parse::<Uuid>().ok()) {
            Some(id) => id,
            None => bail!("not a blob url: {url}"),
        };

        match fs::remove_file(self.blob_path(&blob_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Blob {} already gone", blob_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(max_bytes: u64) -> (tempfile::TempDir, BlobStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::new(tmp.path().join("blobs"), "/blobs", max_bytes)
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn put_writes_the_bytes_and_builds_the_url() {
        let (tmp, store) = store(1024).await;

        let att = store
            .put("scan.pdf", "application/pdf", b"not really a pdf")
            .await
            .unwrap();

        assert!(att.url.starts_with("/blobs/"));
        assert_eq!(att.file_name, "scan.pdf");
        assert_eq!(att.byte_size, 16);

        let blob_id = att.url.rsplit('/').next().unwrap();
        let on_disk = std::fs::read(tmp.path().join("blobs").join(blob_id)).unwrap();
        assert_eq!(on_disk, b"not really a pdf");
    }

    #[tokio::test]
    async fn oversized_payloads_are_rejected_without_writing() {
        let (tmp, store) = store(8).await;

        assert!(store.put("big.bin", "application/octet-stream", &[0u8; 9]).await.is_err());

        let entries = std::fs::read_dir(tmp.path().join("blobs")).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn delete_tolerates_missing_blobs() {
        let (_tmp, store) = store(1024).await;

        let att = store.put("note.txt", "text/plain", b"x").await.unwrap();
        store.delete(&att.url).await.unwrap();
        store.delete(&att.url).await.unwrap();

        assert!(store.delete("/blobs/not-a-uuid").await.is_err());
    }
}
