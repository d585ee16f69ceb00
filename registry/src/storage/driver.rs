//! StorageDriver: the chunked-upload abstraction blob replication and
//! manifest ingestion are built against. A blanket implementation
//! composes the teacher's key/value `Storage` abstraction with the
//! object-name builders in `names`.

use super::names::{blob_object_name, chunk_object_name, manifest_object_name};
use super::{Storage, StorageError};
use async_trait::async_trait;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StorageError>;

/// An in-progress chunked upload, identified by its eventual blob storage
/// id.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    pub storage_id: String,
    pub num_chunks: u64,
    pub size_bytes: u64,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn generate_storage_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    async fn append_to_blob(&self, account_name: &str, storage_id: &str, chunk_number: u64, chunk: &[u8]) -> Result<()>;

    async fn finalize_blob(&self, account_name: &str, storage_id: &str, num_chunks: u64) -> Result<()>;

    async fn abort_blob_upload(&self, account_name: &str, storage_id: &str, num_chunks: u64) -> Result<()>;

    async fn read_blob(&self, account_name: &str, storage_id: &str) -> Result<bytes::Bytes>;

    /// Removes a finalized blob object outright — used to clean up an
    /// orphaned storage object after a post-finalize database failure.
    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<()>;

    async fn write_manifest(&self, account_name: &str, repo_name: &str, digest: &str, content: &[u8]) -> Result<()>;

    async fn read_manifest(&self, account_name: &str, repo_name: &str, digest: &str) -> Result<bytes::Bytes>;

    async fn delete_manifest(&self, account_name: &str, repo_name: &str, digest: &str) -> Result<()>;

    async fn can_setup_account(&self, account_name: &str) -> bool;

    async fn cleanup_account(&self, account_name: &str) -> Result<()>;
}

/// Blanket `StorageDriver` over the key/value `Storage` abstraction,
/// namespacing every object name under the account.
pub struct KeyValueStorageDriver {
    storage: Storage,
}

impl KeyValueStorageDriver {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn namespaced(&self, account_name: &str, object_name: &str) -> String {
        format!("{account_name}/{object_name}")
    }
}

#[async_trait]
impl StorageDriver for KeyValueStorageDriver {
    async fn append_to_blob(&self, account_name: &str, storage_id: &str, chunk_number: u64, chunk: &[u8]) -> Result<()> {
        let key = self.namespaced(account_name, &chunk_object_name(storage_id, chunk_number));
        self.storage.put(&key, chunk).await
    }

    async fn finalize_blob(&self, account_name: &str, storage_id: &str, num_chunks: u64) -> Result<()> {
        let mut assembled = Vec::new();
        for n in 1..=num_chunks {
            let chunk_key = self.namespaced(account_name, &chunk_object_name(storage_id, n));
            let chunk = self.storage.get(&chunk_key).await?;
            assembled.extend_from_slice(&chunk);
            self.storage.delete(&chunk_key).await.ok();
        }
        let blob_key = self.namespaced(account_name, &blob_object_name(storage_id));
        self.storage.put(&blob_key, &assembled).await
    }

    async fn abort_blob_upload(&self, account_name: &str, storage_id: &str, num_chunks: u64) -> Result<()> {
        for n in 1..=num_chunks {
            let chunk_key = self.namespaced(account_name, &chunk_object_name(storage_id, n));
            self.storage.delete(&chunk_key).await.ok();
        }
        Ok(())
    }

    async fn read_blob(&self, account_name: &str, storage_id: &str) -> Result<bytes::Bytes> {
        let blob_key = self.namespaced(account_name, &blob_object_name(storage_id));
        self.storage.get(&blob_key).await
    }

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<()> {
        let blob_key = self.namespaced(account_name, &blob_object_name(storage_id));
        self.storage.delete(&blob_key).await
    }

    async fn write_manifest(&self, account_name: &str, repo_name: &str, digest: &str, content: &[u8]) -> Result<()> {
        let key = self.namespaced(account_name, &manifest_object_name(repo_name, digest));
        self.storage.put(&key, content).await
    }

    async fn read_manifest(&self, account_name: &str, repo_name: &str, digest: &str) -> Result<bytes::Bytes> {
        let key = self.namespaced(account_name, &manifest_object_name(repo_name, digest));
        self.storage.get(&key).await
    }

    async fn delete_manifest(&self, account_name: &str, repo_name: &str, digest: &str) -> Result<()> {
        let key = self.namespaced(account_name, &manifest_object_name(repo_name, digest));
        self.storage.delete(&key).await
    }

    async fn can_setup_account(&self, _account_name: &str) -> bool {
        self.storage.health_check().await
    }

    async fn cleanup_account(&self, account_name: &str) -> Result<()> {
        for key in self.storage.list(&format!("{account_name}/")).await {
            self.storage.delete(&key).await.ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::tempdir;

    #[tokio::test]
    async fn finalize_assembles_chunks_in_order() {
        let dir = tempdir().unwrap();
        let driver = KeyValueStorageDriver::new(Storage::new_local(dir.path().to_str().unwrap()));
        let storage_id = driver.generate_storage_id();

        driver.append_to_blob("test1", &storage_id, 1, b"hello ").await.unwrap();
        driver.append_to_blob("test1", &storage_id, 2, b"world").await.unwrap();
        driver.finalize_blob("test1", &storage_id, 2).await.unwrap();

        let bytes = driver.read_blob("test1", &storage_id).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn abort_removes_chunks_without_finalizing() {
        let dir = tempdir().unwrap();
        let driver = KeyValueStorageDriver::new(Storage::new_local(dir.path().to_str().unwrap()));
        let storage_id = driver.generate_storage_id();

        driver.append_to_blob("test1", &storage_id, 1, b"partial").await.unwrap();
        driver.abort_blob_upload("test1", &storage_id, 1).await.unwrap();

        assert!(driver.read_blob("test1", &storage_id).await.is_err());
    }

    #[tokio::test]
    async fn manifest_write_then_read_is_byte_for_byte() {
        let dir = tempdir().unwrap();
        let driver = KeyValueStorageDriver::new(Storage::new_local(dir.path().to_str().unwrap()));
        let contents = b"{\"schemaVersion\":2}";
        driver.write_manifest("test1", "test1/foo", "sha256:abc", contents).await.unwrap();
        let read_back = driver.read_manifest("test1", "test1/foo", "sha256:abc").await.unwrap();
        assert_eq!(&read_back[..], contents);
    }
}
