//! In-progress blob upload sessions.
//!
//! A session is opened by `POST .../blobs/uploads/`, grows one storage
//! chunk per `PATCH`, and is consumed by the final `PUT`. Kept in memory:
//! losing it on a restart just means the client has to start the upload
//! over, which the registry protocol already tolerates.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Clone)]
pub struct UploadSession {
    pub account_name: String,
    pub repo_name: String,
    pub storage_id: String,
    pub num_chunks: u32,
    pub size_bytes: u64,
}

#[derive(Default)]
pub struct UploadSessions {
    inner: RwLock<HashMap<String, UploadSession>>,
}

impl UploadSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uuid: String, session: UploadSession) {
        self.inner.write().insert(uuid, session);
    }

    pub fn get(&self, uuid: &str) -> Option<UploadSession> {
        self.inner.read().get(uuid).cloned()
    }

    pub fn update(&self, uuid: &str, session: UploadSession) {
        self.inner.write().insert(uuid.to_string(), session);
    }

    pub fn remove(&self, uuid: &str) -> Option<UploadSession> {
        self.inner.write().remove(uuid)
    }
}
