use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const THUMBNAIL_QUALITY: f32 = 0.2;
pub const COMPRESSED_PROGRESS: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Compressed,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Transition matrix for the per-file lifecycle:
    /// pending -> uploading -> compressed -> uploading -> completed,
    /// with failed reachable from any non-terminal state.
    pub fn can_transition(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match self {
            Pending => matches!(next, Uploading | Failed),
            Uploading => matches!(next, Compressed | Completed | Failed),
            Compressed => matches!(next, Uploading | Failed),
            Completed => false,
            Failed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file is {size} bytes, exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("unknown upload id {0}")]
    UnknownId(String),
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },
    #[error("thumbnail encoding failed: {0}")]
    Encode(String),
    #[error("upload failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct GuestInfo {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// Cloud placeholder returned by the thumbnail staging endpoint. A signed
/// `upload_url` enables the direct-to-storage PUT path on confirm.
#[derive(Debug, Clone)]
pub struct StagedThumbnail {
    pub upload_url: Option<String>,
    pub cloud_path: String,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub file_name: String,
    pub cloud_path: Option<String>,
}

/// Network seam of the manager. The gateway transport lives in the uploader
/// binary; tests drive the manager with fakes.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn stage_thumbnail(
        &self,
        file_id: &str,
        file_name: &str,
        file_size: usize,
        thumbnail: Bytes,
    ) -> anyhow::Result<StagedThumbnail>;

    /// Direct PUT of the full-resolution bytes to a signed storage URL.
    /// `progress` receives raw 0..=100 byte percentages.
    async fn put_signed(
        &self,
        url: &str,
        mime: &str,
        bytes: Bytes,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> anyhow::Result<()>;

    /// Server-relayed multipart upload, used when no signed URL was staged.
    /// `file_id` matches the id used for thumbnail staging so the server can
    /// link the staged thumbnail to the photo record.
    async fn upload_full(
        &self,
        file_id: &str,
        file_name: &str,
        mime: &str,
        bytes: Bytes,
        guest: &GuestInfo,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> anyhow::Result<CompletedUpload>;
}

/// Client-side image codec seam. Browsers hand this to a canvas; native
/// hosts plug in whatever codec they ship.
pub trait ThumbnailEncoder: Send + Sync {
    fn encode(&self, bytes: &[u8], mime: &str, quality: f32) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct FileEntry {
    id: String,
    name: String,
    mime: String,
    bytes: Bytes,
    thumbnail: Option<Bytes>,
    progress: u8,
    status: UploadStatus,
    error: Option<String>,
    upload_url: Option<String>,
    cloud_path: Option<String>,
}

/// Read-only view of one tracked file, without the payload bytes.
#[derive(Debug, Clone, Serialize)]
pub struct UploadSnapshot {
    pub id: String,
    pub name: String,
    pub mime: String,
    pub size: usize,
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub cloud_path: Option<String>,
}

impl FileEntry {
    fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.bytes.len(),
            progress: self.progress,
            status: self.status,
            error: self.error.clone(),
            cloud_path: self.cloud_path.clone(),
        }
    }
}

type ProgressFn = Arc<dyn Fn(&str, u8) + Send + Sync>;
type StatusFn = Arc<dyn Fn(&str, UploadStatus) + Send + Sync>;
type CompleteFn = Arc<dyn Fn(&str, &CompletedUpload) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    on_progress: Option<ProgressFn>,
    on_status: Option<StatusFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

#[derive(Debug, Clone)]
pub struct UploadManagerConfig {
    pub max_file_bytes: usize,
    pub thumbnail_quality: f32,
}

impl Default for UploadManagerConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            thumbnail_quality: THUMBNAIL_QUALITY,
        }
    }
}

/// Progressive upload manager: tracks one state machine per added file,
/// stages a low-quality thumbnail in the background as soon as a file is
/// added, and defers the full-resolution transfer until `confirm`.
pub struct UploadManager<T, E> {
    files: Arc<Mutex<HashMap<String, FileEntry>>>,
    transport: Arc<T>,
    encoder: Arc<E>,
    cfg: UploadManagerConfig,
    callbacks: Callbacks,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, E> UploadManager<T, E>
where
    T: UploadTransport + 'static,
    E: ThumbnailEncoder + 'static,
{
    pub fn new(transport: T, encoder: E, cfg: UploadManagerConfig) -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            transport: Arc::new(transport),
            encoder: Arc::new(encoder),
            cfg,
            callbacks: Callbacks::default(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn on_progress(mut self, cb: impl Fn(&str, u8) + Send + Sync + 'static) -> Self {
        self.callbacks.on_progress = Some(Arc::new(cb));
        self
    }

    pub fn on_status(mut self, cb: impl Fn(&str, UploadStatus) + Send + Sync + 'static) -> Self {
        self.callbacks.on_status = Some(Arc::new(cb));
        self
    }

    pub fn on_complete(mut self, cb: impl Fn(&str, &CompletedUpload) + Send + Sync + 'static) -> Self {
        self.callbacks.on_complete = Some(Arc::new(cb));
        self
    }

    pub fn on_error(mut self, cb: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(cb));
        self
    }

    /// Register a file and kick off the background compression + thumbnail
    /// staging. Oversized files are rejected before anything touches the
    /// network. Returns the opaque file id.
    pub fn add_file(
        &self,
        name: impl Into<String>,
        mime: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Result<String, UploadError> {
        let bytes = bytes.into();
        if bytes.len() > self.cfg.max_file_bytes {
            return Err(UploadError::TooLarge {
                size: bytes.len(),
                limit: self.cfg.max_file_bytes,
            });
        }

        let id = new_file_id();
        let entry = FileEntry {
            id: id.clone(),
            name: name.into(),
            mime: mime.into(),
            bytes,
            thumbnail: None,
            progress: 0,
            status: UploadStatus::Pending,
            error: None,
            upload_url: None,
            cloud_path: None,
        };
        self.files
            .lock()
            .expect("upload map poisoned")
            .insert(id.clone(), entry);

        let handle = tokio::spawn(stage_background(
            Arc::clone(&self.files),
            Arc::clone(&self.transport),
            Arc::clone(&self.encoder),
            self.callbacks.clone(),
            self.cfg.thumbnail_quality,
            id.clone(),
        ));
        self.background
            .lock()
            .expect("background list poisoned")
            .push(handle);

        Ok(id)
    }

    /// Await all in-flight background staging tasks. Used by hosts that want
    /// a settled view before confirming (and by tests).
    pub async fn wait_for_staging(&self) {
        let handles: Vec<_> = self
            .background
            .lock()
            .expect("background list poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Full-resolution upload after user confirmation. Only legal from
    /// `compressed` or `pending`; a completed or failed file is rejected and
    /// never re-uploaded.
    pub async fn confirm(&self, id: &str, guest: &GuestInfo) -> Result<CompletedUpload, UploadError> {
        let (bytes, name, mime, upload_url, staged_path) = {
            let mut files = self.files.lock().expect("upload map poisoned");
            let entry = files.get_mut(id).ok_or_else(|| UploadError::UnknownId(id.to_string()))?;
            if !matches!(entry.status, UploadStatus::Compressed | UploadStatus::Pending) {
                return Err(UploadError::InvalidTransition {
                    from: entry.status,
                    to: UploadStatus::Uploading,
                });
            }
            entry.status = UploadStatus::Uploading;
            (
                entry.bytes.clone(),
                entry.name.clone(),
                entry.mime.clone(),
                entry.upload_url.clone(),
                entry.cloud_path.clone(),
            )
        };
        self.notify_status(id, UploadStatus::Uploading);

        let files = Arc::clone(&self.files);
        let callbacks = self.callbacks.clone();
        let id_owned = id.to_string();
        let progress = move |raw: u8| {
            // Full upload occupies the 20..100 band; the first 20 points
            // belong to the thumbnail stage.
            let scaled = COMPRESSED_PROGRESS + (raw.min(100) as u16 * 80 / 100) as u8;
            bump_progress(&files, &callbacks, &id_owned, scaled);
        };

        let result = if let Some(url) = upload_url {
            self.transport
                .put_signed(&url, &mime, bytes, &progress)
                .await
                .map(|_| CompletedUpload {
                    file_name: name.clone(),
                    cloud_path: staged_path.clone(),
                })
        } else {
            self.transport
                .upload_full(id, &name, &mime, bytes, guest, &progress)
                .await
        };

        match result {
            Ok(completed) => {
                {
                    let mut files = self.files.lock().expect("upload map poisoned");
                    if let Some(entry) = files.get_mut(id) {
                        entry.status = UploadStatus::Completed;
                        entry.progress = 100;
                        if entry.cloud_path.is_none() {
                            entry.cloud_path = completed.cloud_path.clone();
                        }
                    }
                }
                if let Some(cb) = &self.callbacks.on_progress {
                    cb(id, 100);
                }
                self.notify_status(id, UploadStatus::Completed);
                if let Some(cb) = &self.callbacks.on_complete {
                    cb(id, &completed);
                }
                Ok(completed)
            }
            Err(e) => {
                let msg = e.to_string();
                mark_failed(&self.files, &self.callbacks, id, &msg);
                Err(UploadError::Transport(msg))
            }
        }
    }

    /// Drop all state for one file. A thumbnail already staged server-side is
    /// not retracted. Other files are untouched.
    pub fn cancel(&self, id: &str) {
        self.files.lock().expect("upload map poisoned").remove(id);
    }

    pub fn get(&self, id: &str) -> Option<UploadSnapshot> {
        self.files
            .lock()
            .expect("upload map poisoned")
            .get(id)
            .map(FileEntry::snapshot)
    }

    pub fn files(&self) -> Vec<UploadSnapshot> {
        self.files
            .lock()
            .expect("upload map poisoned")
            .values()
            .map(FileEntry::snapshot)
            .collect()
    }

    pub fn clear_completed(&self) {
        self.files
            .lock()
            .expect("upload map poisoned")
            .retain(|_, entry| entry.status != UploadStatus::Completed);
    }

    pub fn clear_all(&self) {
        self.files.lock().expect("upload map poisoned").clear();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn notify_status(&self, id: &str, status: UploadStatus) {
        if let Some(cb) = &self.callbacks.on_status {
            cb(id, status);
        }
    }
}

/// Background stage: compress to a low-quality thumbnail, report progress 20
/// and state `compressed`, then push the thumbnail to the staging endpoint.
/// Any failure parks the file in `failed` without removing it.
async fn stage_background<T, E>(
    files: Arc<Mutex<HashMap<String, FileEntry>>>,
    transport: Arc<T>,
    encoder: Arc<E>,
    callbacks: Callbacks,
    quality: f32,
    id: String,
) where
    T: UploadTransport + 'static,
    E: ThumbnailEncoder + 'static,
{
    let (bytes, name, mime) = {
        let mut guard = files.lock().expect("upload map poisoned");
        let Some(entry) = guard.get_mut(&id) else {
            return; // cancelled before the stage ran
        };
        // An eager confirm may have raced past us; never pull a file out of
        // a terminal or already-uploading state.
        if !entry.status.can_transition(UploadStatus::Uploading) {
            return;
        }
        entry.status = UploadStatus::Uploading;
        (entry.bytes.clone(), entry.name.clone(), entry.mime.clone())
    };
    if let Some(cb) = &callbacks.on_status {
        cb(&id, UploadStatus::Uploading);
    }

    let encoded = {
        let encoder = Arc::clone(&encoder);
        let input = bytes.clone();
        let mime = mime.clone();
        tokio::task::spawn_blocking(move || encoder.encode(&input, &mime, quality)).await
    };

    let thumbnail = match encoded {
        Ok(Ok(thumb)) => Bytes::from(thumb),
        Ok(Err(e)) => {
            mark_failed(&files, &callbacks, &id, &e.to_string());
            return;
        }
        Err(e) => {
            mark_failed(&files, &callbacks, &id, &format!("encoder task failed: {e}"));
            return;
        }
    };

    let size = bytes.len();
    {
        let mut guard = files.lock().expect("upload map poisoned");
        let Some(entry) = guard.get_mut(&id) else {
            return;
        };
        if !entry.status.can_transition(UploadStatus::Compressed) {
            return;
        }
        entry.thumbnail = Some(thumbnail.clone());
        entry.status = UploadStatus::Compressed;
    }
    bump_progress(&files, &callbacks, &id, COMPRESSED_PROGRESS);
    if let Some(cb) = &callbacks.on_status {
        cb(&id, UploadStatus::Compressed);
    }

    match transport.stage_thumbnail(&id, &name, size, thumbnail).await {
        Ok(staged) => {
            let mut guard = files.lock().expect("upload map poisoned");
            if let Some(entry) = guard.get_mut(&id) {
                if !entry.status.is_terminal() {
                    entry.upload_url = staged.upload_url;
                    entry.cloud_path = Some(staged.cloud_path);
                }
            }
        }
        Err(e) => mark_failed(&files, &callbacks, &id, &e.to_string()),
    }
}

/// Monotonic per-file progress: a stale or duplicate report never moves the
/// bar backwards.
fn bump_progress(
    files: &Arc<Mutex<HashMap<String, FileEntry>>>,
    callbacks: &Callbacks,
    id: &str,
    value: u8,
) {
    let updated = {
        let mut guard = files.lock().expect("upload map poisoned");
        match guard.get_mut(id) {
            Some(entry) if value > entry.progress => {
                entry.progress = value;
                true
            }
            _ => false,
        }
    };
    if updated {
        if let Some(cb) = &callbacks.on_progress {
            cb(id, value);
        }
    }
}

fn mark_failed(
    files: &Arc<Mutex<HashMap<String, FileEntry>>>,
    callbacks: &Callbacks,
    id: &str,
    message: &str,
) {
    let marked = {
        let mut guard = files.lock().expect("upload map poisoned");
        match guard.get_mut(id) {
            Some(entry) if entry.status.can_transition(UploadStatus::Failed) => {
                entry.status = UploadStatus::Failed;
                entry.error = Some(message.to_string());
                true
            }
            _ => false,
        }
    };
    if marked {
        if let Some(cb) = &callbacks.on_status {
            cb(id, UploadStatus::Failed);
        }
        if let Some(cb) = &callbacks.on_error {
            cb(id, message);
        }
    }
}

fn new_file_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_matrix_is_exhaustive() {
        use UploadStatus::*;
        assert!(Pending.can_transition(Uploading));
        assert!(Pending.can_transition(Failed));
        assert!(!Pending.can_transition(Completed));
        assert!(Uploading.can_transition(Compressed));
        assert!(Uploading.can_transition(Completed));
        assert!(Compressed.can_transition(Uploading));
        assert!(!Compressed.can_transition(Completed));
        assert!(!Completed.can_transition(Uploading));
        assert!(!Failed.can_transition(Uploading));
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Compressed.is_terminal());
    }

    #[test]
    fn file_ids_are_opaque_and_distinct() {
        let a = new_file_id();
        let b = new_file_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
