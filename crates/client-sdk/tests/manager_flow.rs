// Upload manager lifecycle tests driven through fake transport/encoder seams:
// staged thumbnail push, deferred confirmation, terminal-state rejection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use keepsake_client_sdk::{
    CompletedUpload, GuestInfo, StagedThumbnail, ThumbnailEncoder, UploadError, UploadManager,
    UploadManagerConfig, UploadStatus, UploadTransport, COMPRESSED_PROGRESS,
};

#[derive(Default)]
struct FakeTransport {
    stage_calls: AtomicUsize,
    signed_calls: AtomicUsize,
    relay_calls: AtomicUsize,
    relayed_file_ids: Mutex<Vec<String>>,
    fail_staging: bool,
    with_signed_url: bool,
    raw_progress: Vec<u8>,
}

impl FakeTransport {
    fn with_signed_url() -> Self {
        Self {
            with_signed_url: true,
            raw_progress: vec![25, 50, 100],
            ..Self::default()
        }
    }

    fn relay_only() -> Self {
        Self {
            raw_progress: vec![50, 30, 100], // out-of-order on purpose
            ..Self::default()
        }
    }

    fn failing_stage() -> Self {
        Self {
            fail_staging: true,
            ..Self::default()
        }
    }

    fn network_calls(&self) -> usize {
        self.stage_calls.load(Ordering::SeqCst)
            + self.signed_calls.load(Ordering::SeqCst)
            + self.relay_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadTransport for FakeTransport {
    async fn stage_thumbnail(
        &self,
        file_id: &str,
        _file_name: &str,
        _file_size: usize,
        _thumbnail: Bytes,
    ) -> anyhow::Result<StagedThumbnail> {
        self.stage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_staging {
            anyhow::bail!("staging endpoint unreachable");
        }
        Ok(StagedThumbnail {
            upload_url: self
                .with_signed_url
                .then(|| format!("https://store.example/{file_id}?sig=abc")),
            cloud_path: format!("events/e1/g1/{file_id}.jpg"),
        })
    }

    async fn put_signed(
        &self,
        _url: &str,
        _mime: &str,
        _bytes: Bytes,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> anyhow::Result<()> {
        self.signed_calls.fetch_add(1, Ordering::SeqCst);
        for p in &self.raw_progress {
            progress(*p);
        }
        Ok(())
    }

    async fn upload_full(
        &self,
        file_id: &str,
        file_name: &str,
        _mime: &str,
        _bytes: Bytes,
        _guest: &GuestInfo,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> anyhow::Result<CompletedUpload> {
        self.relay_calls.fetch_add(1, Ordering::SeqCst);
        self.relayed_file_ids
            .lock()
            .unwrap()
            .push(file_id.to_string());
        for p in &self.raw_progress {
            progress(*p);
        }
        Ok(CompletedUpload {
            file_name: file_name.to_string(),
            cloud_path: Some(format!("events/e1/g1/{file_name}")),
        })
    }
}

struct FakeEncoder {
    fail: bool,
}

impl FakeEncoder {
    fn ok() -> Self {
        Self { fail: false }
    }

    fn failing() -> Self {
        Self { fail: true }
    }
}

impl ThumbnailEncoder for FakeEncoder {
    fn encode(&self, bytes: &[u8], _mime: &str, quality: f32) -> anyhow::Result<Vec<u8>> {
        if self.fail {
            anyhow::bail!("unsupported image format");
        }
        let keep = ((bytes.len() as f32) * quality).max(1.0) as usize;
        Ok(bytes[..keep.min(bytes.len())].to_vec())
    }
}

fn guest() -> GuestInfo {
    GuestInfo {
        name: "Dana".into(),
        phone: Some("0771234567".into()),
        email: None,
    }
}

fn manager(
    transport: FakeTransport,
    encoder: FakeEncoder,
) -> UploadManager<FakeTransport, FakeEncoder> {
    UploadManager::new(transport, encoder, UploadManagerConfig::default())
}

#[tokio::test]
async fn oversize_file_is_rejected_before_any_network_call() {
    let mgr = UploadManager::new(
        FakeTransport::with_signed_url(),
        FakeEncoder::ok(),
        UploadManagerConfig {
            max_file_bytes: 10 * 1024 * 1024,
            ..UploadManagerConfig::default()
        },
    );

    let big = vec![0u8; 50 * 1024 * 1024];
    let err = mgr.add_file("huge.jpg", "image/jpeg", big).unwrap_err();
    assert!(matches!(err, UploadError::TooLarge { .. }));

    mgr.wait_for_staging().await;
    // Rejection happens entirely client-side.
    assert_eq!(mgr.transport().network_calls(), 0);
    assert_eq!(mgr.files().len(), 0);
}

#[tokio::test]
async fn staged_file_reaches_compressed_at_exactly_twenty() {
    let mgr = manager(FakeTransport::with_signed_url(), FakeEncoder::ok());
    let id = mgr
        .add_file("photo.jpg", "image/jpeg", vec![7u8; 2048])
        .unwrap();
    mgr.wait_for_staging().await;

    let snap = mgr.get(&id).unwrap();
    assert_eq!(snap.status, UploadStatus::Compressed);
    assert_eq!(snap.progress, COMPRESSED_PROGRESS);
    assert!(snap.cloud_path.is_some());
}

#[tokio::test]
async fn confirm_uses_signed_put_and_completes() {
    let mgr = manager(FakeTransport::with_signed_url(), FakeEncoder::ok());
    let id = mgr
        .add_file("photo.jpg", "image/jpeg", vec![7u8; 2048])
        .unwrap();
    mgr.wait_for_staging().await;

    let done = mgr.confirm(&id, &guest()).await.unwrap();
    assert_eq!(done.file_name, "photo.jpg");
    assert!(done.cloud_path.unwrap().starts_with("events/e1/g1/"));

    let snap = mgr.get(&id).unwrap();
    assert_eq!(snap.status, UploadStatus::Completed);
    assert_eq!(snap.progress, 100);
}

#[tokio::test]
async fn confirm_falls_back_to_server_relay_without_signed_url() {
    let progress_log: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&progress_log);
    let mgr = manager(FakeTransport::relay_only(), FakeEncoder::ok())
        .on_progress(move |_, p| log.lock().unwrap().push(p));

    let id = mgr
        .add_file("photo.jpg", "image/jpeg", vec![7u8; 4096])
        .unwrap();
    mgr.wait_for_staging().await;
    mgr.confirm(&id, &guest()).await.unwrap();

    // The relay carries the staging file id so the server can attach the
    // already-staged thumbnail to the photo record.
    assert_eq!(*mgr.transport().relayed_file_ids.lock().unwrap(), vec![id]);

    // 20 from compression, then scaled relay progress, then 100. Raw relay
    // reports arrive out of order; the bar must never move backwards.
    let observed = progress_log.lock().unwrap().clone();
    let mut sorted = observed.clone();
    sorted.sort_unstable();
    assert_eq!(observed, sorted, "progress must be monotonic: {observed:?}");
    assert_eq!(*observed.first().unwrap(), COMPRESSED_PROGRESS);
    assert_eq!(*observed.last().unwrap(), 100);
}

#[tokio::test]
async fn confirm_on_completed_file_is_rejected_without_reupload() {
    let mgr = manager(FakeTransport::with_signed_url(), FakeEncoder::ok());
    let id = mgr
        .add_file("photo.jpg", "image/jpeg", vec![7u8; 1024])
        .unwrap();
    mgr.wait_for_staging().await;
    mgr.confirm(&id, &guest()).await.unwrap();

    let before = mgr.transport().network_calls();
    let err = mgr.confirm(&id, &guest()).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::InvalidTransition {
            from: UploadStatus::Completed,
            ..
        }
    ));
    assert_eq!(mgr.transport().network_calls(), before, "must not re-upload");
}

#[tokio::test]
async fn completed_file_is_not_revived_by_late_staging() {
    // Confirm straight from Pending, before the background staging task has
    // had a chance to run.
    let mgr = manager(FakeTransport::relay_only(), FakeEncoder::ok());
    let id = mgr
        .add_file("photo.jpg", "image/jpeg", vec![7u8; 1024])
        .unwrap();

    mgr.confirm(&id, &guest()).await.unwrap();
    assert_eq!(mgr.get(&id).unwrap().status, UploadStatus::Completed);

    // The staging task finishes afterwards; it must leave the terminal
    // state and the finished progress bar alone.
    mgr.wait_for_staging().await;
    let snap = mgr.get(&id).unwrap();
    assert_eq!(snap.status, UploadStatus::Completed);
    assert_eq!(snap.progress, 100);
}

#[tokio::test]
async fn encoder_failure_parks_file_in_failed_without_removal() {
    let mgr = manager(FakeTransport::with_signed_url(), FakeEncoder::failing());
    let id = mgr
        .add_file("weird.heic", "image/heic", vec![7u8; 1024])
        .unwrap();
    mgr.wait_for_staging().await;

    let snap = mgr.get(&id).unwrap();
    assert_eq!(snap.status, UploadStatus::Failed);
    assert!(snap.error.unwrap().contains("unsupported image format"));
    assert_eq!(mgr.files().len(), 1, "failed file stays visible");

    // A failed file cannot be confirmed; the user re-adds it instead.
    let err = mgr.confirm(&id, &guest()).await.unwrap_err();
    assert!(matches!(err, UploadError::InvalidTransition { .. }));
}

#[tokio::test]
async fn staging_failure_marks_failed() {
    let mgr = manager(FakeTransport::failing_stage(), FakeEncoder::ok());
    let id = mgr
        .add_file("photo.jpg", "image/jpeg", vec![7u8; 1024])
        .unwrap();
    mgr.wait_for_staging().await;

    let snap = mgr.get(&id).unwrap();
    assert_eq!(snap.status, UploadStatus::Failed);
    assert!(snap.error.unwrap().contains("staging endpoint unreachable"));
}

#[tokio::test]
async fn cancel_is_isolated_per_file() {
    let mgr = manager(FakeTransport::with_signed_url(), FakeEncoder::ok());
    let a = mgr.add_file("a.jpg", "image/jpeg", vec![1u8; 512]).unwrap();
    let b = mgr.add_file("b.jpg", "image/jpeg", vec![2u8; 512]).unwrap();
    mgr.wait_for_staging().await;

    mgr.cancel(&a);
    assert!(mgr.get(&a).is_none());

    let snap = mgr.get(&b).unwrap();
    assert_eq!(snap.status, UploadStatus::Compressed);
    mgr.confirm(&b, &guest()).await.unwrap();
    assert_eq!(mgr.get(&b).unwrap().status, UploadStatus::Completed);
}

#[tokio::test]
async fn clear_completed_keeps_pending_and_failed() {
    let mgr = manager(FakeTransport::with_signed_url(), FakeEncoder::ok());
    let a = mgr.add_file("a.jpg", "image/jpeg", vec![1u8; 512]).unwrap();
    let b = mgr.add_file("b.jpg", "image/jpeg", vec![2u8; 512]).unwrap();
    mgr.wait_for_staging().await;
    mgr.confirm(&a, &guest()).await.unwrap();

    mgr.clear_completed();
    assert!(mgr.get(&a).is_none());
    assert!(mgr.get(&b).is_some());

    mgr.clear_all();
    assert!(mgr.files().is_empty());
}
