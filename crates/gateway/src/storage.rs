use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const READ_URL_TTL_SECS: i64 = 7 * 24 * 60 * 60;
pub const WRITE_URL_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// HTTP object-store client with HMAC-signed expiring URLs. The store itself
/// is external; this side only uploads bytes and mints URLs.
#[derive(Clone)]
pub struct ObjectStore {
    http: reqwest::Client,
    cfg: StorageConfig,
}

impl ObjectStore {
    pub fn new(cfg: StorageConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    /// Object keys are partitioned by event and guest; the random id keeps
    /// same-named files from colliding.
    pub fn upload_path(event_id: &str, guest_id: &str, original_name: &str) -> String {
        let ext = original_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.len() <= 8)
            .unwrap_or_else(|| "bin".to_string());
        format!("events/{}/{}/{}.{}", event_id, guest_id, uuid::Uuid::new_v4(), ext)
    }

    pub fn thumbnail_path(event_id: &str, guest_id: &str, file_id: &str) -> String {
        format!("events/{}/{}/thumbs/{}.jpg", event_id, guest_id, file_id)
    }

    /// Reference URL; not readable without a signature when the bucket is
    /// private.
    pub fn object_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.cfg.endpoint, self.cfg.bucket, path)
    }

    pub fn presign_read(&self, path: &str, ttl_secs: i64, now: DateTime<Utc>) -> String {
        self.presign("GET", path, ttl_secs, now)
    }

    pub fn presign_write(&self, path: &str, ttl_secs: i64, now: DateTime<Utc>) -> String {
        self.presign("PUT", path, ttl_secs, now)
    }

    fn presign(&self, method: &str, path: &str, ttl_secs: i64, now: DateTime<Utc>) -> String {
        let expires = now.timestamp() + ttl_secs;
        let signature = self.sign(method, path, expires);
        format!(
            "{}?X-Key={}&X-Expires={}&X-Signature={}",
            self.object_url(path),
            self.cfg.access_key,
            expires,
            signature
        )
    }

    fn sign(&self, method: &str, path: &str, expires: i64) -> String {
        let payload = format!("{}\n{}/{}\n{}", method, self.cfg.bucket, path, expires);
        let mut mac = HmacSha256::new_from_slice(self.cfg.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub async fn put_object(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> anyhow::Result<()> {
        let url = self.presign_write(path, WRITE_URL_TTL_SECS, Utc::now());
        let resp = self
            .http
            .put(&url)
            .header("content-type", content_type)
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("object store PUT {} returned HTTP {}", path, resp.status());
        }
        Ok(())
    }

    pub async fn delete_object(&self, path: &str) -> anyhow::Result<()> {
        let url = self.presign("DELETE", path, WRITE_URL_TTL_SECS, Utc::now());
        let resp = self.http.delete(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("object store DELETE {} returned HTTP {}", path, resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjectStore {
        ObjectStore::new(StorageConfig {
            endpoint: "https://store.example".into(),
            bucket: "photos".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
        })
    }

    #[test]
    fn upload_path_is_partitioned_by_event_and_guest() {
        let path = ObjectStore::upload_path("e1", "g1", "beach.JPG");
        assert!(path.starts_with("events/e1/g1/"));
        assert!(path.ends_with(".jpg"));
    }

    #[test]
    fn upload_path_defaults_missing_extension() {
        let path = ObjectStore::upload_path("e1", "g1", "no-extension");
        assert!(path.ends_with(".bin"));
    }

    #[test]
    fn thumbnail_path_lives_under_thumbs() {
        assert_eq!(
            ObjectStore::thumbnail_path("e1", "g1", "f1"),
            "events/e1/g1/thumbs/f1.jpg"
        );
    }

    #[test]
    fn presign_is_deterministic_for_fixed_clock() {
        let now = DateTime::parse_from_rfc3339("2026-08-25T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let s = store();
        let a = s.presign_read("events/e1/g1/x.jpg", 60, now);
        let b = s.presign_read("events/e1/g1/x.jpg", 60, now);
        assert_eq!(a, b);
        assert!(a.starts_with("https://store.example/photos/events/e1/g1/x.jpg?X-Key=ak&X-Expires="));
        assert!(a.contains(&format!("X-Expires={}", now.timestamp() + 60)));
    }

    #[test]
    fn read_and_write_signatures_differ() {
        let now = Utc::now();
        let s = store();
        assert_ne!(
            s.presign_read("p.jpg", 60, now),
            s.presign_write("p.jpg", 60, now)
        );
    }

    #[test]
    fn signature_depends_on_secret() {
        let now = Utc::now();
        let a = store();
        let b = ObjectStore::new(StorageConfig {
            secret_key: "other".into(),
            ..a.cfg.clone()
        });
        assert_ne!(
            a.presign_read("p.jpg", 60, now),
            b.presign_read("p.jpg", 60, now)
        );
    }
}
