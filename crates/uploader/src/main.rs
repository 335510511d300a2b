use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use keepsake_client_sdk::{
    CompletedUpload, GuestInfo, StagedThumbnail, ThumbnailEncoder, UploadManager,
    UploadManagerConfig, UploadStatus, UploadTransport,
};
use keepsake_protocol::{
    PhotoListResponse, SendOtpRequest, SendOtpResponse, StageThumbnailResponse, UploadResponse,
    VerifyOtpRequest, VerifyOtpResponse,
};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Parser, Debug)]
#[command(
    name = "keepsake-uploader",
    version,
    about = "Keepsake guest CLI: authenticate, upload photos, browse the gallery"
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    SendOtp(SendOtpArgs),
    Verify(VerifyArgs),
    Upload(UploadArgs),
    List(ListArgs),
}

#[derive(Parser, Debug)]
struct SendOtpArgs {
    #[arg(long, default_value = "http://localhost:9040")]
    gateway: String,

    #[arg(long)]
    phone: String,

    #[arg(long)]
    event: String,
}

#[derive(Parser, Debug)]
struct VerifyArgs {
    #[arg(long, default_value = "http://localhost:9040")]
    gateway: String,

    #[arg(long)]
    phone: String,

    #[arg(long)]
    otp: String,

    #[arg(long)]
    event: String,

    #[arg(long)]
    name: String,

    #[arg(long)]
    email: Option<String>,

    #[arg(long)]
    table: Option<String>,

    #[arg(long, default_value = "keepsake-session.json")]
    session_out: String,
}

#[derive(Parser, Debug)]
struct UploadArgs {
    #[arg(long, default_value = "http://localhost:9040")]
    gateway: String,

    #[arg(long, default_value = "keepsake-session.json")]
    session: String,

    #[arg(long, num_args = 1..)]
    file: Vec<String>,
}

#[derive(Parser, Debug)]
struct ListArgs {
    #[arg(long, default_value = "http://localhost:9040")]
    gateway: String,

    #[arg(long, default_value = "keepsake-session.json")]
    session: String,

    /// Show every guest's photos instead of just your own. Requires a
    /// QR-code session.
    #[arg(long)]
    all: bool,
}

/// Credentials persisted between invocations.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    gateway: String,
    token: String,
    guest_name: String,
    phone: Option<String>,
    email: Option<String>,
    event_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::SendOtp(send) => run_send_otp(send).await,
        Commands::Verify(verify) => run_verify(verify).await,
        Commands::Upload(upload) => run_upload(upload).await,
        Commands::List(list) => run_list(list).await,
    }
}

async fn run_send_otp(args: SendOtpArgs) -> Result<()> {
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{}/api/auth/send-otp", args.gateway))
        .json(&SendOtpRequest {
            phone: args.phone.clone(),
            event_id: args.event.clone(),
        })
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("send-otp failed: HTTP {} {}", status, body));
    }

    let body: SendOtpResponse = resp.json().await?;
    println!(
        "otp sent phone={} expires_at={}",
        args.phone, body.expires_at
    );
    Ok(())
}

async fn run_verify(args: VerifyArgs) -> Result<()> {
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{}/api/auth/verify-otp", args.gateway))
        .json(&VerifyOtpRequest {
            phone: args.phone.clone(),
            otp: args.otp.clone(),
            event_id: args.event.clone(),
            name: args.name.clone(),
            email: args.email.clone(),
            table_id: args.table.clone(),
        })
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("verify failed: HTTP {} {}", status, body));
    }

    let body: VerifyOtpResponse = resp.json().await?;
    let stored = StoredSession {
        gateway: args.gateway.clone(),
        token: body.session.token.clone(),
        guest_name: body.guest.name.clone(),
        phone: body.guest.phone.clone(),
        email: body.guest.email.clone(),
        event_id: args.event.clone(),
    };
    fs::write(&args.session_out, serde_json::to_vec_pretty(&stored)?)?;

    println!(
        "verified guest={} session_expires={} session_file={}",
        body.guest.name, body.session.expires_at, args.session_out
    );
    Ok(())
}

async fn run_upload(args: UploadArgs) -> Result<()> {
    if args.file.is_empty() {
        return Err(anyhow!("at least one --file is required"));
    }
    let session = load_session(&args.session)?;

    let transport = GatewayTransport::new(args.gateway.clone(), session.token.clone());
    let manager = UploadManager::new(transport, PassthroughEncoder, UploadManagerConfig::default())
        .on_progress(|id, pct| println!("progress file={} pct={}", id, pct))
        .on_error(|id, msg| eprintln!("error file={} msg={}", id, msg));

    let guest = GuestInfo {
        name: session.guest_name.clone(),
        phone: session.phone.clone(),
        email: session.email.clone(),
    };

    let mut ids = Vec::with_capacity(args.file.len());
    for path in &args.file {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path))?;
        let name = file_name_of(path);
        let mime = mime_of(&name);
        let id = manager.add_file(name.clone(), mime, bytes)?;
        println!("queued file={} id={}", name, id);
        ids.push(id);
    }

    manager.wait_for_staging().await;

    let mut failed = 0usize;
    for id in &ids {
        match manager.get(id) {
            Some(snap) if snap.status == UploadStatus::Failed => {
                eprintln!(
                    "skipped file={} error={}",
                    snap.name,
                    snap.error.unwrap_or_default()
                );
                failed += 1;
            }
            _ => match manager.confirm(id, &guest).await {
                Ok(completed) => println!(
                    "uploaded file={} cloud_path={}",
                    completed.file_name,
                    completed.cloud_path.unwrap_or_default()
                ),
                Err(e) => {
                    eprintln!("upload failed id={} err={}", id, e);
                    failed += 1;
                }
            },
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} uploads failed", failed, ids.len()));
    }
    println!("upload complete files={}", ids.len());
    Ok(())
}

async fn run_list(args: ListArgs) -> Result<()> {
    let session = load_session(&args.session)?;
    let http = reqwest::Client::new();
    let resp = http
        .get(format!("{}/api/photos/list", args.gateway))
        .query(&[("viewAll", args.all)])
        .bearer_auth(&session.token)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("list failed: HTTP {} {}", status, body));
    }

    let body: PhotoListResponse = resp.json().await?;
    for photo in &body.photos {
        let who = photo
            .uploaded_by
            .as_ref()
            .map(|u| u.name.as_str())
            .unwrap_or("you");
        println!(
            "{}  {}  {} bytes  by {}  {}",
            photo.uploaded_at, photo.original_name, photo.size, who, photo.url
        );
    }
    println!(
        "total={} mode={:?} can_view_all={}",
        body.total_count, body.viewing_mode, body.can_view_all
    );
    Ok(())
}

fn load_session(path: &str) -> Result<StoredSession> {
    let bytes = fs::read(path)
        .with_context(|| format!("no session file at {}; run `verify` first", path))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn file_name_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn mime_of(name: &str) -> String {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// The CLI has no image codec, so the "thumbnail" sent to the staging
/// endpoint is the original bytes. The gateway stores whatever it receives.
struct PassthroughEncoder;

impl ThumbnailEncoder for PassthroughEncoder {
    fn encode(&self, bytes: &[u8], _mime: &str, _quality: f32) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// HTTP transport against the gateway's upload endpoints.
struct GatewayTransport {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl GatewayTransport {
    fn new(base: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            token,
        }
    }
}

#[async_trait]
impl UploadTransport for GatewayTransport {
    async fn stage_thumbnail(
        &self,
        file_id: &str,
        file_name: &str,
        file_size: usize,
        thumbnail: Bytes,
    ) -> Result<StagedThumbnail> {
        let part = reqwest::multipart::Part::bytes(thumbnail.to_vec())
            .file_name(format!("{}.jpg", file_id))
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new()
            .part("thumbnail", part)
            .text("fileId", file_id.to_string())
            .text("fileName", file_name.to_string())
            .text("fileSize", file_size.to_string());

        let resp = self
            .http
            .post(format!("{}/api/upload/thumbnail", self.base))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("thumbnail staging failed: HTTP {} {}", status, body));
        }

        let body: StageThumbnailResponse = resp.json().await?;
        Ok(StagedThumbnail {
            upload_url: body.upload_url,
            cloud_path: body.cloud_path,
        })
    }

    async fn put_signed(
        &self,
        url: &str,
        mime: &str,
        bytes: Bytes,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<()> {
        let resp = self
            .http
            .put(url)
            .header("content-type", mime)
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(anyhow!("signed PUT returned HTTP {}", resp.status()));
        }
        progress(100);
        Ok(())
    }

    async fn upload_full(
        &self,
        file_id: &str,
        file_name: &str,
        mime: &str,
        bytes: Bytes,
        _guest: &GuestInfo,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<CompletedUpload> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("fileId", file_id.to_string());

        let resp = self
            .http
            .post(format!("{}/api/upload/simple", self.base))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("relay upload failed: HTTP {} {}", status, body));
        }

        let body: UploadResponse = resp.json().await?;
        progress(100);
        Ok(CompletedUpload {
            file_name: body.file_name,
            cloud_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_is_guessed_from_extension() {
        assert_eq!(mime_of("beach.JPG"), "image/jpeg");
        assert_eq!(mime_of("a.png"), "image/png");
        assert_eq!(mime_of("pic.heic"), "image/heic");
        assert_eq!(mime_of("noext"), "application/octet-stream");
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(file_name_of("/tmp/photos/beach.jpg"), "beach.jpg");
        assert_eq!(file_name_of("beach.jpg"), "beach.jpg");
    }
}
