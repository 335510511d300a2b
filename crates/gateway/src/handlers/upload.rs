use axum::{
    extract::{Multipart, State},
    http::HeaderMap,
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

use keepsake_protocol::{StageThumbnailResponse, UploadResponse};

use crate::auth::verify_guest_session;
use crate::error::AppError;
use crate::models::{Event, Guest, UPLOAD_STATUS_COMPLETED};
use crate::storage::{ObjectStore, READ_URL_TTL_SECS, WRITE_URL_TTL_SECS};
use crate::AppState;

/// Resolve the event a guest is uploading into. Placeholder ids from older
/// client builds map to the latest event; unknown ids get a row created so the
/// upload is never lost.
pub(crate) async fn resolve_event(
    state: &AppState,
    requested: Option<&str>,
) -> Result<Event, AppError> {
    let requested = requested
        .filter(|id| !id.is_empty() && *id != "default-event-id" && *id != "test-event");

    if let Some(id) = requested {
        if let Some(event) = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.db)
            .await?
        {
            return Ok(event);
        }
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (id, name, date, is_active)
            VALUES ($1, $2, NOW(), TRUE)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(format!("Event {}", id))
        .fetch_one(&state.db)
        .await?;
        tracing::info!("Created event {} on first upload", event.id);
        return Ok(event);
    }

    if let Some(event) =
        sqlx::query_as::<_, Event>("SELECT * FROM events ORDER BY created_at DESC LIMIT 1")
            .fetch_optional(&state.db)
            .await?
    {
        return Ok(event);
    }

    let event = sqlx::query_as::<_, Event>(
        r#"
        INSERT INTO events (id, name, date, is_active)
        VALUES ('default-event-id', 'Wedding Event', NOW(), TRUE)
        RETURNING *
        "#,
    )
    .fetch_one(&state.db)
    .await?;
    tracing::info!("Created default event");
    Ok(event)
}

struct UploadForm {
    file: Option<(String, String, Bytes)>,
    event_id: Option<String>,
    file_id: Option<String>,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<UploadForm, AppError> {
    let mut form = UploadForm {
        file: None,
        event_id: None,
        file_id: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Failed to read file: {}", e)))?;
                form.file = Some((file_name, content_type, bytes));
            }
            Some("eventId") => {
                form.event_id = field.text().await.ok();
            }
            Some("fileId") => {
                form.file_id = field.text().await.ok();
            }
            _ => {}
        }
    }
    Ok(form)
}

pub async fn upload_simple(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let authed = verify_guest_session(&state, &headers).await?;

    let form = read_upload_form(&mut multipart).await?;
    let (original_name, content_type, bytes) = form
        .file
        .ok_or_else(|| AppError::Validation("File is required".into()))?;

    // The session's event wins over whatever the form claims.
    let requested = if authed.event_id.is_empty() {
        form.event_id.as_deref()
    } else {
        Some(authed.event_id.as_str())
    };
    let event = resolve_event(&state, requested).await?;

    let size = bytes.len() as i64;
    if size > event.max_upload_size {
        return Err(AppError::Validation(format!(
            "File exceeds the maximum upload size of {} bytes",
            event.max_upload_size
        )));
    }
    if !event.accepts_format(&content_type) {
        return Err(AppError::Validation(format!(
            "File format {} is not allowed for this event",
            content_type
        )));
    }

    let guest_id = authed.guest.id.to_string();
    let cloud_path = ObjectStore::upload_path(&event.id, &guest_id, &original_name);

    state
        .store
        .put_object(&cloud_path, bytes, &content_type)
        .await
        .map_err(|e| {
            tracing::error!("Object store PUT failed for {}: {}", cloud_path, e);
            AppError::Transport("Failed to upload file".into())
        })?;

    let signed_url = state
        .store
        .presign_read(&cloud_path, READ_URL_TTL_SECS, Utc::now());
    let public_url = state.store.object_url(&cloud_path);

    // A fileId from the staging step links the photo to its thumbnail.
    let (thumbnail_path, thumbnail_url) = match form.file_id.as_deref().filter(|id| !id.is_empty())
    {
        Some(file_id) => {
            let path = ObjectStore::thumbnail_path(&event.id, &guest_id, file_id);
            let url = state.store.presign_read(&path, READ_URL_TTL_SECS, Utc::now());
            (Some(path), Some(url))
        }
        None => (None, None),
    };
    state
        .url_cache
        .insert(cloud_path.clone(), signed_url.clone())
        .await;

    let file_name = cloud_path
        .rsplit('/')
        .next()
        .unwrap_or(&cloud_path)
        .to_string();

    // The bytes are already durable in the object store at this point, so a
    // bookkeeping failure is logged rather than surfaced as an upload error.
    if let Err(e) = record_photo(
        &state,
        &event,
        &authed.guest,
        &file_name,
        &original_name,
        &content_type,
        size,
        &cloud_path,
        &signed_url,
        thumbnail_path.as_deref(),
        thumbnail_url.as_deref(),
    )
    .await
    {
        tracing::error!("Photo bookkeeping failed for {}: {}", cloud_path, e);
    }

    if let Some(phone) = authed.guest.phone.clone() {
        let sms = state.sms.clone();
        tokio::spawn(async move {
            let outcome = sms.send_upload_confirmation(&phone, 1).await;
            if outcome.is_error() {
                tracing::warn!("Upload confirmation SMS failed for {}", phone);
            }
        });
    }

    tracing::info!(
        "Guest {} uploaded {} ({} bytes) to event {}",
        authed.guest.id,
        original_name,
        size,
        event.id
    );

    Ok(Json(UploadResponse {
        success: true,
        url: signed_url,
        public_url,
        file_name,
        size,
    }))
}

#[allow(clippy::too_many_arguments)]
async fn record_photo(
    state: &AppState,
    event: &Event,
    guest: &Guest,
    file_name: &str,
    original_name: &str,
    mime_type: &str,
    size: i64,
    cloud_path: &str,
    cloud_url: &str,
    thumbnail_path: Option<&str>,
    thumbnail_url: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO photos
            (event_id, guest_id, file_name, original_name, mime_type, size,
             cloud_path, cloud_url, thumbnail_path, thumbnail_url,
             upload_status, upload_progress)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 100)
        "#,
    )
    .bind(&event.id)
    .bind(guest.id)
    .bind(file_name)
    .bind(original_name)
    .bind(mime_type)
    .bind(size)
    .bind(cloud_path)
    .bind(cloud_url)
    .bind(thumbnail_path)
    .bind(thumbnail_url)
    .bind(UPLOAD_STATUS_COMPLETED)
    .execute(&state.db)
    .await?;

    sqlx::query(
        r#"
        UPDATE guests
        SET upload_count = upload_count + 1,
            total_size = total_size + $2,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(guest.id)
    .bind(size)
    .execute(&state.db)
    .await?;

    sqlx::query("UPDATE events SET storage_used = storage_used + $2, updated_at = NOW() WHERE id = $1")
        .bind(&event.id)
        .bind(size)
        .execute(&state.db)
        .await?;

    Ok(())
}

struct ThumbnailForm {
    thumbnail: Option<Bytes>,
    file_id: Option<String>,
    file_name: Option<String>,
}

async fn read_thumbnail_form(multipart: &mut Multipart) -> Result<ThumbnailForm, AppError> {
    let mut form = ThumbnailForm {
        thumbnail: None,
        file_id: None,
        file_name: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("thumbnail") => {
                form.thumbnail = Some(field.bytes().await.map_err(|e| {
                    AppError::Validation(format!("Failed to read thumbnail: {}", e))
                })?);
            }
            Some("fileId") => form.file_id = field.text().await.ok(),
            Some("fileName") => form.file_name = field.text().await.ok(),
            _ => {}
        }
    }
    Ok(form)
}

/// First stage of the progressive upload: the tiny client-side thumbnail is
/// stored immediately and the caller gets back the reserved path plus a signed
/// PUT URL for the full-resolution object.
pub async fn stage_thumbnail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<StageThumbnailResponse>, AppError> {
    let authed = verify_guest_session(&state, &headers).await?;

    let form = read_thumbnail_form(&mut multipart).await?;
    let thumbnail = form
        .thumbnail
        .ok_or_else(|| AppError::Validation("Thumbnail is required".into()))?;
    let file_id = form
        .file_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("File ID is required".into()))?;
    let file_name = form.file_name.unwrap_or_else(|| format!("{}.jpg", file_id));

    let event = resolve_event(&state, Some(authed.event_id.as_str())).await?;
    let guest_id = authed.guest.id.to_string();

    let thumb_path = ObjectStore::thumbnail_path(&event.id, &guest_id, &file_id);
    state
        .store
        .put_object(&thumb_path, thumbnail, "image/jpeg")
        .await
        .map_err(|e| {
            tracing::error!("Thumbnail PUT failed for {}: {}", thumb_path, e);
            AppError::Transport("Failed to store thumbnail".into())
        })?;

    let thumbnail_url = state
        .store
        .presign_read(&thumb_path, READ_URL_TTL_SECS, Utc::now());

    let cloud_path = ObjectStore::upload_path(&event.id, &guest_id, &file_name);
    let upload_url = state
        .store
        .presign_write(&cloud_path, WRITE_URL_TTL_SECS, Utc::now());

    tracing::info!(
        "Staged thumbnail {} for guest {} in event {}",
        file_id,
        authed.guest.id,
        event.id
    );

    Ok(Json(StageThumbnailResponse {
        success: true,
        cloud_path,
        thumbnail_url,
        upload_url: Some(upload_url),
    }))
}
