use axum::{extract::State, http::HeaderMap, Json};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use keepsake_protocol::{
    AdminPhotoItem, AdminPhotosResponse, AdminStatsResponse, CleanupResponse,
};

use crate::error::AppError;
use crate::handlers::upload::resolve_event;
use crate::models::Event;
use crate::AppState;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // No configured token means an open dashboard, intended for single-event
    // deployments behind their own network boundary.
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(AppError::Unauthenticated("Admin token required".into()))
    }
}

async fn active_event(state: &AppState) -> Result<Event, AppError> {
    if let Some(event) = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE is_active ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_optional(&state.db)
    .await?
    {
        return Ok(event);
    }
    resolve_event(state, None).await
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AdminStatsResponse>, AppError> {
    require_admin(&state, &headers)?;
    let event = active_event(&state).await?;

    let total_guests: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM guests WHERE event_id = $1")
            .bind(&event.id)
            .fetch_one(&state.db)
            .await?;

    let total_photos: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM photos WHERE event_id = $1 AND upload_status = 'COMPLETED'",
    )
    .bind(&event.id)
    .fetch_one(&state.db)
    .await?;

    let total_size: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(size), 0)::BIGINT FROM photos WHERE event_id = $1 AND upload_status = 'COMPLETED'",
    )
    .bind(&event.id)
    .fetch_one(&state.db)
    .await?;

    let tables: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tables WHERE event_id = $1")
        .bind(&event.id)
        .fetch_one(&state.db)
        .await?;

    Ok(Json(AdminStatsResponse {
        total_guests,
        total_photos,
        total_size,
        tables,
        event_name: event.name,
        event_id: event.id,
    }))
}

#[derive(Debug, sqlx::FromRow)]
struct AdminPhotoRow {
    id: Uuid,
    file_name: String,
    cloud_url: String,
    thumbnail_url: Option<String>,
    size: i64,
    created_at: DateTime<Utc>,
    guest_name: String,
}

pub async fn photos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<AdminPhotosResponse>, AppError> {
    require_admin(&state, &headers)?;
    let event = active_event(&state).await?;

    let rows = sqlx::query_as::<_, AdminPhotoRow>(
        r#"
        SELECT p.id, p.file_name, p.cloud_url, p.thumbnail_url, p.size, p.created_at,
               g.name AS guest_name
        FROM photos p
        JOIN guests g ON g.id = p.guest_id
        WHERE p.event_id = $1 AND p.upload_status = 'COMPLETED'
        ORDER BY p.created_at DESC
        "#,
    )
    .bind(&event.id)
    .fetch_all(&state.db)
    .await?;

    let photos: Vec<AdminPhotoItem> = rows
        .into_iter()
        .map(|row| AdminPhotoItem {
            id: row.id.to_string(),
            file_name: row.file_name,
            thumbnail_url: row.thumbnail_url.unwrap_or_else(|| row.cloud_url.clone()),
            cloud_url: row.cloud_url,
            size: row.size,
            uploaded_at: row.created_at,
            guest_name: row.guest_name,
        })
        .collect();

    let total = photos.len();
    Ok(Json(AdminPhotosResponse {
        photos,
        total,
        event_id: event.id,
        event_name: event.name,
    }))
}

/// Delete photo rows whose upload never produced a stored object. Rows with a
/// missing thumbnail but a good full-resolution URL are kept.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CleanupResponse>, AppError> {
    require_admin(&state, &headers)?;

    // Retract staged thumbnails of broken rows before dropping them.
    let orphaned_thumbs: Vec<String> = sqlx::query_scalar(
        "SELECT thumbnail_path FROM photos
         WHERE (cloud_url = '' OR cloud_path = '') AND thumbnail_path IS NOT NULL",
    )
    .fetch_all(&state.db)
    .await?;
    for path in orphaned_thumbs {
        if let Err(e) = state.store.delete_object(&path).await {
            tracing::warn!("Failed to delete orphaned thumbnail {}: {}", path, e);
        }
    }

    let result = sqlx::query("DELETE FROM photos WHERE cloud_url = '' OR cloud_path = ''")
        .execute(&state.db)
        .await?;
    let cleaned = result.rows_affected();

    if cleaned > 0 {
        tracing::info!("Cleanup removed {} broken photo rows", cleaned);
    }

    Ok(Json(CleanupResponse {
        success: true,
        message: format!("Removed {} photos with missing files", cleaned),
        cleaned,
    }))
}
