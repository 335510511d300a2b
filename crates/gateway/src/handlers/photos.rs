use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use keepsake_protocol::{PhotoItem, PhotoListResponse, UploadedBy, ViewingMode};

use crate::auth::verify_guest_session;
use crate::error::AppError;
use crate::storage::READ_URL_TTL_SECS;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default, rename = "viewAll")]
    pub view_all: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PhotoRow {
    id: Uuid,
    file_name: String,
    original_name: String,
    cloud_path: String,
    cloud_url: String,
    thumbnail_url: Option<String>,
    size: i64,
    created_at: DateTime<Utc>,
    guest_name: String,
    table_name: Option<String>,
    table_number: Option<String>,
}

pub async fn list_photos(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<PhotoListResponse>, AppError> {
    let authed = verify_guest_session(&state, &headers).await?;

    // Only QR-code guests may browse the whole gallery; everyone else sees
    // their own uploads regardless of the flag.
    let can_view_all = authed.guest.has_qr_access();
    let viewing_mode = if query.view_all && can_view_all {
        ViewingMode::All
    } else {
        ViewingMode::Own
    };

    let rows = match viewing_mode {
        ViewingMode::All => {
            sqlx::query_as::<_, PhotoRow>(
                r#"
                SELECT p.id, p.file_name, p.original_name, p.cloud_path, p.cloud_url,
                       p.thumbnail_url, p.size, p.created_at,
                       g.name AS guest_name, t.table_name, t.table_number
                FROM photos p
                JOIN guests g ON g.id = p.guest_id
                LEFT JOIN tables t ON t.id::TEXT = g.table_id
                WHERE p.event_id = $1
                  AND p.upload_status = 'COMPLETED'
                  AND p.cloud_url <> ''
                ORDER BY p.created_at DESC
                "#,
            )
            .bind(&authed.event_id)
            .fetch_all(&state.db)
            .await?
        }
        ViewingMode::Own => {
            sqlx::query_as::<_, PhotoRow>(
                r#"
                SELECT p.id, p.file_name, p.original_name, p.cloud_path, p.cloud_url,
                       p.thumbnail_url, p.size, p.created_at,
                       g.name AS guest_name, t.table_name, t.table_number
                FROM photos p
                JOIN guests g ON g.id = p.guest_id
                LEFT JOIN tables t ON t.id::TEXT = g.table_id
                WHERE p.guest_id = $1
                  AND p.upload_status = 'COMPLETED'
                  AND p.cloud_url <> ''
                ORDER BY p.created_at DESC
                "#,
            )
            .bind(authed.guest.id)
            .fetch_all(&state.db)
            .await?
        }
    };

    let mut photos = Vec::with_capacity(rows.len());
    for row in rows {
        let url = signed_url(&state, &row.cloud_path, &row.cloud_url).await;
        let uploaded_by = match viewing_mode {
            ViewingMode::All => Some(UploadedBy {
                name: row.guest_name,
                table: row.table_name.or(row.table_number),
            }),
            ViewingMode::Own => None,
        };
        photos.push(PhotoItem {
            id: row.id.to_string(),
            file_name: row.file_name,
            original_name: row.original_name,
            url,
            thumbnail_url: row.thumbnail_url,
            size: row.size,
            uploaded_at: row.created_at,
            uploaded_by,
        });
    }

    let total_count = photos.len();
    Ok(Json(PhotoListResponse {
        success: true,
        photos,
        total_count,
        can_view_all,
        viewing_mode,
    }))
}

/// The stored URL was signed at upload time and may be near expiry; re-sign
/// from the object path and memoize. Rows from before path tracking fall back
/// to whatever URL was stored.
async fn signed_url(state: &AppState, cloud_path: &str, stored_url: &str) -> String {
    if cloud_path.is_empty() {
        return stored_url.to_string();
    }
    let store = state.store.clone();
    let path = cloud_path.to_string();
    state
        .url_cache
        .get_with(path.clone(), async move {
            store.presign_read(&path, READ_URL_TTL_SECS, Utc::now())
        })
        .await
}
