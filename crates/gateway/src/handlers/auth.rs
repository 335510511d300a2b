use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use keepsake_protocol::{
    SendOtpRequest, SendOtpResponse, SessionInfo, SessionIntrospectResponse, VerifyOtpRequest,
    VerifyOtpResponse,
};

use crate::auth::{build_session_cookie, client_ip, user_agent, verify_guest_session};
use crate::error::AppError;
use crate::models::Guest;
use crate::otp::VerifyError;
use crate::{session, AppState};

/// National mobile number: optional leading "0" or country code, then a
/// 9-digit subscriber number starting with 7.
pub(crate) fn is_valid_phone(phone: &str, country_code: &str) -> bool {
    let cleaned: String = phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let national = if let Some(rest) = cleaned.strip_prefix('0') {
        rest
    } else if let Some(rest) = cleaned.strip_prefix(country_code) {
        rest
    } else {
        cleaned.as_str()
    };
    national.len() == 9 && national.starts_with('7')
}

pub async fn send_otp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendOtpRequest>,
) -> Result<Json<SendOtpResponse>, AppError> {
    if payload.phone.is_empty() || payload.event_id.is_empty() {
        return Err(AppError::Validation(
            "Phone number and event ID are required".into(),
        ));
    }
    if !is_valid_phone(&payload.phone, &state.config.sms.country_code) {
        return Err(AppError::Validation("Invalid phone number format".into()));
    }

    let gate = state
        .otp
        .can_request(&state.db, &payload.phone, &payload.event_id)
        .await?;
    if !gate.allowed {
        return Err(AppError::RateLimited {
            wait: gate.wait_secs,
        });
    }

    let issued = state
        .otp
        .issue(&state.db, &payload.phone, &payload.event_id)
        .await?;

    let sms_result = state.sms.send_otp(&payload.phone, &issued.otp).await;
    if sms_result.is_error() {
        return Err(AppError::Transport(
            "Failed to send SMS. Please try again.".into(),
        ));
    }

    tracing::info!("OTP sent to {} for event {}", payload.phone, payload.event_id);

    Ok(Json(SendOtpResponse {
        success: true,
        message: "OTP sent successfully".into(),
        expires_at: issued.expires_at,
    }))
}

pub async fn verify_otp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<VerifyOtpRequest>,
) -> Result<Response, AppError> {
    if payload.phone.is_empty()
        || payload.otp.is_empty()
        || payload.event_id.is_empty()
        || payload.name.is_empty()
    {
        return Err(AppError::Validation(
            "Phone, OTP, event ID, and name are required".into(),
        ));
    }

    state
        .otp
        .verify(&state.db, &payload.phone, &payload.otp, &payload.event_id)
        .await
        .map_err(|e| match e {
            VerifyError::Db(e) => AppError::Database(e),
            other => AppError::Validation(other.to_string()),
        })?;

    let existing = sqlx::query_as::<_, Guest>(
        r#"
        SELECT * FROM guests
        WHERE event_id = $1
          AND (phone = $2 OR ($3::TEXT IS NOT NULL AND email = $3))
        LIMIT 1
        "#,
    )
    .bind(&payload.event_id)
    .bind(&payload.phone)
    .bind(&payload.email)
    .fetch_optional(&state.db)
    .await?;

    let is_new_guest = existing.is_none();
    let guest = match existing {
        None => {
            sqlx::query_as::<_, Guest>(
                r#"
                INSERT INTO guests (event_id, name, phone, email, table_id, authenticated_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                RETURNING *
                "#,
            )
            .bind(&payload.event_id)
            .bind(&payload.name)
            .bind(&payload.phone)
            .bind(&payload.email)
            .bind(&payload.table_id)
            .fetch_one(&state.db)
            .await?
        }
        Some(guest) => {
            // Repeat authentication refreshes the profile; absent fields keep
            // their previous values.
            sqlx::query_as::<_, Guest>(
                r#"
                UPDATE guests SET
                    name = $2,
                    phone = $3,
                    email = COALESCE($4, email),
                    table_id = COALESCE($5, table_id),
                    authenticated_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(guest.id)
            .bind(&payload.name)
            .bind(&payload.phone)
            .bind(&payload.email)
            .bind(&payload.table_id)
            .fetch_one(&state.db)
            .await?
        }
    };

    let session = session::create_session(
        &state.db,
        guest.id,
        state.config.session_ttl_days,
        client_ip(&headers),
        user_agent(&headers),
    )
    .await?;

    if is_new_guest {
        let sms = state.sms.clone();
        let phone = payload.phone.clone();
        let name = guest.name.clone();
        tokio::spawn(async move {
            let outcome = sms.send_welcome(&phone, &name).await;
            if outcome.is_error() {
                tracing::warn!("Welcome SMS failed for {}: {:?}", phone, outcome.message);
            }
        });
    }

    tracing::info!("Guest {} verified for event {}", guest.id, payload.event_id);

    let cookie = build_session_cookie(
        &session.token,
        state.config.session_ttl_days * 24 * 60 * 60,
        state.config.cookie_secure,
    );

    let mut response_headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        response_headers.append(SET_COOKIE, v);
    }

    let body = VerifyOtpResponse {
        success: true,
        message: "Phone verified successfully!".into(),
        guest: guest.profile(),
        session: SessionInfo {
            token: session.token,
            expires_at: session.expires_at,
        },
    };

    Ok((response_headers, Json(body)).into_response())
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(token) = crate::auth::extract_token(&headers) {
        session::delete_by_token(&state.db, &token).await?;
    }

    // Expire the cookie regardless of whether a session row existed.
    let cookie = build_session_cookie("", 0, state.config.cookie_secure);
    let mut response_headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        response_headers.append(SET_COOKIE, v);
    }

    Ok((
        response_headers,
        Json(serde_json::json!({ "success": true })),
    )
        .into_response())
}

pub async fn session_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionIntrospectResponse>, AppError> {
    let authed = verify_guest_session(&state, &headers).await?;
    Ok(Json(SessionIntrospectResponse {
        authenticated: true,
        guest: authed.guest.profile(),
        event_id: authed.event_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_national_and_international_forms() {
        assert!(is_valid_phone("0771234567", "94"));
        assert!(is_valid_phone("94771234567", "94"));
        assert!(is_valid_phone("771234567", "94"));
        assert!(is_valid_phone("077-123 4567", "94"));
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert!(!is_valid_phone("", "94"));
        assert!(!is_valid_phone("12345", "94"));
        assert!(!is_valid_phone("0881234567", "94")); // not a mobile prefix
        assert!(!is_valid_phone("07712345678", "94")); // too long
        assert!(!is_valid_phone("abc1234567", "94"));
    }
}
