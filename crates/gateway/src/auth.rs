use axum::http::HeaderMap;

use crate::error::AppError;
use crate::models::Guest;
use crate::session::{self, SessionLookup};
use crate::AppState;

pub const SESSION_COOKIE: &str = "guest-session";

pub(crate) fn get_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie_header = headers.get("cookie")?.to_str().ok()?;
    for pair in cookie_header.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        let key = parts.next()?.trim();
        let value = parts.next()?.trim();
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

/// Cookie token takes precedence over the Authorization header.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    get_cookie_value(headers, SESSION_COOKIE).or_else(|| bearer_token(headers))
}

/// Session cookie for the browser gallery. Deliberately not HttpOnly: the
/// upload script reads the token to send it as a bearer header.
pub fn build_session_cookie(token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; SameSite=Lax",
        SESSION_COOKIE, token, max_age_secs
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct AuthedGuest {
    pub guest: Guest,
    pub event_id: String,
}

/// Resolve the request's token to an authenticated guest. Expired sessions
/// are purged on sight; guests that never completed OTP are rejected.
pub async fn verify_guest_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthedGuest, AppError> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthenticated("No session token provided".into()))?;

    let session = match session::find_valid(&state.db, &token).await? {
        SessionLookup::Missing => {
            return Err(AppError::Unauthenticated("Session not found".into()));
        }
        SessionLookup::Expired => {
            return Err(AppError::Unauthenticated("Session expired".into()));
        }
        SessionLookup::Valid(session) => session,
    };

    let guest = sqlx::query_as::<_, Guest>("SELECT * FROM guests WHERE id = $1")
        .bind(session.guest_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| AppError::Unauthenticated("Session not found".into()))?;

    if guest.authenticated_at.is_none() {
        return Err(AppError::Unauthenticated("Phone number not verified".into()));
    }

    let event_id = guest.event_id.clone();
    Ok(AuthedGuest { guest, event_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn no_token_yields_none() {
        assert!(extract_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn bearer_header_is_accepted() {
        let h = headers(&[("authorization", "Bearer abc123")]);
        assert_eq!(extract_token(&h).as_deref(), Some("abc123"));
    }

    #[test]
    fn cookie_takes_precedence_over_bearer() {
        let h = headers(&[
            ("cookie", "theme=dark; guest-session=cookie-tok; lang=en"),
            ("authorization", "Bearer header-tok"),
        ]);
        assert_eq!(extract_token(&h).as_deref(), Some("cookie-tok"));
    }

    #[test]
    fn session_cookie_is_lax_and_not_http_only() {
        let cookie = build_session_cookie("tok", 3 * 24 * 60 * 60, false);
        assert_eq!(
            cookie,
            "guest-session=tok; Path=/; Max-Age=259200; SameSite=Lax"
        );
        assert!(!cookie.contains("HttpOnly"));

        let secure = build_session_cookie("tok", 60, true);
        assert!(secure.ends_with("; Secure"));
    }

    #[test]
    fn client_ip_prefers_forwarded_for_first_hop() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(client_ip(&h).as_deref(), Some("203.0.113.7"));

        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h).as_deref(), Some("198.51.100.2"));
    }
}
