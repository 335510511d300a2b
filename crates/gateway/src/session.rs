use chrono::{Duration, Utc};
use rand::RngCore;
use sqlx::PgPool;

use crate::models::Session;

/// 32 random bytes, hex encoded. Opaque bearer credential.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn create_session(
    db: &PgPool,
    guest_id: uuid::Uuid,
    ttl_days: i64,
    ip_address: Option<String>,
    user_agent: Option<String>,
) -> Result<Session, sqlx::Error> {
    let token = new_session_token();
    let expires_at = Utc::now() + Duration::days(ttl_days);

    sqlx::query_as::<_, Session>(
        r#"
        INSERT INTO sessions (guest_id, token, expires_at, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(guest_id)
    .bind(&token)
    .bind(expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .fetch_one(db)
    .await
}

pub enum SessionLookup {
    Missing,
    Expired,
    Valid(Session),
}

/// Token lookup with lazy purge: an expired row is deleted on sight.
pub async fn find_valid(db: &PgPool, token: &str) -> Result<SessionLookup, sqlx::Error> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE token = $1")
        .bind(token)
        .fetch_optional(db)
        .await?;

    let Some(session) = session else {
        return Ok(SessionLookup::Missing);
    };

    if session.expires_at < Utc::now() {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session.id)
            .execute(db)
            .await?;
        return Ok(SessionLookup::Expired);
    }

    Ok(SessionLookup::Valid(session))
}

pub async fn delete_by_token(db: &PgPool, token: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE token = $1")
        .bind(token)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn purge_expired(db: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_64_char_hex() {
        let token = new_session_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(new_session_token(), new_session_token());
    }
}
