use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub length: u32,
    pub expiry_minutes: i64,
    pub max_attempts: i32,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            length: 6,
            expiry_minutes: 5,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("OTP not found. Please request a new one.")]
    NotFound,

    #[error("OTP has expired. Please request a new one.")]
    Expired,

    #[error("Maximum attempts exceeded. Please request a new OTP.")]
    AttemptsExceeded,

    #[error("Invalid OTP. {remaining} attempts remaining.")]
    Mismatch { remaining: i32 },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub otp: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestGate {
    pub allowed: bool,
    pub wait_secs: u64,
}

#[derive(sqlx::FromRow)]
struct StoredOtp {
    otp: String,
    expires_at: DateTime<Utc>,
    attempts: i32,
}

/// One-time-passcode issue/verify service. All state lives in the
/// `otp_verifications` table, one row per (phone, event) key.
#[derive(Debug, Clone)]
pub struct OtpService {
    cfg: OtpConfig,
}

impl OtpService {
    pub fn new(cfg: OtpConfig) -> Self {
        Self { cfg }
    }

    /// Uniform draw over [10^(n-1), 10^n - 1] from the OS CSPRNG.
    pub fn generate(&self) -> String {
        let min = 10u64.pow(self.cfg.length - 1);
        let max = 10u64.pow(self.cfg.length) - 1;
        let code = OsRng.gen_range(min..=max);
        format!("{:0width$}", code, width = self.cfg.length as usize)
    }

    /// Create-or-replace the single OTP row for this key. The upsert keeps
    /// concurrent issuers from ever producing two live rows.
    pub async fn issue(
        &self,
        db: &PgPool,
        phone: &str,
        event_id: &str,
    ) -> Result<IssuedOtp, sqlx::Error> {
        let otp = self.generate();
        let expires_at = Utc::now() + Duration::minutes(self.cfg.expiry_minutes);

        sqlx::query(
            r#"
            INSERT INTO otp_verifications (phone, event_id, otp, expires_at, attempts)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (phone, event_id) DO UPDATE SET
                otp = excluded.otp,
                expires_at = excluded.expires_at,
                attempts = 0
            "#,
        )
        .bind(phone)
        .bind(event_id)
        .bind(&otp)
        .bind(expires_at)
        .execute(db)
        .await?;

        Ok(IssuedOtp { otp, expires_at })
    }

    /// Single-use verification: the row is deleted on success, on expiry, and
    /// on attempt exhaustion. A mismatch burns one attempt.
    pub async fn verify(
        &self,
        db: &PgPool,
        phone: &str,
        otp: &str,
        event_id: &str,
    ) -> Result<(), VerifyError> {
        let stored = sqlx::query_as::<_, StoredOtp>(
            "SELECT otp, expires_at, attempts FROM otp_verifications
             WHERE phone = $1 AND event_id = $2",
        )
        .bind(phone)
        .bind(event_id)
        .fetch_optional(db)
        .await?;

        let outcome = check_stored(stored.as_ref(), otp, Utc::now(), self.cfg.max_attempts);
        match &outcome {
            Ok(()) | Err(VerifyError::Expired) | Err(VerifyError::AttemptsExceeded) => {
                self.delete(db, phone, event_id).await?;
            }
            Err(VerifyError::Mismatch { .. }) => {
                sqlx::query(
                    "UPDATE otp_verifications SET attempts = attempts + 1
                     WHERE phone = $1 AND event_id = $2",
                )
                .bind(phone)
                .bind(event_id)
                .execute(db)
                .await?;
            }
            Err(VerifyError::NotFound) | Err(VerifyError::Db(_)) => {}
        }
        outcome
    }

    /// Sole rate-limiting mechanism: one outstanding OTP blocks reissue until
    /// it expires.
    pub async fn can_request(
        &self,
        db: &PgPool,
        phone: &str,
        event_id: &str,
    ) -> Result<RequestGate, sqlx::Error> {
        let expires_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT expires_at FROM otp_verifications WHERE phone = $1 AND event_id = $2",
        )
        .bind(phone)
        .bind(event_id)
        .fetch_optional(db)
        .await?;

        let gate = match expires_at {
            Some(expires_at) => {
                let wait = remaining_wait(expires_at, Utc::now());
                RequestGate {
                    allowed: wait == 0,
                    wait_secs: wait,
                }
            }
            None => RequestGate {
                allowed: true,
                wait_secs: 0,
            },
        };
        Ok(gate)
    }

    pub async fn cleanup_expired(&self, db: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM otp_verifications WHERE expires_at < NOW()")
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, db: &PgPool, phone: &str, event_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM otp_verifications WHERE phone = $1 AND event_id = $2")
            .bind(phone)
            .bind(event_id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// The verification decision, separated from row effects. A missing row is
/// `NotFound` (also the answer for an already-consumed code), expiry and
/// attempt exhaustion are checked before the code itself, and a mismatch
/// reports how many attempts remain after this one is burned.
fn check_stored(
    stored: Option<&StoredOtp>,
    submitted: &str,
    now: DateTime<Utc>,
    max_attempts: i32,
) -> Result<(), VerifyError> {
    let Some(stored) = stored else {
        return Err(VerifyError::NotFound);
    };
    if now > stored.expires_at {
        return Err(VerifyError::Expired);
    }
    if stored.attempts >= max_attempts {
        return Err(VerifyError::AttemptsExceeded);
    }
    if stored.otp != submitted {
        return Err(VerifyError::Mismatch {
            remaining: max_attempts - stored.attempts - 1,
        });
    }
    Ok(())
}

/// Ceiling of whole seconds until expiry; 0 once expired.
pub fn remaining_wait(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (expires_at - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    ((millis + 999) / 1000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_fixed_length_decimal() {
        let svc = OtpService::new(OtpConfig::default());
        for _ in 0..200 {
            let code = svc.generate();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
            let n: u64 = code.parse().unwrap();
            assert!((100_000..=999_999).contains(&n));
        }
    }

    #[test]
    fn generated_codes_vary() {
        let svc = OtpService::new(OtpConfig::default());
        let a = svc.generate();
        let distinct = (0..20).map(|_| svc.generate()).any(|c| c != a);
        assert!(distinct);
    }

    #[test]
    fn shorter_lengths_keep_leading_zero_padding_width() {
        let svc = OtpService::new(OtpConfig {
            length: 4,
            ..OtpConfig::default()
        });
        for _ in 0..50 {
            assert_eq!(svc.generate().len(), 4);
        }
    }

    fn stored(otp: &str, expires_at: DateTime<Utc>, attempts: i32) -> StoredOtp {
        StoredOtp {
            otp: otp.to_string(),
            expires_at,
            attempts,
        }
    }

    #[test]
    fn correct_code_is_single_use() {
        let now = Utc::now();
        let row = stored("482913", now + Duration::minutes(5), 0);
        assert!(check_stored(Some(&row), "482913", now, 3).is_ok());

        // Success deletes the row; resubmitting the same code finds nothing.
        assert!(matches!(
            check_stored(None, "482913", now, 3),
            Err(VerifyError::NotFound)
        ));
    }

    #[test]
    fn correct_code_is_rejected_after_expiry() {
        let issued = Utc::now();
        let row = stored("482913", issued + Duration::minutes(5), 0);
        let late = issued + Duration::minutes(5) + Duration::seconds(1);
        assert!(matches!(
            check_stored(Some(&row), "482913", late, 3),
            Err(VerifyError::Expired)
        ));
    }

    #[test]
    fn three_wrong_attempts_block_the_correct_code() {
        let now = Utc::now();
        let expires_at = now + Duration::minutes(5);
        let mut row = stored("482913", expires_at, 0);

        for expected_remaining in [2, 1, 0] {
            match check_stored(Some(&row), "000000", now, 3) {
                Err(VerifyError::Mismatch { remaining }) => {
                    assert_eq!(remaining, expected_remaining);
                }
                other => panic!("expected mismatch, got {:?}", other.err()),
            }
            row.attempts += 1;
        }

        // The fourth attempt is exhausted even with the right code.
        assert!(matches!(
            check_stored(Some(&row), "482913", now, 3),
            Err(VerifyError::AttemptsExceeded)
        ));
    }

    #[test]
    fn remaining_wait_rounds_up() {
        let now = Utc::now();
        assert_eq!(remaining_wait(now + Duration::milliseconds(1500), now), 2);
        assert_eq!(remaining_wait(now + Duration::seconds(30), now), 30);
        assert_eq!(remaining_wait(now + Duration::milliseconds(1), now), 1);
    }

    #[test]
    fn remaining_wait_is_zero_after_expiry() {
        let now = Utc::now();
        assert_eq!(remaining_wait(now - Duration::seconds(1), now), 0);
        assert_eq!(remaining_wait(now, now), 0);
    }
}
