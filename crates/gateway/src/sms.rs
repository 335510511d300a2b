use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub endpoint: String,
    pub api_token: String,
    pub sender_id: String,
    pub country_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    Success,
    Error,
}

/// Tagged outcome of an SMS call. Transport failures are folded into an
/// `Error` outcome; nothing propagates past this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsOutcome {
    pub status: SmsStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl SmsOutcome {
    fn success() -> Self {
        Self {
            status: SmsStatus::Success,
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: SmsStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == SmsStatus::Error
    }
}

/// HTTP client for the third-party SMS gateway.
#[derive(Clone)]
pub struct SmsClient {
    http: reqwest::Client,
    cfg: SmsConfig,
}

impl SmsClient {
    pub fn new(cfg: SmsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    pub async fn send_otp(&self, phone: &str, otp: &str) -> SmsOutcome {
        let message = format!(
            "Your {} verification code is: {}\n\nThis code will expire in 5 minutes.\n\n- {}",
            self.cfg.sender_id, otp, self.cfg.sender_id
        );
        self.send(phone, &message).await
    }

    pub async fn send_welcome(&self, phone: &str, guest_name: &str) -> SmsOutcome {
        let message = format!(
            "Welcome {guest_name}!\n\nYou can now upload photos from the event.\n\nThank you for sharing your memories with us!"
        );
        self.send(phone, &message).await
    }

    pub async fn send_upload_confirmation(&self, phone: &str, photo_count: u32) -> SmsOutcome {
        let plural = if photo_count == 1 { "" } else { "s" };
        let message = format!(
            "Thank you!\n\n{photo_count} photo{plural} uploaded successfully.\n\nThe couple will love your memories!"
        );
        self.send(phone, &message).await
    }

    async fn send(&self, recipient: &str, message: &str) -> SmsOutcome {
        let recipient = format_number(&self.cfg.country_code, recipient);
        let payload = serde_json::json!({
            "api_token": self.cfg.api_token,
            "recipient": recipient,
            "sender_id": self.cfg.sender_id,
            "type": "plain",
            "message": message,
        });

        match self.http.post(&self.cfg.endpoint).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<SmsOutcome>().await.unwrap_or_else(|_| SmsOutcome::success())
            }
            Ok(resp) => {
                tracing::error!("SMS gateway rejected request: HTTP {}", resp.status());
                SmsOutcome::error(format!("SMS gateway returned HTTP {}", resp.status()))
            }
            Err(e) => {
                tracing::error!("SMS sending failed: {}", e);
                SmsOutcome::error(e.to_string())
            }
        }
    }
}

/// Canonical international form: separators stripped, leading "0" swapped for
/// the country code, bare national numbers prefixed with it.
pub fn format_number(country_code: &str, phone: &str) -> String {
    let cleaned: String = phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    if let Some(rest) = cleaned.strip_prefix('0') {
        return format!("{country_code}{rest}");
    }
    if cleaned.starts_with(country_code) {
        return cleaned;
    }
    format!("{country_code}{cleaned}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_zero_becomes_country_code() {
        assert_eq!(format_number("94", "0771234567"), "94771234567");
    }

    #[test]
    fn bare_national_number_gets_prefixed() {
        assert_eq!(format_number("94", "771234567"), "94771234567");
    }

    #[test]
    fn already_international_is_untouched() {
        assert_eq!(format_number("94", "94771234567"), "94771234567");
    }

    #[test]
    fn separators_are_stripped() {
        assert_eq!(format_number("94", "077-123 (45)67"), "94771234567");
    }

    #[test]
    fn outcome_parses_gateway_error_body() {
        let outcome: SmsOutcome =
            serde_json::from_str(r#"{"status":"error","message":"invalid token"}"#).unwrap();
        assert!(outcome.is_error());
        assert_eq!(outcome.message.as_deref(), Some("invalid token"));
    }
}
