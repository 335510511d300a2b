use chrono::{DateTime, Utc};
use keepsake_protocol::GuestProfile;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub date: DateTime<Utc>,
    pub venue: Option<String>,
    pub organizer_name: Option<String>,
    pub organizer_email: Option<String>,
    pub organizer_phone: Option<String>,
    pub passcode: Option<String>,
    pub is_active: bool,
    pub max_upload_size: i64,
    pub allowed_formats: Vec<String>,
    pub storage_quota: i64,
    pub storage_used: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn accepts_format(&self, mime: &str) -> bool {
        self.allowed_formats.is_empty() || self.allowed_formats.iter().any(|f| f == mime)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Guest {
    pub id: Uuid,
    pub event_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub table_id: Option<String>,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub upload_count: i32,
    pub total_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Guest {
    pub fn profile(&self) -> GuestProfile {
        GuestProfile {
            id: self.id.to_string(),
            name: self.name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            table_id: self.table_id.clone(),
        }
    }

    /// QR-code guests carry a table reference and may browse the whole event
    /// gallery.
    pub fn has_qr_access(&self) -> bool {
        self.table_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub guest_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const UPLOAD_STATUS_COMPLETED: &str = "COMPLETED";
