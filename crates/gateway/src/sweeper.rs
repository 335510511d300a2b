use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::{session, AppState};

const SWEEP_INTERVAL_SECS: u64 = 600;

/// Background sweeper: expired OTP rows and sessions are also purged lazily
/// on lookup, this keeps abandoned rows from accumulating.
pub struct CleanupDaemon {
    state: Arc<AppState>,
}

impl CleanupDaemon {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn start(&self) {
        info!(
            "Cleanup daemon initialized. Sweeping expired OTPs and sessions every {} seconds.",
            SWEEP_INTERVAL_SECS
        );

        let mut interval = time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        match self.state.otp.cleanup_expired(&self.state.db).await {
            Ok(0) => {}
            Ok(n) => info!("Swept {} expired OTP rows", n),
            Err(e) => error!("OTP sweep failed: {}", e),
        }

        match session::purge_expired(&self.state.db).await {
            Ok(0) => {}
            Ok(n) => info!("Swept {} expired sessions", n),
            Err(e) => error!("Session sweep failed: {}", e),
        }
    }
}
