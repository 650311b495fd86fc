//! Session — the daemon's own run lifecycle, guarded by a single mutex
//! so start/stop requests serialize (§4.11).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Inactive,
    Active,
    Stopping,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Inactive => "inactive",
            SessionStatus::Active => "active",
            SessionStatus::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Plain status snapshot; the stop signal itself lives in a
/// `tokio::sync::watch` channel owned by the session module, not here —
/// domain types stay free of runtime handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub status: SessionStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            status: SessionStatus::Inactive,
            started_at: None,
        }
    }
}
