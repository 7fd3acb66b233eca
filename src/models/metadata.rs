use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session metadata persisted as `metadata.json` next to the workspace.
///
/// Rewritten whole-file on every change; `last_modified` is restamped on
/// every write.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// De-duplicated, sorted set of user ids that have acted in the session.
    pub participants: Vec<String>,
    /// Whether the workspace itself is a version-controlled tree.
    pub git_repo: bool,
}

impl SessionMetadata {
    pub fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_modified: now,
            participants: Vec::new(),
            git_repo: false,
        }
    }

    /// Union a participant into the set. Returns true if it was new.
    pub fn add_participant(&mut self, user_id: &str) -> bool {
        match self.participants.binary_search_by(|p| p.as_str().cmp(user_id)) {
            Ok(_) => false,
            Err(idx) => {
                self.participants.insert(idx, user_id.to_string());
                true
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}
