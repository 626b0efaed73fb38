//! Pending multi-stage logins.
//!
//! A pending login ties a session id to the identity resolved at the
//! credential stage and to the stage it is waiting for. Entries live for the
//! configured TTL and are pruned whenever a new one is stored.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use ulid::Ulid;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoginStage {
    AwaitingCredential,
    AwaitingFace,
    AwaitingFallbackCode,
    Authenticated,
}

impl LoginStage {
    /// Stage name clients send next.
    #[must_use]
    pub const fn next_stage(self) -> Option<&'static str> {
        match self {
            Self::AwaitingCredential => Some("credential"),
            Self::AwaitingFace => Some("face"),
            Self::AwaitingFallbackCode => Some("fallback"),
            Self::Authenticated => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    pub identity_id: Uuid,
    pub stage: LoginStage,
    pub wrong_codes: u32,
    created_at: Instant,
}

/// What happened to a pending login after a wrong fallback code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeStrike {
    Retry { remaining: u32 },
    Discarded,
}

pub struct PendingLogins {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingLogin>>,
}

impl PendingLogins {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Open a login waiting for the face stage.
    pub async fn start(&self, identity_id: Uuid) -> String {
        let session_id = Ulid::new().to_string();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        entries.insert(
            session_id.clone(),
            PendingLogin {
                identity_id,
                stage: LoginStage::AwaitingFace,
                wrong_codes: 0,
                created_at: Instant::now(),
            },
        );
        session_id
    }

    /// Live pending login in `stage`, if any.
    pub async fn expecting(&self, session_id: &str, stage: LoginStage) -> Option<PendingLogin> {
        let mut entries = self.entries.lock().await;
        let expired = entries
            .get(session_id)
            .is_some_and(|entry| entry.created_at.elapsed() >= self.ttl);
        if expired {
            entries.remove(session_id);
            return None;
        }
        entries
            .get(session_id)
            .filter(|entry| entry.stage == stage)
            .cloned()
    }

    pub async fn advance(&self, session_id: &str, stage: LoginStage) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(session_id) {
            Some(entry) => {
                entry.stage = stage;
                true
            }
            None => false,
        }
    }

    /// Count a wrong code; the login is dropped once `max_wrong` is reached.
    pub async fn strike(&self, session_id: &str, max_wrong: u32) -> CodeStrike {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return CodeStrike::Discarded;
        };
        entry.wrong_codes = entry.wrong_codes.saturating_add(1);
        if entry.wrong_codes >= max_wrong {
            entries.remove(session_id);
            CodeStrike::Discarded
        } else {
            CodeStrike::Retry {
                remaining: max_wrong - entry.wrong_codes,
            }
        }
    }

    pub async fn finish(&self, session_id: &str) -> Option<PendingLogin> {
        self.entries.lock().await.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
