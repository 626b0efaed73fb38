//! In-memory [`Store`] used by tests and by development mode.
//!
//! Clones share the same data. Nothing survives the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AttemptFilter, StorageError, StorageResult, Store};
use crate::identity::{BiometricRegistration, Identity};
use crate::ledger::{AttemptOutcome, AttemptRecord, AttemptStage};
use crate::limiter::BlockEntry;
use crate::policy::RecognitionPolicy;

#[derive(Default)]
struct Inner {
    identities: HashMap<Uuid, Identity>,
    /// Insertion order; listings walk it backwards.
    attempts: Vec<AttemptRecord>,
    blocks: HashMap<String, BlockEntry>,
    policies: Vec<RecognitionPolicy>,
    active_policy: Option<i64>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StorageResult<()> {
        self.ensure_available()
    }

    async fn insert_identity(&self, identity: &Identity) -> StorageResult<()> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        if inner.identities.values().any(|existing| {
            existing.id == identity.id
                || existing.username == identity.username
                || existing.dni == identity.dni
        }) {
            return Err(StorageError::Conflict(format!(
                "identity {} already exists",
                identity.username
            )));
        }
        inner.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn find_identity(&self, id: Uuid) -> StorageResult<Option<Identity>> {
        self.ensure_available()?;
        Ok(self.inner.read().await.identities.get(&id).cloned())
    }

    async fn find_identity_by_key(&self, key: &str) -> StorageResult<Option<Identity>> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        let by_username = inner
            .identities
            .values()
            .find(|identity| identity.username == key);
        Ok(by_username
            .or_else(|| inner.identities.values().find(|identity| identity.dni == key))
            .cloned())
    }

    async fn register_biometrics(
        &self,
        id: Uuid,
        registration: &BiometricRegistration,
    ) -> StorageResult<Option<Identity>> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        Ok(inner.identities.get_mut(&id).map(|identity| {
            identity.apply_registration(registration);
            identity.clone()
        }))
    }

    async fn set_failed_attempts(&self, id: Uuid, failed_attempts: u32) -> StorageResult<()> {
        self.ensure_available()?;
        if let Some(identity) = self.inner.write().await.identities.get_mut(&id) {
            identity.failed_attempts = failed_attempts;
        }
        Ok(())
    }

    async fn insert_attempt(&self, record: &AttemptRecord) -> StorageResult<()> {
        self.ensure_available()?;
        self.inner.write().await.attempts.push(record.clone());
        Ok(())
    }

    async fn count_attempts_since(
        &self,
        source: &str,
        stage: AttemptStage,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        let count = inner
            .attempts
            .iter()
            .filter(|record| {
                record.source == source && record.stage == stage && record.created_at >= since
            })
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn consecutive_failures(&self, identity_id: Uuid) -> StorageResult<u32> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        let failures = inner
            .attempts
            .iter()
            .rev()
            .filter(|record| {
                record.identity_id == Some(identity_id) && record.stage == AttemptStage::Face
            })
            .take_while(|record| record.outcome != AttemptOutcome::Success)
            .filter(|record| record.outcome == AttemptOutcome::Failed)
            .count();
        Ok(u32::try_from(failures).unwrap_or(u32::MAX))
    }

    async fn list_attempts(&self, filter: &AttemptFilter) -> StorageResult<Vec<AttemptRecord>> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .attempts
            .iter()
            .rev()
            .filter(|record| {
                filter
                    .identity_id
                    .map_or(true, |id| record.identity_id == Some(id))
                    && filter
                        .source
                        .as_deref()
                        .map_or(true, |source| record.source == source)
                    && filter.outcome.map_or(true, |outcome| record.outcome == outcome)
            })
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn find_block(&self, source: &str) -> StorageResult<Option<BlockEntry>> {
        self.ensure_available()?;
        Ok(self.inner.read().await.blocks.get(source).cloned())
    }

    async fn upsert_block(&self, entry: &BlockEntry) -> StorageResult<()> {
        self.ensure_available()?;
        self.inner
            .write()
            .await
            .blocks
            .insert(entry.source.clone(), entry.clone());
        Ok(())
    }

    async fn delete_block(&self, source: &str) -> StorageResult<bool> {
        self.ensure_available()?;
        Ok(self.inner.write().await.blocks.remove(source).is_some())
    }

    async fn list_blocks(&self) -> StorageResult<Vec<BlockEntry>> {
        self.ensure_available()?;
        let mut blocks: Vec<BlockEntry> = self.inner.read().await.blocks.values().cloned().collect();
        blocks.sort_by(|lhs, rhs| rhs.created_at.cmp(&lhs.created_at));
        Ok(blocks)
    }

    async fn active_policy(&self) -> StorageResult<Option<RecognitionPolicy>> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        Ok(inner.active_policy.and_then(|version| {
            inner
                .policies
                .iter()
                .find(|policy| policy.version == version)
                .cloned()
        }))
    }

    async fn activate_policy(
        &self,
        policy: &RecognitionPolicy,
    ) -> StorageResult<RecognitionPolicy> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        let version = inner
            .policies
            .iter()
            .map(|stored| stored.version)
            .max()
            .unwrap_or(0)
            + 1;
        let stored = RecognitionPolicy {
            version,
            ..policy.clone()
        };
        inner.policies.push(stored.clone());
        inner.active_policy = Some(version);
        Ok(stored)
    }

    async fn list_policies(&self) -> StorageResult<Vec<RecognitionPolicy>> {
        self.ensure_available()?;
        Ok(self.inner.read().await.policies.iter().rev().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometrics::embedding::test_vectors::with_first;
    use crate::ledger::AttemptContext;
    use anyhow::Result;

    fn face_record(identity: Uuid, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            id: Uuid::now_v7(),
            source: "10.0.0.1".to_string(),
            identity_id: Some(identity),
            stage: AttemptStage::Face,
            outcome,
            failure_reason: None,
            confidence_score: None,
            processing_time: None,
            user_agent: None,
            session_id: None,
            image_metadata: None,
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn identity_keys_are_unique() -> Result<()> {
        let store = MemoryStore::new();
        store.insert_identity(&Identity::new("alice", "12345678")).await?;

        let same_name = store.insert_identity(&Identity::new("alice", "87654321")).await;
        assert!(matches!(same_name, Err(StorageError::Conflict(_))));
        let same_dni = store.insert_identity(&Identity::new("bob", "12345678")).await;
        assert!(matches!(same_dni, Err(StorageError::Conflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn lookup_by_either_key() -> Result<()> {
        let store = MemoryStore::new();
        let identity = Identity::new("alice", "12345678");
        store.insert_identity(&identity).await?;

        let by_name = store.find_identity_by_key("alice").await?;
        let by_dni = store.find_identity_by_key("12345678").await?;
        assert_eq!(by_name.map(|found| found.id), Some(identity.id));
        assert_eq!(by_dni.map(|found| found.id), Some(identity.id));
        assert!(store.find_identity_by_key("nobody").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn registration_appends() -> Result<()> {
        let store = MemoryStore::new();
        let identity = Identity::new("alice", "12345678");
        store.insert_identity(&identity).await?;

        let registration = BiometricRegistration {
            embeddings: vec![with_first(0.1)],
            ..BiometricRegistration::default()
        };
        store.register_biometrics(identity.id, &registration).await?;
        let updated = store.register_biometrics(identity.id, &registration).await?;
        assert_eq!(updated.map(|found| found.templates.len()), Some(2));

        let missing = store.register_biometrics(Uuid::now_v7(), &registration).await?;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn consecutive_failures_stop_at_last_success() -> Result<()> {
        let store = MemoryStore::new();
        let identity = Uuid::now_v7();
        for outcome in [
            AttemptOutcome::Failed,
            AttemptOutcome::Success,
            AttemptOutcome::Failed,
            AttemptOutcome::Blocked,
            AttemptOutcome::Failed,
        ] {
            store.insert_attempt(&face_record(identity, outcome)).await?;
        }
        assert_eq!(store.consecutive_failures(identity).await?, 2);
        assert_eq!(store.consecutive_failures(Uuid::now_v7()).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_limited() -> Result<()> {
        let store = MemoryStore::new();
        let context = AttemptContext::new("10.0.0.1");
        let identity = Uuid::now_v7();
        for outcome in [AttemptOutcome::Failed, AttemptOutcome::Success] {
            store.insert_attempt(&face_record(identity, outcome)).await?;
        }
        let listed = store
            .list_attempts(&AttemptFilter {
                source: Some(context.source.clone()),
                limit: 1,
                ..AttemptFilter::default()
            })
            .await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].outcome, AttemptOutcome::Success);
        Ok(())
    }

    #[tokio::test]
    async fn only_one_policy_is_active() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.active_policy().await?.is_none());

        let first = store.activate_policy(&RecognitionPolicy::default()).await?;
        let second = store.activate_policy(&RecognitionPolicy::default()).await?;
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.active_policy().await?.map(|p| p.version), Some(2));
        assert_eq!(store.list_policies().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.find_identity_by_key("alice").await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
