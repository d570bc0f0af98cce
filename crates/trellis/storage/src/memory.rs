//! In-memory reference implementation for Trellis storage traits.
//!
//! Deterministic and test-friendly. The compare-and-set guarantees are
//! provided by performing every guarded mutation under the map's write lock;
//! production deployments should use a transactional backend.

use crate::model::{AuditAppend, AuditRecord, ProgressCreate};
use crate::traits::{AuditStore, ConsentStore, ProgressStore, QueryWindow};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use trellis_types::{
    ConsentRecord, ConsentVersion, ConsentVersionStatus, ModuleName, ParticipantId, Payload,
    ProgressRecord, ProgressStatus,
};
use uuid::Uuid;

/// In-memory Trellis storage adapter.
#[derive(Default)]
pub struct InMemoryTrellisStorage {
    progress: RwLock<HashMap<(ParticipantId, ModuleName), ProgressRecord>>,
    versions: RwLock<HashMap<String, ConsentVersion>>,
    consents: RwLock<HashMap<(ParticipantId, String), ConsentRecord>>,
    audits: RwLock<Vec<AuditRecord>>,
}

impl InMemoryTrellisStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryTrellisStorage {
    async fn create_progress_if_absent(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressCreate> {
        let mut guard = self
            .progress
            .write()
            .map_err(|_| StorageError::Backend("progress lock poisoned".to_string()))?;

        let key = (participant.clone(), module.clone());
        if let Some(existing) = guard.get(&key) {
            return Ok(ProgressCreate {
                record: existing.clone(),
                created: false,
            });
        }

        let record = ProgressRecord {
            participant_id: participant.clone(),
            module_name: module.clone(),
            status: ProgressStatus::InProgress,
            responses: Payload::new(),
            metadata: Payload::new(),
            started_at: Some(now),
            last_saved_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        guard.insert(key, record.clone());
        Ok(ProgressCreate {
            record,
            created: true,
        })
    }

    async fn save_responses(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord> {
        let mut guard = self
            .progress
            .write()
            .map_err(|_| StorageError::Backend("progress lock poisoned".to_string()))?;

        let key = (participant.clone(), module.clone());
        let record = guard.get_mut(&key).ok_or_else(|| {
            StorageError::NotFound(format!("progress for {} on {}", participant, module))
        })?;

        if record.status.is_completed() {
            return Err(StorageError::InvariantViolation(format!(
                "progress for {} on {} is completed and read-only",
                participant, module
            )));
        }

        for (k, v) in responses {
            record.responses.insert(k, v);
        }
        record.last_saved_at = Some(now);
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn complete_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        metadata: Payload,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord> {
        let mut guard = self
            .progress
            .write()
            .map_err(|_| StorageError::Backend("progress lock poisoned".to_string()))?;

        let key = (participant.clone(), module.clone());
        let record = guard.get_mut(&key).ok_or_else(|| {
            StorageError::NotFound(format!("progress for {} on {}", participant, module))
        })?;

        // The terminal guard lives here, inside the lock, not in callers.
        if record.status.is_completed() {
            return Err(StorageError::Conflict(format!(
                "progress for {} on {} already completed",
                participant, module
            )));
        }

        record.status = ProgressStatus::Completed;
        record.responses = responses;
        record.metadata = metadata;
        record.completed_at = Some(now);
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn get_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
    ) -> StorageResult<Option<ProgressRecord>> {
        let guard = self
            .progress
            .read()
            .map_err(|_| StorageError::Backend("progress lock poisoned".to_string()))?;
        Ok(guard.get(&(participant.clone(), module.clone())).cloned())
    }

    async fn list_progress(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> StorageResult<Vec<ProgressRecord>> {
        let guard = self
            .progress
            .read()
            .map_err(|_| StorageError::Backend("progress lock poisoned".to_string()))?;
        let mut values = guard
            .values()
            .filter(|record| record.participant_id == *participant)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl ConsentStore for InMemoryTrellisStorage {
    async fn insert_version(&self, version: ConsentVersion) -> StorageResult<()> {
        let mut guard = self
            .versions
            .write()
            .map_err(|_| StorageError::Backend("versions lock poisoned".to_string()))?;

        if guard.contains_key(&version.version) {
            return Err(StorageError::Conflict(format!(
                "consent version {} already exists",
                version.version
            )));
        }
        if version.status == ConsentVersionStatus::Active
            && guard
                .values()
                .any(|v| v.status == ConsentVersionStatus::Active)
        {
            return Err(StorageError::InvariantViolation(
                "another consent version is already active".to_string(),
            ));
        }
        guard.insert(version.version.clone(), version);
        Ok(())
    }

    async fn activate_version(
        &self,
        version: &str,
        _now: DateTime<Utc>,
    ) -> StorageResult<ConsentVersion> {
        let mut guard = self
            .versions
            .write()
            .map_err(|_| StorageError::Backend("versions lock poisoned".to_string()))?;

        if !guard.contains_key(version) {
            return Err(StorageError::NotFound(format!(
                "consent version {} not found",
                version
            )));
        }

        for v in guard.values_mut() {
            if v.status == ConsentVersionStatus::Active {
                v.status = ConsentVersionStatus::Retired;
            }
        }
        let record = guard
            .get_mut(version)
            .ok_or_else(|| StorageError::NotFound(format!("consent version {} not found", version)))?;
        record.status = ConsentVersionStatus::Active;
        Ok(record.clone())
    }

    async fn retire_version(&self, version: &str) -> StorageResult<()> {
        let mut guard = self
            .versions
            .write()
            .map_err(|_| StorageError::Backend("versions lock poisoned".to_string()))?;
        let record = guard
            .get_mut(version)
            .ok_or_else(|| StorageError::NotFound(format!("consent version {} not found", version)))?;
        record.status = ConsentVersionStatus::Retired;
        Ok(())
    }

    async fn active_version(&self) -> StorageResult<Option<ConsentVersion>> {
        let guard = self
            .versions
            .read()
            .map_err(|_| StorageError::Backend("versions lock poisoned".to_string()))?;
        Ok(guard
            .values()
            .find(|v| v.status == ConsentVersionStatus::Active)
            .cloned())
    }

    async fn get_version(&self, version: &str) -> StorageResult<Option<ConsentVersion>> {
        let guard = self
            .versions
            .read()
            .map_err(|_| StorageError::Backend("versions lock poisoned".to_string()))?;
        Ok(guard.get(version).cloned())
    }

    async fn insert_consent(&self, record: ConsentRecord) -> StorageResult<()> {
        let mut guard = self
            .consents
            .write()
            .map_err(|_| StorageError::Backend("consents lock poisoned".to_string()))?;

        let key = (record.participant_id.clone(), record.version.clone());
        if guard.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "consent for {} on version {} already recorded",
                record.participant_id, record.version
            )));
        }
        guard.insert(key, record);
        Ok(())
    }

    async fn get_consent(
        &self,
        participant: &ParticipantId,
        version: &str,
    ) -> StorageResult<Option<ConsentRecord>> {
        let guard = self
            .consents
            .read()
            .map_err(|_| StorageError::Backend("consents lock poisoned".to_string()))?;
        Ok(guard
            .get(&(participant.clone(), version.to_string()))
            .cloned())
    }

    async fn list_consents(
        &self,
        participant: &ParticipantId,
    ) -> StorageResult<Vec<ConsentRecord>> {
        let guard = self
            .consents
            .read()
            .map_err(|_| StorageError::Backend("consents lock poisoned".to_string()))?;
        let mut values = guard
            .values()
            .filter(|record| record.participant_id == *participant)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.accepted_at.cmp(&a.accepted_at));
        Ok(values)
    }
}

#[async_trait]
impl AuditStore for InMemoryTrellisStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut guard = self
            .audits
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;

        let previous_hash = guard.last().map(|e| e.hash.clone());
        let sequence = guard.len() as u64 + 1;
        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence)?;

        let record = AuditRecord {
            event_id: format!("audit-{}", Uuid::new_v4()),
            sequence,
            timestamp: event.timestamp,
            participant_id: event.participant_id,
            kind: event.kind,
            success: event.success,
            payload: event.payload,
            previous_hash,
            hash,
        };

        guard.push(record.clone());
        Ok(record)
    }

    async fn list_audit_for(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        let mut values = guard
            .iter()
            .filter(|record| record.participant_id == *participant)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }

    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        let mut values = guard.clone();
        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        let guard = self
            .audits
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(guard.last().map(|e| e.hash.clone()))
    }
}

pub(crate) fn compute_audit_hash(
    event: &AuditAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "timestamp": event.timestamp,
        "participant_id": event.participant_id.0,
        "kind": event.kind.as_str(),
        "success": event.success,
        "payload": event.payload,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

pub(crate) fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::AuditKind;

    fn participant() -> ParticipantId {
        ParticipantId::new("p-1")
    }

    fn module() -> ModuleName {
        ModuleName::new("module1")
    }

    fn payload(pairs: &[(&str, i64)]) -> Payload {
        let mut map = Payload::new();
        for (k, v) in pairs {
            map.insert((*k).to_string(), serde_json::json!(v));
        }
        map
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let storage = InMemoryTrellisStorage::new();
        let first = storage
            .create_progress_if_absent(&participant(), &module(), Utc::now())
            .await
            .unwrap();
        assert!(first.created);

        let second = storage
            .create_progress_if_absent(&participant(), &module(), Utc::now())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.record.created_at, first.record.created_at);
    }

    #[tokio::test]
    async fn save_merges_and_complete_freezes() {
        let storage = InMemoryTrellisStorage::new();
        storage
            .create_progress_if_absent(&participant(), &module(), Utc::now())
            .await
            .unwrap();

        storage
            .save_responses(&participant(), &module(), payload(&[("a", 1)]), Utc::now())
            .await
            .unwrap();
        let saved = storage
            .save_responses(&participant(), &module(), payload(&[("b", 2)]), Utc::now())
            .await
            .unwrap();
        assert_eq!(saved.responses.len(), 2);

        storage
            .complete_progress(
                &participant(),
                &module(),
                payload(&[("a", 1), ("b", 2), ("c", 3)]),
                Payload::new(),
                Utc::now(),
            )
            .await
            .unwrap();

        let result = storage
            .save_responses(&participant(), &module(), payload(&[("d", 4)]), Utc::now())
            .await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn complete_is_at_most_once() {
        let storage = InMemoryTrellisStorage::new();
        storage
            .create_progress_if_absent(&participant(), &module(), Utc::now())
            .await
            .unwrap();

        storage
            .complete_progress(
                &participant(),
                &module(),
                Payload::new(),
                Payload::new(),
                Utc::now(),
            )
            .await
            .unwrap();
        let second = storage
            .complete_progress(
                &participant(),
                &module(),
                Payload::new(),
                Payload::new(),
                Utc::now(),
            )
            .await;
        assert!(matches!(second, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn activate_retires_previous_active() {
        let storage = InMemoryTrellisStorage::new();
        storage
            .insert_version(ConsentVersion::draft("v1", Utc::now()))
            .await
            .unwrap();
        storage
            .insert_version(ConsentVersion::draft("v2", Utc::now()))
            .await
            .unwrap();

        storage.activate_version("v1", Utc::now()).await.unwrap();
        storage.activate_version("v2", Utc::now()).await.unwrap();

        let active = storage.active_version().await.unwrap().unwrap();
        assert_eq!(active.version, "v2");
        let v1 = storage.get_version("v1").await.unwrap().unwrap();
        assert_eq!(v1.status, ConsentVersionStatus::Retired);
    }

    #[tokio::test]
    async fn audit_chain_hashes_are_linked() {
        let storage = InMemoryTrellisStorage::new();
        let first = storage
            .append_audit(AuditAppend {
                timestamp: Utc::now(),
                participant_id: participant(),
                kind: AuditKind::ModuleStarted,
                success: true,
                payload: serde_json::json!({"module": "module1"}),
            })
            .await
            .unwrap();
        let second = storage
            .append_audit(AuditAppend {
                timestamp: Utc::now(),
                participant_id: participant(),
                kind: AuditKind::ModuleCompleted,
                success: true,
                payload: serde_json::json!({"module": "module1"}),
            })
            .await
            .unwrap();

        assert_eq!(second.previous_hash, Some(first.hash));
        assert_eq!(second.sequence, first.sequence + 1);
    }
}
