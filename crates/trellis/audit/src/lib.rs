//! Trellis Audit - the append-only trail.
//!
//! `AuditTrail::record` is fire-and-forget: a failed append is reported
//! through `tracing::warn!` and swallowed, so a logging outage never rolls
//! back or blocks the business transition it documents. Reads and chain
//! verification return real errors.

#![deny(unsafe_code)]

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use trellis_storage::{AuditAppend, AuditRecord, QueryWindow, StorageError, TrellisStorage};
use trellis_types::{AuditKind, ParticipantId};

/// Best-effort audit facade over the storage bundle.
#[derive(Clone)]
pub struct AuditTrail {
    storage: Arc<dyn TrellisStorage>,
}

impl AuditTrail {
    pub fn new(storage: Arc<dyn TrellisStorage>) -> Self {
        Self { storage }
    }

    /// Append one event. Never fails the caller; append errors are logged.
    pub async fn record(
        &self,
        participant: &ParticipantId,
        kind: AuditKind,
        success: bool,
        payload: Value,
    ) {
        let event = AuditAppend {
            timestamp: Utc::now(),
            participant_id: participant.clone(),
            kind,
            success,
            payload,
        };
        match self.storage.append_audit(event).await {
            Ok(record) => {
                tracing::debug!(
                    participant = %participant,
                    kind = %kind,
                    sequence = record.sequence,
                    "audit event appended"
                );
            }
            Err(err) => {
                tracing::warn!(
                    participant = %participant,
                    kind = %kind,
                    error = %err,
                    "audit append failed; business outcome unaffected"
                );
            }
        }
    }

    /// One participant's events, newest-first.
    pub async fn history(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.storage.list_audit_for(participant, window).await?)
    }

    /// Walk the full chain oldest-first, checking hash links and dense
    /// sequence numbers. Returns the chain length.
    pub async fn verify_chain(&self) -> Result<u64, AuditError> {
        let mut records = self.storage.list_audit(QueryWindow::default()).await?;
        records.sort_by_key(|record| record.sequence);

        let mut previous_hash: Option<String> = None;
        for (index, record) in records.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            if record.sequence != expected_sequence {
                return Err(AuditError::ChainBroken {
                    sequence: record.sequence,
                    detail: format!("expected sequence {expected_sequence}"),
                });
            }
            if record.previous_hash != previous_hash {
                return Err(AuditError::ChainBroken {
                    sequence: record.sequence,
                    detail: "previous hash does not match prior record".to_string(),
                });
            }
            previous_hash = Some(record.hash.clone());
        }
        Ok(records.len() as u64)
    }
}

/// Audit read/verification errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit chain broken at sequence {sequence}: {detail}")]
    ChainBroken { sequence: u64, detail: String },

    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    #[error("audit backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for AuditError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Unavailable(msg) => Self::Unavailable(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_storage::memory::InMemoryTrellisStorage;

    #[tokio::test]
    async fn records_and_verifies_chain() {
        let storage = Arc::new(InMemoryTrellisStorage::new());
        let trail = AuditTrail::new(storage);
        let participant = ParticipantId::new("p-1");

        trail
            .record(
                &participant,
                AuditKind::ModuleStarted,
                true,
                serde_json::json!({"module": "module1"}),
            )
            .await;
        trail
            .record(
                &participant,
                AuditKind::ModuleCompleted,
                true,
                serde_json::json!({"module": "module1"}),
            )
            .await;

        let length = trail.verify_chain().await.unwrap();
        assert_eq!(length, 2);

        let history = trail
            .history(&participant, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, AuditKind::ModuleCompleted);
    }

    #[tokio::test]
    async fn history_is_scoped_to_participant() {
        let storage = Arc::new(InMemoryTrellisStorage::new());
        let trail = AuditTrail::new(storage);

        trail
            .record(
                &ParticipantId::new("p-1"),
                AuditKind::AccessGranted,
                true,
                Value::Null,
            )
            .await;
        trail
            .record(
                &ParticipantId::new("p-2"),
                AuditKind::AccessDenied,
                false,
                Value::Null,
            )
            .await;

        let history = trail
            .history(&ParticipantId::new("p-1"), QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, AuditKind::AccessGranted);
    }
}
