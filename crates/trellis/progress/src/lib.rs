//! Trellis Progress - the per-participant module state machine.
//!
//! Legal transitions per `(participant, module)`:
//!
//! ```text
//! NotStarted --start--> InProgress --complete--> Completed
//! InProgress --save--> InProgress
//! ```
//!
//! Status never regresses and completion happens at most once. The terminal
//! guard is a compare-and-set inside the progress store, so two concurrent
//! `complete` calls resolve with exactly one winner; the loser observes
//! `AlreadyCompleted` and causes no side effects. Every accepted mutation
//! appends one audit event; a failed append is logged and never rolls back
//! the committed transition.

#![deny(unsafe_code)]

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use trellis_audit::AuditTrail;
use trellis_storage::{QueryWindow, StorageError, TrellisStorage};
use trellis_types::{
    payload_size, AuditKind, ModuleName, ParticipantId, Payload, ProgressRecord,
    MAX_PAYLOAD_BYTES,
};

/// State machine over progress records. Cheap to clone; all state lives in
/// the storage bundle.
#[derive(Clone)]
pub struct ProgressStateMachine {
    storage: Arc<dyn TrellisStorage>,
    audit: AuditTrail,
}

impl ProgressStateMachine {
    pub fn new(storage: Arc<dyn TrellisStorage>, audit: AuditTrail) -> Self {
        Self { storage, audit }
    }

    /// Start a module. Creates the record in `InProgress` if absent; an
    /// already-running module is returned unchanged (idempotent). Fails
    /// `AlreadyCompleted` once the module is terminal.
    pub async fn start(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
    ) -> Result<ProgressRecord, ProgressError> {
        let outcome = self
            .storage
            .create_progress_if_absent(participant, module, Utc::now())
            .await?;

        if outcome.record.status.is_completed() {
            return Err(ProgressError::AlreadyCompleted {
                participant: participant.clone(),
                module: module.clone(),
            });
        }

        if outcome.created {
            tracing::info!(participant = %participant, module = %module, "module started");
            self.audit
                .record(
                    participant,
                    AuditKind::ModuleStarted,
                    true,
                    serde_json::json!({"module": module.0}),
                )
                .await;
        }

        Ok(outcome.record)
    }

    /// Merge partial responses into a running module, starting it first if
    /// needed. Fails `ReadOnly` once the module is completed.
    pub async fn save_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
    ) -> Result<ProgressRecord, ProgressError> {
        check_payload(&responses)?;

        let outcome = self
            .storage
            .create_progress_if_absent(participant, module, Utc::now())
            .await?;
        if outcome.record.status.is_completed() {
            return Err(ProgressError::ReadOnly {
                participant: participant.clone(),
                module: module.clone(),
            });
        }
        if outcome.created {
            self.audit
                .record(
                    participant,
                    AuditKind::ModuleStarted,
                    true,
                    serde_json::json!({"module": module.0}),
                )
                .await;
        }

        // The completed guard is re-evaluated inside the store; the check
        // above is only a fast path.
        let record = self
            .storage
            .save_responses(participant, module, responses, Utc::now())
            .await
            .map_err(|err| {
                Self::terminal_error(
                    participant,
                    module,
                    err,
                    ProgressError::ReadOnly {
                        participant: participant.clone(),
                        module: module.clone(),
                    },
                )
            })?;

        self.audit
            .record(
                participant,
                AuditKind::ProgressSaved,
                true,
                serde_json::json!({"module": module.0}),
            )
            .await;

        Ok(record)
    }

    /// Complete a module: the at-most-once transition. Auto-starts an
    /// absent record, then performs the conditional update. Exactly one of
    /// N concurrent callers commits; the rest fail `AlreadyCompleted`
    /// without duplicate records or duplicate audit events.
    pub async fn complete(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        metadata: Payload,
    ) -> Result<ProgressRecord, ProgressError> {
        check_payload(&responses)?;
        check_payload(&metadata)?;

        let outcome = self
            .storage
            .create_progress_if_absent(participant, module, Utc::now())
            .await?;
        if outcome.record.status.is_completed() {
            return Err(ProgressError::AlreadyCompleted {
                participant: participant.clone(),
                module: module.clone(),
            });
        }
        if outcome.created {
            self.audit
                .record(
                    participant,
                    AuditKind::ModuleStarted,
                    true,
                    serde_json::json!({"module": module.0}),
                )
                .await;
        }

        let record = self
            .storage
            .complete_progress(participant, module, responses, metadata, Utc::now())
            .await
            .map_err(|err| {
                Self::terminal_error(
                    participant,
                    module,
                    err,
                    ProgressError::AlreadyCompleted {
                        participant: participant.clone(),
                        module: module.clone(),
                    },
                )
            })?;

        tracing::info!(participant = %participant, module = %module, "module completed");
        self.audit
            .record(
                participant,
                AuditKind::ModuleCompleted,
                true,
                serde_json::json!({"module": module.0}),
            )
            .await;

        Ok(record)
    }

    /// Current snapshot of one record. Never mutates.
    pub async fn get_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
    ) -> Result<ProgressRecord, ProgressError> {
        self.storage
            .get_progress(participant, module)
            .await?
            .ok_or_else(|| ProgressError::NotFound {
                participant: participant.clone(),
                module: module.clone(),
            })
    }

    /// All records for a participant, newest-first.
    pub async fn list_progress(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> Result<Vec<ProgressRecord>, ProgressError> {
        Ok(self.storage.list_progress(participant, window).await?)
    }

    /// Map a storage error from a guarded mutation onto the operation's
    /// terminal error, keeping the pair context.
    fn terminal_error(
        participant: &ParticipantId,
        module: &ModuleName,
        err: StorageError,
        terminal: ProgressError,
    ) -> ProgressError {
        match err {
            StorageError::Conflict(_) | StorageError::InvariantViolation(_) => terminal,
            StorageError::NotFound(_) => ProgressError::NotFound {
                participant: participant.clone(),
                module: module.clone(),
            },
            other => other.into(),
        }
    }
}

fn check_payload(payload: &Payload) -> Result<(), ProgressError> {
    let bytes = payload_size(payload);
    if bytes > MAX_PAYLOAD_BYTES {
        return Err(ProgressError::PayloadTooLarge {
            bytes,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// Progress state-machine errors.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("no progress for {participant} on {module}")]
    NotFound {
        participant: ParticipantId,
        module: ModuleName,
    },

    #[error("module {module} already completed for {participant}")]
    AlreadyCompleted {
        participant: ParticipantId,
        module: ModuleName,
    },

    #[error("module {module} is read-only for {participant}")]
    ReadOnly {
        participant: ParticipantId,
        module: ModuleName,
    },

    #[error("payload of {bytes} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { bytes: usize, limit: usize },

    #[error("progress store unavailable: {0}")]
    Unavailable(String),

    #[error("progress backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for ProgressError {
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
    use proptest::prelude::*;
    use trellis_storage::memory::InMemoryTrellisStorage;
    use trellis_storage::AuditStore;
    use trellis_types::ProgressStatus;

    fn machine() -> (ProgressStateMachine, Arc<InMemoryTrellisStorage>) {
        let storage = Arc::new(InMemoryTrellisStorage::new());
        let trail = AuditTrail::new(storage.clone());
        (ProgressStateMachine::new(storage.clone(), trail), storage)
    }

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
    async fn start_is_idempotent_until_completed() {
        let (machine, _) = machine();
        let first = machine.start(&participant(), &module()).await.unwrap();
        assert_eq!(first.status, ProgressStatus::InProgress);

        let second = machine.start(&participant(), &module()).await.unwrap();
        assert_eq!(second.started_at, first.started_at);

        machine
            .complete(&participant(), &module(), Payload::new(), Payload::new())
            .await
            .unwrap();
        let third = machine.start(&participant(), &module()).await;
        assert!(matches!(
            third,
            Err(ProgressError::AlreadyCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn round_trip_merges_and_freezes() {
        let (machine, storage) = machine();

        machine.start(&participant(), &module()).await.unwrap();
        machine
            .save_progress(&participant(), &module(), payload(&[("a", 1)]))
            .await
            .unwrap();
        machine
            .save_progress(&participant(), &module(), payload(&[("a", 1), ("b", 2)]))
            .await
            .unwrap();
        let completed = machine
            .complete(
                &participant(),
                &module(),
                payload(&[("a", 1), ("b", 2), ("c", 3)]),
                Payload::new(),
            )
            .await
            .unwrap();

        assert_eq!(completed.status, ProgressStatus::Completed);
        assert_eq!(completed.responses.len(), 3);

        // Frozen payload remains readable after completion.
        let frozen = machine.get_progress(&participant(), &module()).await.unwrap();
        assert_eq!(frozen.responses.len(), 3);
        assert!(frozen.completed_at.is_some());

        let save = machine
            .save_progress(&participant(), &module(), payload(&[("d", 4)]))
            .await;
        assert!(matches!(save, Err(ProgressError::ReadOnly { .. })));

        // One event per accepted mutation: start, save, save, complete.
        let events = storage
            .list_audit_for(&participant(), QueryWindow::default())
            .await
            .unwrap();
        let kinds: Vec<AuditKind> = events.iter().rev().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AuditKind::ModuleStarted,
                AuditKind::ProgressSaved,
                AuditKind::ProgressSaved,
                AuditKind::ModuleCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn save_implicitly_starts() {
        let (machine, _) = machine();
        let record = machine
            .save_progress(&participant(), &module(), payload(&[("a", 1)]))
            .await
            .unwrap();
        assert_eq!(record.status, ProgressStatus::InProgress);
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_completion_has_one_winner() {
        let (machine, storage) = machine();
        machine.start(&participant(), &module()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let machine = machine.clone();
            handles.push(tokio::spawn(async move {
                machine
                    .complete(
                        &ParticipantId::new("p-1"),
                        &ModuleName::new("module1"),
                        Payload::new(),
                        Payload::new(),
                    )
                    .await
            }));
        }

        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(ProgressError::AlreadyCompleted { .. }) => losses += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(losses, 7);

        // Exactly one completion event regardless of the race outcome.
        let events = storage
            .list_audit_for(&participant(), QueryWindow::default())
            .await
            .unwrap();
        let completions = events
            .iter()
            .filter(|e| e.kind == AuditKind::ModuleCompleted)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_at_the_boundary() {
        let (machine, _) = machine();
        let mut huge = Payload::new();
        huge.insert(
            "blob".to_string(),
            serde_json::json!("x".repeat(MAX_PAYLOAD_BYTES + 1)),
        );
        let result = machine
            .save_progress(&participant(), &module(), huge)
            .await;
        assert!(matches!(
            result,
            Err(ProgressError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn get_progress_of_absent_record_is_not_found() {
        let (machine, _) = machine();
        let result = machine.get_progress(&participant(), &module()).await;
        assert!(matches!(result, Err(ProgressError::NotFound { .. })));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Save,
        Complete,
    }

    fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![Just(Op::Start), Just(Op::Save), Just(Op::Complete)],
            1..16,
        )
    }

    proptest! {
        #[test]
        fn property_status_never_regresses(ops in op_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let (machine, _) = machine();
                let mut completed = false;
                let mut completions_accepted = 0;

                for op in ops {
                    let result = match op {
                        Op::Start => machine.start(&participant(), &module()).await.map(|_| ()),
                        Op::Save => machine
                            .save_progress(&participant(), &module(), payload(&[("k", 1)]))
                            .await
                            .map(|_| ()),
                        Op::Complete => {
                            let outcome = machine
                                .complete(&participant(), &module(), Payload::new(), Payload::new())
                                .await;
                            if outcome.is_ok() {
                                completions_accepted += 1;
                            }
                            outcome.map(|_| ())
                        }
                    };

                    if completed {
                        // Nothing is accepted after the terminal state.
                        assert!(result.is_err());
                    }
                    if matches!(op, Op::Complete) && result.is_ok() {
                        completed = true;
                    }
                }

                assert!(completions_accepted <= 1);

                if let Ok(record) = machine.get_progress(&participant(), &module()).await {
                    if completed {
                        assert_eq!(record.status, ProgressStatus::Completed);
                    } else {
                        assert_eq!(record.status, ProgressStatus::InProgress);
                    }
                }
            });
        }
    }
}
