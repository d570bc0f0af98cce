use crate::model::{AuditAppend, AuditRecord, ProgressCreate};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use trellis_types::{
    ConsentRecord, ConsentVersion, ModuleName, ParticipantId, Payload, ProgressRecord,
};

/// Generic query window for paged reads. A limit of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Storage interface for per-participant module progress.
///
/// The `(participant, module)` pair is the unit of serialization. Every
/// guarded mutation evaluates its precondition inside the store's own
/// atomicity boundary, never as a separate application-level check.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert an in-progress record if none exists; otherwise return the
    /// existing record unchanged.
    async fn create_progress_if_absent(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressCreate>;

    /// Merge `responses` into an existing non-completed record and stamp
    /// `last_saved_at`. Fails `NotFound` when absent and
    /// `InvariantViolation` when the record is already completed.
    async fn save_responses(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord>;

    /// Compare-and-set completion: atomically transition to completed only
    /// if the record is not completed yet, writing the final responses and
    /// metadata. Exactly one concurrent caller wins; losers get `Conflict`.
    async fn complete_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        metadata: Payload,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord>;

    /// Get one progress record.
    async fn get_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
    ) -> StorageResult<Option<ProgressRecord>>;

    /// List a participant's records newest-first.
    async fn list_progress(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> StorageResult<Vec<ProgressRecord>>;
}

/// Storage interface for consent versions and immutable consent records.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Register a new version. Fails `Conflict` on a duplicate version key.
    async fn insert_version(&self, version: ConsentVersion) -> StorageResult<()>;

    /// Make `version` the single active version, retiring whichever version
    /// was active before, as one atomic step.
    async fn activate_version(
        &self,
        version: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ConsentVersion>;

    /// Retire a version without activating a successor.
    async fn retire_version(&self, version: &str) -> StorageResult<()>;

    /// The currently active version, if any.
    async fn active_version(&self) -> StorageResult<Option<ConsentVersion>>;

    /// Get one version by key.
    async fn get_version(&self, version: &str) -> StorageResult<Option<ConsentVersion>>;

    /// Insert an immutable consent record. Fails `Conflict` when the
    /// `(participant, version)` pair already exists.
    async fn insert_consent(&self, record: ConsentRecord) -> StorageResult<()>;

    /// Get one consent record by pair.
    async fn get_consent(
        &self,
        participant: &ParticipantId,
        version: &str,
    ) -> StorageResult<Option<ConsentRecord>>;

    /// All consent records held by a participant, newest-first.
    async fn list_consents(&self, participant: &ParticipantId)
        -> StorageResult<Vec<ConsentRecord>>;
}

/// Storage interface for append-only audit events.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an event and return the canonical, hash-linked stored record.
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord>;

    /// Read one participant's events newest-first.
    async fn list_audit_for(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditRecord>>;

    /// Read all events newest-first.
    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>>;

    /// Get the latest audit hash anchor.
    async fn latest_audit_hash(&self) -> StorageResult<Option<String>>;
}

/// Unified storage bundle consumed by the engine surfaces.
pub trait TrellisStorage: ProgressStore + ConsentStore + AuditStore + Send + Sync {}

impl<T> TrellisStorage for T where T: ProgressStore + ConsentStore + AuditStore + Send + Sync {}
