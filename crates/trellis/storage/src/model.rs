use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_types::{AuditKind, ParticipantId, ProgressRecord};

/// Audit append payload. Sequence, hash, and event id are assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub timestamp: DateTime<Utc>,
    pub participant_id: ParticipantId,
    pub kind: AuditKind,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
}

/// Persistent tamper-evident audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub participant_id: ParticipantId,
    pub kind: AuditKind,
    pub success: bool,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// Result of a create-if-absent progress insert. `created` distinguishes a
/// fresh record from an idempotent hit on an existing one.
#[derive(Debug, Clone)]
pub struct ProgressCreate {
    pub record: ProgressRecord,
    pub created: bool,
}
