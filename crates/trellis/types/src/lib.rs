//! Trellis Types - the shared vocabulary of the progression engine
//!
//! Identifiers, statuses, and persisted record shapes used by every other
//! crate. Nothing here has behavior beyond construction and display; the
//! state machine lives in `trellis-progress` and the gating rules in
//! `trellis-access`.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);
impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleName(pub String);
impl ModuleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}
impl std::fmt::Display for ModuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathName(pub String);
impl PathName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}
impl std::fmt::Display for PathName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque key/value payload supplied by callers (responses) or the system
/// (metadata). Schema validation is an external concern; the engine only
/// bounds the serialized size.
pub type Payload = Map<String, Value>;

/// Upper bound on a serialized payload accepted at the core boundary.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Serialized size of a payload in bytes. Used for boundary checks only.
pub fn payload_size(payload: &Payload) -> usize {
    serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}
impl ProgressStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProgressStatus::Completed)
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }
}
impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-participant, per-module progress. The only mutable entity in the
/// system; mutated exclusively through the progress store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub participant_id: ParticipantId,
    pub module_name: ModuleName,
    pub status: ProgressStatus,
    pub responses: Payload,
    pub metadata: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_saved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentVersionStatus {
    Draft,
    Active,
    Retired,
}
impl ConsentVersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentVersionStatus::Draft => "draft",
            ConsentVersionStatus::Active => "active",
            ConsentVersionStatus::Retired => "retired",
        }
    }
}
impl std::fmt::Display for ConsentVersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned consent agreement. Exactly one version is Active at a time;
/// the consent store enforces that invariant on activation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsentVersion {
    pub version: String,
    pub status: ConsentVersionStatus,
    pub created_at: DateTime<Utc>,
}
impl ConsentVersion {
    pub fn draft(version: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            status: ConsentVersionStatus::Draft,
            created_at,
        }
    }
}

/// Immutable acceptance of one consent version by one participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub participant_id: ParticipantId,
    pub version: String,
    pub content: Value,
    pub accepted_at: DateTime<Utc>,
}

/// Current consent position of a participant against the active version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsentStanding {
    pub active_version: String,
    pub consented: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Audit event classification. Serialized with the wire names the HTTP
/// boundary exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AccessGranted,
    AccessDenied,
    ModuleStarted,
    ProgressSaved,
    ModuleCompleted,
    ConsentRecorded,
    PathAccessGranted,
    PathAccessDenied,
    PathWriteDenied,
}
impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::AccessGranted => "access_granted",
            AuditKind::AccessDenied => "access_denied",
            AuditKind::ModuleStarted => "module_started",
            AuditKind::ProgressSaved => "progress_saved",
            AuditKind::ModuleCompleted => "module_completed",
            AuditKind::ConsentRecorded => "consent_recorded",
            AuditKind::PathAccessGranted => "path_access_granted",
            AuditKind::PathAccessDenied => "path_access_denied",
            AuditKind::PathWriteDenied => "path_write_denied",
        }
    }
}
impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an access check denied. Wire names match the boundary contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ConsentRequired,
    PriorModulesIncomplete,
    BranchingRuleNotSatisfied,
    PathReadOnly,
}
impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::ConsentRequired => "consent_required",
            DenialReason::PriorModulesIncomplete => "prior_modules_incomplete",
            DenialReason::BranchingRuleNotSatisfied => "branching_rule_not_satisfied",
            DenialReason::PathReadOnly => "path_read_only",
        }
    }
}
impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a module access check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessDecision {
    pub accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_module: Option<ModuleName>,
}
impl AccessDecision {
    pub fn granted() -> Self {
        Self {
            accessible: true,
            reason: None,
            next_module: None,
        }
    }
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            accessible: false,
            reason: Some(reason),
            next_module: None,
        }
    }
    pub fn denied_with_next(reason: DenialReason, next_module: ModuleName) -> Self {
        Self {
            accessible: false,
            reason: Some(reason),
            next_module: Some(next_module),
        }
    }
}

/// Outcome of a path access check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathDecision {
    pub accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
}
impl PathDecision {
    pub fn granted() -> Self {
        Self {
            accessible: true,
            reason: None,
        }
    }
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            accessible: false,
            reason: Some(reason),
        }
    }
}
