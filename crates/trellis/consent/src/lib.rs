//! Trellis Consent - the consent gate.
//!
//! Consent validity is version-pinned, not time-pinned: a participant who
//! accepted a now-retired version fails the gate until they accept the
//! currently active one. Acceptance is recorded at most once per
//! `(participant, version)` pair; a duplicate submission is a terminal
//! rejection, never a silent success.

#![deny(unsafe_code)]

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use trellis_audit::AuditTrail;
use trellis_storage::{StorageError, TrellisStorage};
use trellis_types::{
    AuditKind, ConsentRecord, ConsentStanding, ConsentVersionStatus, ParticipantId,
};

/// Gate deciding consent standing against the active consent version.
#[derive(Clone)]
pub struct ConsentGate {
    storage: Arc<dyn TrellisStorage>,
    audit: AuditTrail,
}

impl ConsentGate {
    pub fn new(storage: Arc<dyn TrellisStorage>, audit: AuditTrail) -> Self {
        Self { storage, audit }
    }

    /// Whether the participant holds a consent record against the currently
    /// active version. A missing active version is a configuration error,
    /// not a user error.
    pub async fn has_valid_consent(
        &self,
        participant: &ParticipantId,
    ) -> Result<bool, ConsentError> {
        let active = self
            .storage
            .active_version()
            .await?
            .ok_or(ConsentError::NoActiveVersion)?;
        let record = self.storage.get_consent(participant, &active.version).await?;
        Ok(record.is_some())
    }

    /// Record acceptance of `version`. Fails `VersionNotActive` when the
    /// named version exists but is not active, and `AlreadyConsented` when
    /// the pair already holds a record.
    pub async fn record_consent(
        &self,
        participant: &ParticipantId,
        version: &str,
        content: Value,
    ) -> Result<ConsentRecord, ConsentError> {
        let known = self
            .storage
            .get_version(version)
            .await?
            .ok_or_else(|| ConsentError::VersionNotFound(version.to_string()))?;
        if known.status != ConsentVersionStatus::Active {
            return Err(ConsentError::VersionNotActive(version.to_string()));
        }

        let record = ConsentRecord {
            participant_id: participant.clone(),
            version: version.to_string(),
            content,
            accepted_at: Utc::now(),
        };

        match self.storage.insert_consent(record.clone()).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => {
                return Err(ConsentError::AlreadyConsented {
                    participant: participant.clone(),
                    version: version.to_string(),
                });
            }
            Err(other) => return Err(other.into()),
        }

        tracing::info!(participant = %participant, version, "consent recorded");
        self.audit
            .record(
                participant,
                AuditKind::ConsentRecorded,
                true,
                serde_json::json!({"version": version}),
            )
            .await;

        Ok(record)
    }

    /// The participant's position against the active version, for operator
    /// surfaces.
    pub async fn consent_standing(
        &self,
        participant: &ParticipantId,
    ) -> Result<ConsentStanding, ConsentError> {
        let active = self
            .storage
            .active_version()
            .await?
            .ok_or(ConsentError::NoActiveVersion)?;
        let record = self.storage.get_consent(participant, &active.version).await?;
        Ok(ConsentStanding {
            active_version: active.version,
            consented: record.is_some(),
            accepted_at: record.map(|r| r.accepted_at),
        })
    }
}

/// Consent-gate errors.
#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("no active consent version is configured")]
    NoActiveVersion,

    #[error("consent version not found: {0}")]
    VersionNotFound(String),

    #[error("consent version {0} is not active")]
    VersionNotActive(String),

    #[error("participant {participant} already consented to version {version}")]
    AlreadyConsented {
        participant: ParticipantId,
        version: String,
    },

    #[error("consent store unavailable: {0}")]
    Unavailable(String),

    #[error("consent backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for ConsentError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::VersionNotFound(msg),
            StorageError::Unavailable(msg) => Self::Unavailable(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}
