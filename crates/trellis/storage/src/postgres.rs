//! PostgreSQL adapter for Trellis storage.
//!
//! This adapter is designed as the transactional source-of-truth backend.
//! The completion compare-and-set is a conditional UPDATE keyed on the
//! pre-transition status, so concurrent completions for the same
//! `(participant, module)` pair resolve in the database, not in application
//! logic.

use crate::model::{AuditAppend, AuditRecord, ProgressCreate};
use crate::traits::{AuditStore, ConsentStore, ProgressStore, QueryWindow};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, Row};
use trellis_types::{
    ConsentRecord, ConsentVersion, ConsentVersionStatus, ModuleName, ParticipantId, Payload,
    ProgressRecord, ProgressStatus,
};
use uuid::Uuid;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresTrellisStorage {
    pool: PgPool,
}

impl PostgresTrellisStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS trellis_progress (
                participant_id TEXT NOT NULL,
                module_name TEXT NOT NULL,
                status TEXT NOT NULL,
                responses JSONB NOT NULL,
                metadata JSONB NOT NULL,
                started_at TIMESTAMPTZ,
                last_saved_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (participant_id, module_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trellis_consent_versions (
                version TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trellis_consent_records (
                participant_id TEXT NOT NULL,
                version TEXT NOT NULL,
                content JSONB NOT NULL,
                accepted_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (participant_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trellis_audit_events (
                event_id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                timestamp TIMESTAMPTZ NOT NULL,
                participant_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT,
                hash TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS trellis_audit_events_participant_idx
                ON trellis_audit_events (participant_id, sequence DESC)
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PostgresTrellisStorage {
    async fn create_progress_if_absent(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressCreate> {
        let result = sqlx::query(
            r#"
            INSERT INTO trellis_progress
                (participant_id, module_name, status, responses, metadata, started_at, created_at, updated_at)
            VALUES ($1, $2, $3, '{}'::jsonb, '{}'::jsonb, $4, $4, $4)
            ON CONFLICT (participant_id, module_name) DO NOTHING
            "#,
        )
        .bind(participant.0.clone())
        .bind(module.0.clone())
        .bind(ProgressStatus::InProgress.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let record = self.get_progress(participant, module).await?.ok_or_else(|| {
            StorageError::Backend(format!(
                "progress for {} on {} vanished after insert",
                participant, module
            ))
        })?;

        Ok(ProgressCreate {
            record,
            created: result.rows_affected() == 1,
        })
    }

    async fn save_responses(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord> {
        let patch = serde_json::to_value(&responses)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        // jsonb || is a shallow key merge, matching the in-memory adapter.
        let result = sqlx::query(
            r#"
            UPDATE trellis_progress
               SET responses = responses || $1::jsonb,
                   last_saved_at = $2,
                   updated_at = $2
             WHERE participant_id = $3
               AND module_name = $4
               AND status <> $5
            "#,
        )
        .bind(patch)
        .bind(now)
        .bind(participant.0.clone())
        .bind(module.0.clone())
        .bind(ProgressStatus::Completed.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_progress(participant, module).await?.is_some();
            if exists {
                return Err(StorageError::InvariantViolation(format!(
                    "progress for {} on {} is completed and read-only",
                    participant, module
                )));
            }
            return Err(StorageError::NotFound(format!(
                "progress for {} on {}",
                participant, module
            )));
        }

        self.get_progress(participant, module).await?.ok_or_else(|| {
            StorageError::Backend(format!(
                "progress for {} on {} vanished after update",
                participant, module
            ))
        })
    }

    async fn complete_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
        responses: Payload,
        metadata: Payload,
        now: DateTime<Utc>,
    ) -> StorageResult<ProgressRecord> {
        let responses_json = serde_json::to_value(&responses)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let metadata_json = serde_json::to_value(&metadata)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE trellis_progress
               SET status = $1,
                   responses = $2,
                   metadata = $3,
                   completed_at = $4,
                   updated_at = $4
             WHERE participant_id = $5
               AND module_name = $6
               AND status <> $1
            "#,
        )
        .bind(ProgressStatus::Completed.as_str())
        .bind(responses_json)
        .bind(metadata_json)
        .bind(now)
        .bind(participant.0.clone())
        .bind(module.0.clone())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_progress(participant, module).await?.is_some();
            if exists {
                return Err(StorageError::Conflict(format!(
                    "progress for {} on {} already completed",
                    participant, module
                )));
            }
            return Err(StorageError::NotFound(format!(
                "progress for {} on {}",
                participant, module
            )));
        }

        self.get_progress(participant, module).await?.ok_or_else(|| {
            StorageError::Backend(format!(
                "progress for {} on {} vanished after completion",
                participant, module
            ))
        })
    }

    async fn get_progress(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
    ) -> StorageResult<Option<ProgressRecord>> {
        let row = sqlx::query(
            r#"
            SELECT participant_id, module_name, status, responses, metadata,
                   started_at, last_saved_at, completed_at, created_at, updated_at
              FROM trellis_progress
             WHERE participant_id = $1 AND module_name = $2
            "#,
        )
        .bind(participant.0.clone())
        .bind(module.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(progress_row_to_record).transpose()
    }

    async fn list_progress(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> StorageResult<Vec<ProgressRecord>> {
        let rows = if window.limit == 0 {
            sqlx::query(
                r#"
                SELECT participant_id, module_name, status, responses, metadata,
                       started_at, last_saved_at, completed_at, created_at, updated_at
                  FROM trellis_progress
                 WHERE participant_id = $1
                 ORDER BY updated_at DESC
                 OFFSET $2
                "#,
            )
            .bind(participant.0.clone())
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(
                r#"
                SELECT participant_id, module_name, status, responses, metadata,
                       started_at, last_saved_at, completed_at, created_at, updated_at
                  FROM trellis_progress
                 WHERE participant_id = $1
                 ORDER BY updated_at DESC
                 LIMIT $2 OFFSET $3
                "#,
            )
            .bind(participant.0.clone())
            .bind(to_i64(window.limit)?)
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(progress_row_to_record).collect()
    }
}

#[async_trait]
impl ConsentStore for PostgresTrellisStorage {
    async fn insert_version(&self, version: ConsentVersion) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trellis_consent_versions (version, status, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(version.version.clone())
        .bind(version.status.as_str())
        .bind(version.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn activate_version(
        &self,
        version: &str,
        _now: DateTime<Utc>,
    ) -> StorageResult<ConsentVersion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query("UPDATE trellis_consent_versions SET status = $1 WHERE status = $2")
            .bind(ConsentVersionStatus::Retired.as_str())
            .bind(ConsentVersionStatus::Active.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let result = sqlx::query("UPDATE trellis_consent_versions SET status = $1 WHERE version = $2")
            .bind(ConsentVersionStatus::Active.as_str())
            .bind(version)
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "consent version {} not found",
                version
            )));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        self.get_version(version).await?.ok_or_else(|| {
            StorageError::Backend(format!("consent version {} vanished after activation", version))
        })
    }

    async fn retire_version(&self, version: &str) -> StorageResult<()> {
        let result = sqlx::query("UPDATE trellis_consent_versions SET status = $1 WHERE version = $2")
            .bind(ConsentVersionStatus::Retired.as_str())
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "consent version {} not found",
                version
            )));
        }
        Ok(())
    }

    async fn active_version(&self) -> StorageResult<Option<ConsentVersion>> {
        let row = sqlx::query(
            "SELECT version, status, created_at FROM trellis_consent_versions WHERE status = $1",
        )
        .bind(ConsentVersionStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(version_row_to_record).transpose()
    }

    async fn get_version(&self, version: &str) -> StorageResult<Option<ConsentVersion>> {
        let row = sqlx::query(
            "SELECT version, status, created_at FROM trellis_consent_versions WHERE version = $1",
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(version_row_to_record).transpose()
    }

    async fn insert_consent(&self, record: ConsentRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trellis_consent_records (participant_id, version, content, accepted_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.participant_id.0.clone())
        .bind(record.version.clone())
        .bind(record.content.clone())
        .bind(record.accepted_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_consent(
        &self,
        participant: &ParticipantId,
        version: &str,
    ) -> StorageResult<Option<ConsentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT participant_id, version, content, accepted_at
              FROM trellis_consent_records
             WHERE participant_id = $1 AND version = $2
            "#,
        )
        .bind(participant.0.clone())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(consent_row_to_record).transpose()
    }

    async fn list_consents(
        &self,
        participant: &ParticipantId,
    ) -> StorageResult<Vec<ConsentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, version, content, accepted_at
              FROM trellis_consent_records
             WHERE participant_id = $1
             ORDER BY accepted_at DESC
            "#,
        )
        .bind(participant.0.clone())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(consent_row_to_record).collect()
    }
}

#[async_trait]
impl AuditStore for PostgresTrellisStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query("LOCK TABLE trellis_audit_events IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let last = sqlx::query(
            "SELECT sequence, hash FROM trellis_audit_events ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, previous_hash) = if let Some(row) = last {
            let seq: i64 = row
                .try_get("sequence")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let prev: String = row
                .try_get("hash")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            (seq + 1, Some(prev))
        } else {
            (1_i64, None)
        };

        let hash =
            crate::memory::compute_audit_hash(&event, previous_hash.as_deref(), sequence as u64)?;
        let event_id = format!("audit-{}", Uuid::new_v4());

        sqlx::query(
            r#"
            INSERT INTO trellis_audit_events
                (event_id, sequence, timestamp, participant_id, kind, success, payload, previous_hash, hash)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event_id.clone())
        .bind(sequence)
        .bind(event.timestamp)
        .bind(event.participant_id.0.clone())
        .bind(event.kind.as_str())
        .bind(event.success)
        .bind(event.payload.clone())
        .bind(previous_hash.clone())
        .bind(hash.clone())
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(AuditRecord {
            event_id,
            sequence: sequence as u64,
            timestamp: event.timestamp,
            participant_id: event.participant_id,
            kind: event.kind,
            success: event.success,
            payload: event.payload,
            previous_hash,
            hash,
        })
    }

    async fn list_audit_for(
        &self,
        participant: &ParticipantId,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditRecord>> {
        let rows = if window.limit == 0 {
            sqlx::query(
                r#"
                SELECT event_id, sequence, timestamp, participant_id, kind, success, payload, previous_hash, hash
                  FROM trellis_audit_events
                 WHERE participant_id = $1
                 ORDER BY sequence DESC
                 OFFSET $2
                "#,
            )
            .bind(participant.0.clone())
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(
                r#"
                SELECT event_id, sequence, timestamp, participant_id, kind, success, payload, previous_hash, hash
                  FROM trellis_audit_events
                 WHERE participant_id = $1
                 ORDER BY sequence DESC
                 LIMIT $2 OFFSET $3
                "#,
            )
            .bind(participant.0.clone())
            .bind(to_i64(window.limit)?)
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        let rows = if window.limit == 0 {
            sqlx::query(
                r#"
                SELECT event_id, sequence, timestamp, participant_id, kind, success, payload, previous_hash, hash
                  FROM trellis_audit_events
                 ORDER BY sequence DESC
                 OFFSET $1
                "#,
            )
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(
                r#"
                SELECT event_id, sequence, timestamp, participant_id, kind, success, payload, previous_hash, hash
                  FROM trellis_audit_events
                 ORDER BY sequence DESC
                 LIMIT $1 OFFSET $2
                "#,
            )
            .bind(to_i64(window.limit)?)
            .bind(to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        let row =
            sqlx::query("SELECT hash FROM trellis_audit_events ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(row
            .map(|r| r.try_get::<String, _>("hash"))
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))?)
    }
}

fn progress_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<ProgressRecord> {
    let responses_json: serde_json::Value = row
        .try_get("responses")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let metadata_json: serde_json::Value = row
        .try_get("metadata")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let responses: Payload = serde_json::from_value(responses_json)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let metadata: Payload = serde_json::from_value(metadata_json)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let status: String = row
        .try_get("status")
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    Ok(ProgressRecord {
        participant_id: ParticipantId::new(
            row.try_get::<String, _>("participant_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        module_name: ModuleName::new(
            row.try_get::<String, _>("module_name")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        status: parse_progress_status(&status)?,
        responses,
        metadata,
        started_at: row
            .try_get("started_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        last_saved_at: row
            .try_get("last_saved_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn version_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<ConsentVersion> {
    let status: String = row
        .try_get("status")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(ConsentVersion {
        version: row
            .try_get("version")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        status: parse_version_status(&status)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn consent_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<ConsentRecord> {
    Ok(ConsentRecord {
        participant_id: ParticipantId::new(
            row.try_get::<String, _>("participant_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        version: row
            .try_get("version")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        content: row
            .try_get("content")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        accepted_at: row
            .try_get("accepted_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn audit_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<AuditRecord> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(AuditRecord {
        event_id: row
            .try_get("event_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        sequence: row
            .try_get::<i64, _>("sequence")
            .map_err(|e| StorageError::Backend(e.to_string()))? as u64,
        timestamp: row
            .try_get("timestamp")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        participant_id: ParticipantId::new(
            row.try_get::<String, _>("participant_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?,
        ),
        kind: parse_audit_kind(&kind)?,
        success: row
            .try_get("success")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        payload: row
            .try_get("payload")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        previous_hash: row
            .try_get("previous_hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        hash: row
            .try_get("hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn parse_progress_status(raw: &str) -> StorageResult<ProgressStatus> {
    match raw {
        "not_started" => Ok(ProgressStatus::NotStarted),
        "in_progress" => Ok(ProgressStatus::InProgress),
        "completed" => Ok(ProgressStatus::Completed),
        _ => Err(StorageError::Serialization(format!(
            "unknown progress status `{raw}`"
        ))),
    }
}

fn parse_version_status(raw: &str) -> StorageResult<ConsentVersionStatus> {
    match raw {
        "draft" => Ok(ConsentVersionStatus::Draft),
        "active" => Ok(ConsentVersionStatus::Active),
        "retired" => Ok(ConsentVersionStatus::Retired),
        _ => Err(StorageError::Serialization(format!(
            "unknown consent version status `{raw}`"
        ))),
    }
}

fn parse_audit_kind(raw: &str) -> StorageResult<trellis_types::AuditKind> {
    use trellis_types::AuditKind;
    match raw {
        "access_granted" => Ok(AuditKind::AccessGranted),
        "access_denied" => Ok(AuditKind::AccessDenied),
        "module_started" => Ok(AuditKind::ModuleStarted),
        "progress_saved" => Ok(AuditKind::ProgressSaved),
        "module_completed" => Ok(AuditKind::ModuleCompleted),
        "consent_recorded" => Ok(AuditKind::ConsentRecorded),
        "path_access_granted" => Ok(AuditKind::PathAccessGranted),
        "path_access_denied" => Ok(AuditKind::PathAccessDenied),
        "path_write_denied" => Ok(AuditKind::PathWriteDenied),
        _ => Err(StorageError::Serialization(format!(
            "unknown audit kind `{raw}`"
        ))),
    }
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}
