//! Path access: branching unlock rules and permanent read-only after
//! completion.
//!
//! A path unlocks by outcome (its rule reads the completed set and prior
//! responses), not by sequence position. Once the backing module is
//! completed the path stays readable forever but rejects every write; that
//! check runs before the normal transition logic so review access and the
//! write ban cannot drift apart.

use crate::AccessError;
use std::sync::Arc;
use trellis_audit::AuditTrail;
use trellis_graph::{ModuleGraph, ParticipantSnapshot, PathDef};
use trellis_progress::{ProgressError, ProgressStateMachine};
use trellis_storage::QueryWindow;
use trellis_types::{
    AuditKind, DenialReason, ModuleName, ParticipantId, PathDecision, PathName, Payload,
    ProgressRecord,
};

/// Evaluates branching path access and guards path writes.
#[derive(Clone)]
pub struct PathAccessEvaluator {
    graph: Arc<ModuleGraph>,
    progress: ProgressStateMachine,
    audit: AuditTrail,
}

impl PathAccessEvaluator {
    pub fn new(graph: Arc<ModuleGraph>, progress: ProgressStateMachine, audit: AuditTrail) -> Self {
        Self {
            graph,
            progress,
            audit,
        }
    }

    /// Whether the path is visible to the participant. Completed paths stay
    /// visible (review mode); locked rules report
    /// `branching_rule_not_satisfied`.
    pub async fn check_path_access(
        &self,
        participant: &ParticipantId,
        path_name: &PathName,
    ) -> Result<PathDecision, AccessError> {
        let path = self.path(path_name)?.clone();
        let snapshot = self.snapshot(participant).await?;

        let decision = if path.unlock_rule.evaluate(&snapshot) {
            PathDecision::granted()
        } else {
            PathDecision::denied(DenialReason::BranchingRuleNotSatisfied)
        };

        let kind = if decision.accessible {
            AuditKind::PathAccessGranted
        } else {
            AuditKind::PathAccessDenied
        };
        self.audit
            .record(
                participant,
                kind,
                decision.accessible,
                serde_json::json!({
                    "path": path_name.0,
                    "reason": decision.reason.map(|r| r.as_str()),
                }),
            )
            .await;

        Ok(decision)
    }

    /// Start the path's backing module. Rejected with `PathReadOnly` once
    /// the backing module is completed.
    pub async fn start_path(
        &self,
        participant: &ParticipantId,
        path_name: &PathName,
    ) -> Result<ProgressRecord, AccessError> {
        let module = self.require_writable(participant, path_name).await?;
        Ok(self.progress.start(participant, &module).await?)
    }

    /// Save partial responses against the path's backing module.
    pub async fn save_path(
        &self,
        participant: &ParticipantId,
        path_name: &PathName,
        responses: Payload,
    ) -> Result<ProgressRecord, AccessError> {
        let module = self.require_writable(participant, path_name).await?;
        Ok(self
            .progress
            .save_progress(participant, &module, responses)
            .await?)
    }

    /// Complete the path's backing module.
    pub async fn complete_path(
        &self,
        participant: &ParticipantId,
        path_name: &PathName,
        responses: Payload,
        metadata: Payload,
    ) -> Result<ProgressRecord, AccessError> {
        let module = self.require_writable(participant, path_name).await?;
        Ok(self
            .progress
            .complete(participant, &module, responses, metadata)
            .await?)
    }

    /// Read the frozen (or in-flight) record backing the path, for review
    /// surfaces. Never mutates.
    pub async fn review_path(
        &self,
        participant: &ParticipantId,
        path_name: &PathName,
    ) -> Result<ProgressRecord, AccessError> {
        let path = self.path(path_name)?;
        let module = path
            .module
            .clone()
            .ok_or_else(|| AccessError::PathNotWritable(path_name.clone()))?;
        Ok(self.progress.get_progress(participant, &module).await?)
    }

    /// The write gate: read-only pre-check first, then the unlock rule.
    async fn require_writable(
        &self,
        participant: &ParticipantId,
        path_name: &PathName,
    ) -> Result<ModuleName, AccessError> {
        let path = self.path(path_name)?.clone();
        let module = path
            .module
            .clone()
            .ok_or_else(|| AccessError::PathNotWritable(path_name.clone()))?;

        if let Some(record) = self.backing_record(participant, &module).await? {
            if record.status.is_completed() {
                self.audit
                    .record(
                        participant,
                        AuditKind::PathWriteDenied,
                        false,
                        serde_json::json!({
                            "path": path_name.0,
                            "reason": DenialReason::PathReadOnly.as_str(),
                        }),
                    )
                    .await;
                return Err(AccessError::Denied {
                    reason: DenialReason::PathReadOnly,
                    next_module: None,
                });
            }
        }

        let snapshot = self.snapshot(participant).await?;
        if !path.unlock_rule.evaluate(&snapshot) {
            self.audit
                .record(
                    participant,
                    AuditKind::PathAccessDenied,
                    false,
                    serde_json::json!({
                        "path": path_name.0,
                        "reason": DenialReason::BranchingRuleNotSatisfied.as_str(),
                    }),
                )
                .await;
            return Err(AccessError::Denied {
                reason: DenialReason::BranchingRuleNotSatisfied,
                next_module: None,
            });
        }

        Ok(module)
    }

    fn path(&self, path_name: &PathName) -> Result<&PathDef, AccessError> {
        self.graph
            .path_by_name(path_name)
            .ok_or_else(|| AccessError::PathNotFound(path_name.clone()))
    }

    async fn backing_record(
        &self,
        participant: &ParticipantId,
        module: &ModuleName,
    ) -> Result<Option<ProgressRecord>, AccessError> {
        match self.progress.get_progress(participant, module).await {
            Ok(record) => Ok(Some(record)),
            Err(ProgressError::NotFound { .. }) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    async fn snapshot(
        &self,
        participant: &ParticipantId,
    ) -> Result<ParticipantSnapshot, AccessError> {
        let records = self
            .progress
            .list_progress(participant, QueryWindow::default())
            .await?;
        Ok(ParticipantSnapshot::from_records(&records))
    }
}
