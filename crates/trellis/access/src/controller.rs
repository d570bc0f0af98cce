//! Access controller: consent gating plus the strict linear prerequisite
//! chain, and the audited convenience operations the request boundary
//! calls.
//!
//! The controller never holds the terminal-state guard itself; the access
//! check is a read-only precondition and the at-most-once completion lives
//! inside the progress store's conditional update.

use crate::AccessError;
use std::sync::Arc;
use trellis_audit::AuditTrail;
use trellis_consent::ConsentGate;
use trellis_graph::{ModuleDef, ModuleGraph, ParticipantSnapshot};
use trellis_progress::ProgressStateMachine;
use trellis_storage::QueryWindow;
use trellis_types::{
    AccessDecision, AuditKind, DenialReason, ModuleName, ParticipantId, Payload, ProgressRecord,
};

/// Outcome of a completion call: the frozen record plus the recomputed
/// next module, `None` when the study is finished.
#[derive(Clone, Debug)]
pub struct CompletionOutcome {
    pub record: ProgressRecord,
    pub next_module: Option<ModuleName>,
}

/// Answers module accessibility and advances participants through the
/// sequence.
#[derive(Clone)]
pub struct AccessController {
    graph: Arc<ModuleGraph>,
    consent: ConsentGate,
    progress: ProgressStateMachine,
    audit: AuditTrail,
}

impl AccessController {
    pub fn new(
        graph: Arc<ModuleGraph>,
        consent: ConsentGate,
        progress: ProgressStateMachine,
        audit: AuditTrail,
    ) -> Self {
        Self {
            graph,
            consent,
            progress,
            audit,
        }
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    /// Decide whether `module_name` is accessible to the participant right
    /// now. Always appends one audit event describing the outcome.
    pub async fn check_access(
        &self,
        participant: &ParticipantId,
        module_name: &ModuleName,
    ) -> Result<AccessDecision, AccessError> {
        let module = self
            .graph
            .module_by_name(module_name)
            .ok_or_else(|| AccessError::ModuleNotFound(module_name.clone()))?
            .clone();

        let decision = self.evaluate_module(participant, &module).await?;

        let kind = if decision.accessible {
            AuditKind::AccessGranted
        } else {
            AuditKind::AccessDenied
        };
        self.audit
            .record(
                participant,
                kind,
                decision.accessible,
                serde_json::json!({
                    "module": module_name.0,
                    "reason": decision.reason.map(|r| r.as_str()),
                }),
            )
            .await;

        Ok(decision)
    }

    /// The lowest-order module not yet completed that passes the consent
    /// and sequence gates; `None` once the study is finished (or blocked on
    /// consent with nothing actionable before it).
    pub async fn current_module(
        &self,
        participant: &ParticipantId,
    ) -> Result<Option<ModuleDef>, AccessError> {
        let snapshot = self.snapshot(participant).await?;

        for module in self.graph.all_modules() {
            if snapshot.completed.contains(&module.name) {
                continue;
            }
            // First non-completed module in ascending order: every earlier
            // module is completed, so the sequence gate holds.
            if module.requires_consent && !self.consent.has_valid_consent(participant).await? {
                return Ok(None);
            }
            return Ok(Some(module.clone()));
        }
        Ok(None)
    }

    /// Recomputed after every completion; identical to `current_module`.
    pub async fn next_accessible_module(
        &self,
        participant: &ParticipantId,
    ) -> Result<Option<ModuleDef>, AccessError> {
        self.current_module(participant).await
    }

    /// Access-checked start. Denials surface as `AccessError::Denied`.
    pub async fn start_module(
        &self,
        participant: &ParticipantId,
        module_name: &ModuleName,
    ) -> Result<ProgressRecord, AccessError> {
        self.require_access(participant, module_name).await?;
        Ok(self.progress.start(participant, module_name).await?)
    }

    /// Access-checked partial save.
    pub async fn save_module(
        &self,
        participant: &ParticipantId,
        module_name: &ModuleName,
        responses: Payload,
    ) -> Result<ProgressRecord, AccessError> {
        self.require_access(participant, module_name).await?;
        Ok(self
            .progress
            .save_progress(participant, module_name, responses)
            .await?)
    }

    /// Access-checked completion. On success the next module is recomputed
    /// so the caller can advance the participant's active-module pointer.
    pub async fn complete_module(
        &self,
        participant: &ParticipantId,
        module_name: &ModuleName,
        responses: Payload,
        metadata: Payload,
    ) -> Result<CompletionOutcome, AccessError> {
        self.require_access(participant, module_name).await?;
        let record = self
            .progress
            .complete(participant, module_name, responses, metadata)
            .await?;

        let next_module = self
            .next_accessible_module(participant)
            .await?
            .map(|module| module.name);
        tracing::info!(
            participant = %participant,
            module = %module_name,
            next = next_module.as_ref().map(|m| m.0.as_str()),
            "module completed; pointer advanced"
        );

        Ok(CompletionOutcome {
            record,
            next_module,
        })
    }

    async fn require_access(
        &self,
        participant: &ParticipantId,
        module_name: &ModuleName,
    ) -> Result<(), AccessError> {
        let decision = self.check_access(participant, module_name).await?;
        if decision.accessible {
            return Ok(());
        }
        Err(AccessError::Denied {
            reason: decision
                .reason
                .unwrap_or(DenialReason::PriorModulesIncomplete),
            next_module: decision.next_module,
        })
    }

    async fn evaluate_module(
        &self,
        participant: &ParticipantId,
        module: &ModuleDef,
    ) -> Result<AccessDecision, AccessError> {
        if module.requires_consent && !self.consent.has_valid_consent(participant).await? {
            return Ok(AccessDecision::denied(DenialReason::ConsentRequired));
        }

        let snapshot = self.snapshot(participant).await?;
        for prerequisite in self.graph.modules_before(module.sequence_order) {
            if !snapshot.completed.contains(&prerequisite.name) {
                return Ok(AccessDecision::denied_with_next(
                    DenialReason::PriorModulesIncomplete,
                    prerequisite.name.clone(),
                ));
            }
        }

        Ok(AccessDecision::granted())
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trellis_graph::study_default;
    use trellis_storage::memory::InMemoryTrellisStorage;
    use trellis_storage::{AuditStore, ConsentStore};
    use trellis_types::ConsentVersion;

    async fn controller() -> (AccessController, Arc<InMemoryTrellisStorage>) {
        let storage = Arc::new(InMemoryTrellisStorage::new());
        let audit = AuditTrail::new(storage.clone());
        let consent = ConsentGate::new(storage.clone(), audit.clone());
        let progress = ProgressStateMachine::new(storage.clone(), audit.clone());
        let controller = AccessController::new(
            Arc::new(study_default()),
            consent,
            progress,
            audit,
        );

        storage
            .insert_version(ConsentVersion::draft("v1", Utc::now()))
            .await
            .unwrap();
        storage.activate_version("v1", Utc::now()).await.unwrap();

        (controller, storage)
    }

    fn participant() -> ParticipantId {
        ParticipantId::new("p-1")
    }

    async fn give_consent(controller: &AccessController) {
        // Completing the consent module and recording consent mirrors the
        // real enrollment flow.
        controller
            .complete_module(
                &participant(),
                &ModuleName::new("consent"),
                Payload::new(),
                Payload::new(),
            )
            .await
            .unwrap();
        controller
            .consent
            .record_consent(&participant(), "v1", serde_json::json!({"accepted": true}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_module_is_always_accessible() {
        let (controller, _) = controller().await;
        let decision = controller
            .check_access(&participant(), &ModuleName::new("consent"))
            .await
            .unwrap();
        assert!(decision.accessible);
    }

    #[tokio::test]
    async fn unknown_module_is_an_error() {
        let (controller, _) = controller().await;
        let result = controller
            .check_access(&participant(), &ModuleName::new("modulex"))
            .await;
        assert!(matches!(result, Err(AccessError::ModuleNotFound(_))));
    }

    #[tokio::test]
    async fn consent_gate_blocks_before_sequence_gate() {
        let (controller, _) = controller().await;
        let decision = controller
            .check_access(&participant(), &ModuleName::new("module1"))
            .await
            .unwrap();
        assert!(!decision.accessible);
        assert_eq!(decision.reason, Some(DenialReason::ConsentRequired));
    }

    #[tokio::test]
    async fn sequence_gate_reports_first_incomplete_prerequisite() {
        let (controller, _storage) = controller().await;
        give_consent(&controller).await;

        let decision = controller
            .check_access(&participant(), &ModuleName::new("module3"))
            .await
            .unwrap();
        assert!(!decision.accessible);
        assert_eq!(decision.reason, Some(DenialReason::PriorModulesIncomplete));
        assert_eq!(decision.next_module, Some(ModuleName::new("module1")));
    }

    #[tokio::test]
    async fn completing_prerequisites_unlocks_in_order() {
        let (controller, _storage) = controller().await;
        give_consent(&controller).await;

        for name in ["module1", "module2"] {
            let outcome = controller
                .complete_module(
                    &participant(),
                    &ModuleName::new(name),
                    Payload::new(),
                    Payload::new(),
                )
                .await
                .unwrap();
            assert!(outcome.next_module.is_some());
        }

        let decision = controller
            .check_access(&participant(), &ModuleName::new("module3"))
            .await
            .unwrap();
        assert!(decision.accessible);
    }

    #[tokio::test]
    async fn current_module_walks_the_sequence_to_the_end() {
        let (controller, _storage) = controller().await;

        let current = controller.current_module(&participant()).await.unwrap();
        assert_eq!(current.unwrap().name, ModuleName::new("consent"));

        give_consent(&controller).await;

        for (name, expected_next) in [
            ("module1", Some("module2")),
            ("module2", Some("module3")),
            ("module3", Some("module4")),
            ("module4", None),
        ] {
            let outcome = controller
                .complete_module(
                    &participant(),
                    &ModuleName::new(name),
                    Payload::new(),
                    Payload::new(),
                )
                .await
                .unwrap();
            assert_eq!(
                outcome.next_module,
                expected_next.map(ModuleName::new),
                "after completing {name}"
            );
        }

        let finished = controller.current_module(&participant()).await.unwrap();
        assert!(finished.is_none());
    }

    #[tokio::test]
    async fn consent_rollover_revokes_access() {
        let (controller, storage) = controller().await;
        give_consent(&controller).await;

        let before = controller
            .check_access(&participant(), &ModuleName::new("module1"))
            .await
            .unwrap();
        assert!(before.accessible);

        storage
            .insert_version(ConsentVersion::draft("v2", Utc::now()))
            .await
            .unwrap();
        storage.activate_version("v2", Utc::now()).await.unwrap();

        let after = controller
            .check_access(&participant(), &ModuleName::new("module1"))
            .await
            .unwrap();
        assert!(!after.accessible);
        assert_eq!(after.reason, Some(DenialReason::ConsentRequired));
    }

    #[tokio::test]
    async fn denied_mutation_does_not_touch_progress() {
        let (controller, _) = controller().await;

        let result = controller
            .start_module(&participant(), &ModuleName::new("module2"))
            .await;
        assert!(matches!(result, Err(AccessError::Denied { .. })));

        let record = controller
            .progress
            .get_progress(&participant(), &ModuleName::new("module2"))
            .await;
        assert!(record.is_err());
    }

    #[tokio::test]
    async fn every_decision_is_audited() {
        let (controller, storage) = controller().await;

        controller
            .check_access(&participant(), &ModuleName::new("consent"))
            .await
            .unwrap();
        controller
            .check_access(&participant(), &ModuleName::new("module1"))
            .await
            .unwrap();

        let events = storage
            .list_audit_for(&participant(), trellis_storage::QueryWindow::default())
            .await
            .unwrap();
        let kinds: Vec<AuditKind> = events.iter().rev().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![AuditKind::AccessGranted, AuditKind::AccessDenied]
        );
    }

    #[tokio::test]
    async fn missing_active_version_surfaces_as_configuration_error() {
        let storage = Arc::new(InMemoryTrellisStorage::new());
        let audit = AuditTrail::new(storage.clone());
        let consent = ConsentGate::new(storage.clone(), audit.clone());
        let progress = ProgressStateMachine::new(storage.clone(), audit.clone());
        let controller =
            AccessController::new(Arc::new(study_default()), consent, progress, audit);

        let result = controller
            .check_access(&participant(), &ModuleName::new("module1"))
            .await;
        assert!(matches!(result, Err(AccessError::Configuration(_))));
    }
}
