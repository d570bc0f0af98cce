//! Trellis Graph - the static shape of a study.
//!
//! Module and path definitions are immutable once the graph is built; the
//! graph is pure lookup with no side effects. Definitions are
//! serde-loadable so a deployment can supply its own layout; validation
//! happens once at construction and violations are configuration errors.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use trellis_types::{ModuleName, PathName, Payload, ProgressRecord};

/// Immutable module definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: ModuleName,
    pub sequence_order: u32,
    #[serde(default)]
    pub requires_consent: bool,
}

impl ModuleDef {
    pub fn new(name: impl Into<String>, sequence_order: u32, requires_consent: bool) -> Self {
        Self {
            name: ModuleName::new(name),
            sequence_order,
            requires_consent,
        }
    }
}

/// Rule deciding when a path unlocks, evaluated against a read-only
/// snapshot of the participant's completed modules and saved responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockRule {
    /// Always unlocked (sequence gating still applies to the backing module).
    Always,
    /// Unlocked once the named module is completed.
    Completed(ModuleName),
    /// Unlocked when a saved response in `module` has `key == value`.
    ResponseEquals {
        module: ModuleName,
        key: String,
        value: Value,
    },
    AllOf(Vec<UnlockRule>),
    AnyOf(Vec<UnlockRule>),
}

impl UnlockRule {
    pub fn evaluate(&self, snapshot: &ParticipantSnapshot) -> bool {
        match self {
            UnlockRule::Always => true,
            UnlockRule::Completed(module) => snapshot.completed.contains(module),
            UnlockRule::ResponseEquals { module, key, value } => snapshot
                .responses
                .get(module)
                .and_then(|payload| payload.get(key))
                .is_some_and(|found| found == value),
            UnlockRule::AllOf(rules) => rules.iter().all(|rule| rule.evaluate(snapshot)),
            UnlockRule::AnyOf(rules) => rules.iter().any(|rule| rule.evaluate(snapshot)),
        }
    }

    /// Module names the rule reads, used to validate references at build time.
    fn referenced_modules(&self, out: &mut Vec<ModuleName>) {
        match self {
            UnlockRule::Always => {}
            UnlockRule::Completed(module) => out.push(module.clone()),
            UnlockRule::ResponseEquals { module, .. } => out.push(module.clone()),
            UnlockRule::AllOf(rules) | UnlockRule::AnyOf(rules) => {
                for rule in rules {
                    rule.referenced_modules(out);
                }
            }
        }
    }
}

/// Immutable path definition. `module` is the backing module whose progress
/// record carries the path's responses; a path without one is read-only
/// content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathDef {
    pub name: PathName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<ModuleName>,
    pub unlock_rule: UnlockRule,
}

/// Read-only view of one participant's state, built from progress records.
#[derive(Clone, Debug, Default)]
pub struct ParticipantSnapshot {
    pub completed: BTreeSet<ModuleName>,
    pub responses: HashMap<ModuleName, Payload>,
}

impl ParticipantSnapshot {
    pub fn from_records(records: &[ProgressRecord]) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            if record.status.is_completed() {
                snapshot.completed.insert(record.module_name.clone());
            }
            snapshot
                .responses
                .insert(record.module_name.clone(), record.responses.clone());
        }
        snapshot
    }
}

/// Validated, ordered module and path lookup.
#[derive(Clone, Debug)]
pub struct ModuleGraph {
    modules: Vec<ModuleDef>,
    by_name: HashMap<ModuleName, usize>,
    paths: HashMap<PathName, PathDef>,
}

impl ModuleGraph {
    /// Build a graph, validating uniqueness and reference integrity.
    pub fn new(mut modules: Vec<ModuleDef>, paths: Vec<PathDef>) -> Result<Self, GraphError> {
        if modules.is_empty() {
            return Err(GraphError::Empty);
        }

        modules.sort_by_key(|m| m.sequence_order);

        let mut by_name = HashMap::new();
        let mut orders = BTreeSet::new();
        for (index, module) in modules.iter().enumerate() {
            if by_name.insert(module.name.clone(), index).is_some() {
                return Err(GraphError::DuplicateModule(module.name.clone()));
            }
            if !orders.insert(module.sequence_order) {
                return Err(GraphError::DuplicateSequence(module.sequence_order));
            }
        }

        let mut path_map = HashMap::new();
        for path in paths {
            if let Some(module) = &path.module {
                if !by_name.contains_key(module) {
                    return Err(GraphError::UnknownPathModule {
                        path: path.name.clone(),
                        module: module.clone(),
                    });
                }
            }
            let mut referenced = Vec::new();
            path.unlock_rule.referenced_modules(&mut referenced);
            for module in referenced {
                if !by_name.contains_key(&module) {
                    return Err(GraphError::UnknownPathModule {
                        path: path.name.clone(),
                        module,
                    });
                }
            }
            let name = path.name.clone();
            if path_map.insert(name.clone(), path).is_some() {
                return Err(GraphError::DuplicatePath(name));
            }
        }

        Ok(Self {
            modules,
            by_name,
            paths: path_map,
        })
    }

    pub fn module_by_name(&self, name: &ModuleName) -> Option<&ModuleDef> {
        self.by_name.get(name).map(|index| &self.modules[*index])
    }

    /// The module with the smallest sequence order strictly greater than
    /// `current_order`.
    pub fn next_by_sequence(&self, current_order: u32) -> Option<&ModuleDef> {
        self.modules
            .iter()
            .find(|module| module.sequence_order > current_order)
    }

    /// All modules, ascending by sequence order.
    pub fn all_modules(&self) -> &[ModuleDef] {
        &self.modules
    }

    pub fn first_module(&self) -> &ModuleDef {
        &self.modules[0]
    }

    /// Modules strictly before `order`, ascending. These are the linear
    /// prerequisites of the module at `order`.
    pub fn modules_before(&self, order: u32) -> impl Iterator<Item = &ModuleDef> {
        self.modules
            .iter()
            .take_while(move |module| module.sequence_order < order)
    }

    pub fn path_by_name(&self, name: &PathName) -> Option<&PathDef> {
        self.paths.get(name)
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &PathDef> {
        self.paths.values()
    }
}

/// The fixed study layout: a consent module followed by four content
/// modules, with two conditionally-unlocked paths branching off module2.
pub fn study_default() -> ModuleGraph {
    let modules = vec![
        ModuleDef::new("consent", 1, false),
        ModuleDef::new("module1", 2, true),
        ModuleDef::new("module2", 3, true),
        ModuleDef::new("module3", 4, true),
        ModuleDef::new("module4", 5, true),
    ];
    let paths = vec![
        PathDef {
            name: PathName::new("pathA"),
            module: Some(ModuleName::new("module3")),
            unlock_rule: UnlockRule::AllOf(vec![
                UnlockRule::Completed(ModuleName::new("module2")),
                UnlockRule::ResponseEquals {
                    module: ModuleName::new("module2"),
                    key: "branch".to_string(),
                    value: serde_json::json!("a"),
                },
            ]),
        },
        PathDef {
            name: PathName::new("pathB"),
            module: Some(ModuleName::new("module3")),
            unlock_rule: UnlockRule::AllOf(vec![
                UnlockRule::Completed(ModuleName::new("module2")),
                UnlockRule::ResponseEquals {
                    module: ModuleName::new("module2"),
                    key: "branch".to_string(),
                    value: serde_json::json!("b"),
                },
            ]),
        },
    ];

    // The fixed layout is validated by construction; a failure here is a
    // programming error in this crate, not runtime input.
    ModuleGraph::new(modules, paths).expect("default study layout is valid")
}

/// Graph construction errors. These are configuration errors surfaced at
/// bootstrap, never user errors.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("module graph has no modules")]
    Empty,

    #[error("duplicate module name: {0}")]
    DuplicateModule(ModuleName),

    #[error("duplicate sequence order: {0}")]
    DuplicateSequence(u32),

    #[error("duplicate path name: {0}")]
    DuplicatePath(PathName),

    #[error("path {path} references unknown module {module}")]
    UnknownPathModule { path: PathName, module: ModuleName },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_ordered() {
        let graph = study_default();
        let orders: Vec<u32> = graph
            .all_modules()
            .iter()
            .map(|m| m.sequence_order)
            .collect();
        assert_eq!(orders, vec![1, 2, 3, 4, 5]);
        assert_eq!(graph.first_module().name, ModuleName::new("consent"));
    }

    #[test]
    fn next_by_sequence_walks_forward() {
        let graph = study_default();
        let next = graph.next_by_sequence(1).unwrap();
        assert_eq!(next.name, ModuleName::new("module1"));
        assert!(graph.next_by_sequence(5).is_none());
    }

    #[test]
    fn duplicate_orders_are_rejected() {
        let result = ModuleGraph::new(
            vec![
                ModuleDef::new("a", 1, false),
                ModuleDef::new("b", 1, false),
            ],
            vec![],
        );
        assert!(matches!(result, Err(GraphError::DuplicateSequence(1))));
    }

    #[test]
    fn unknown_rule_reference_is_rejected() {
        let result = ModuleGraph::new(
            vec![ModuleDef::new("a", 1, false)],
            vec![PathDef {
                name: PathName::new("p"),
                module: None,
                unlock_rule: UnlockRule::Completed(ModuleName::new("missing")),
            }],
        );
        assert!(matches!(result, Err(GraphError::UnknownPathModule { .. })));
    }

    #[test]
    fn unlock_rules_compose() {
        let mut snapshot = ParticipantSnapshot::default();
        snapshot.completed.insert(ModuleName::new("module2"));
        let mut responses = Payload::new();
        responses.insert("branch".to_string(), serde_json::json!("a"));
        snapshot
            .responses
            .insert(ModuleName::new("module2"), responses);

        let graph = study_default();
        let path_a = graph.path_by_name(&PathName::new("pathA")).unwrap();
        let path_b = graph.path_by_name(&PathName::new("pathB")).unwrap();
        assert!(path_a.unlock_rule.evaluate(&snapshot));
        assert!(!path_b.unlock_rule.evaluate(&snapshot));
    }

    #[test]
    fn snapshot_collects_completed_and_responses() {
        use chrono::Utc;
        use trellis_types::{ParticipantId, ProgressStatus};

        let record = ProgressRecord {
            participant_id: ParticipantId::new("p-1"),
            module_name: ModuleName::new("module1"),
            status: ProgressStatus::Completed,
            responses: Payload::new(),
            metadata: Payload::new(),
            started_at: None,
            last_saved_at: None,
            completed_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let snapshot = ParticipantSnapshot::from_records(&[record]);
        assert!(snapshot.completed.contains(&ModuleName::new("module1")));
    }
}
