//! Workflow definition validation, ingestion, and the in-memory definition store.
//!
//! Definitions are validated once at registration (unique step ids, resolvable
//! references, Decision branch counts) and then shared immutably as
//! `Arc<WorkflowDefinition>` by every instance started from them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use journalflow_types::workflow::{StepType, WorkflowDefinition};
use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while registering, looking up, or loading definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Structural validation failure.
    #[error("invalid definition '{id}': {reason}")]
    Invalid { id: String, reason: String },

    #[error("definition not found: {0}")]
    NotFound(String),

    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(def: &WorkflowDefinition, reason: String) -> DefinitionError {
    DefinitionError::Invalid {
        id: def.id.clone(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - The id is non-empty and at least one step exists
/// - All step ids are unique
/// - Every `next_steps` entry and `error_handler` resolves to a step id
/// - Decision steps have at most two branches
///
/// With `strict_termination`, additionally rejects any non-End step that has
/// nowhere to go (Decision steps must carry both branches), so every path
/// ends at an explicit End step.
pub fn validate_definition(
    def: &WorkflowDefinition,
    strict_termination: bool,
) -> Result<(), DefinitionError> {
    if def.id.trim().is_empty() {
        return Err(invalid(def, "definition id must not be empty".to_string()));
    }

    if def.steps.is_empty() {
        return Err(invalid(def, "definition must have at least one step".to_string()));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(invalid(def, format!("duplicate step id: '{}'", step.id)));
        }
    }

    for step in &def.steps {
        for target in step.references() {
            if !seen_ids.contains(target) {
                return Err(invalid(
                    def,
                    format!("step '{}' references unknown step '{}'", step.id, target),
                ));
            }
        }

        if step.step_type == StepType::Decision && step.next_steps.len() > 2 {
            return Err(invalid(
                def,
                format!(
                    "decision step '{}' has {} branches (at most 2 allowed)",
                    step.id,
                    step.next_steps.len()
                ),
            ));
        }
    }

    if strict_termination {
        for step in &def.steps {
            let dead_end = match step.step_type {
                StepType::End => false,
                StepType::Decision => step.next_steps.len() < 2,
                _ => step.next_steps.is_empty(),
            };
            if dead_end {
                return Err(invalid(
                    def,
                    format!("step '{}' does not lead to an End step", step.id),
                ));
            }
        }
    }

    Ok(())
}

/// Non-fatal findings about a definition: steps unreachable from the start step.
///
/// Error-handler edges count as reachable paths.
pub fn lint_definition(def: &WorkflowDefinition) -> Vec<String> {
    let Some(start) = def.start_step() else {
        return Vec::new();
    };

    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = def
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &def.steps {
        for target in step.references() {
            if let (Some(&from), Some(&to)) = (indices.get(step.id.as_str()), indices.get(target)) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut reachable = HashSet::new();
    if let Some(&start_idx) = indices.get(start.id.as_str()) {
        let mut dfs = Dfs::new(&graph, start_idx);
        while let Some(nx) = dfs.next(&graph) {
            reachable.insert(graph[nx]);
        }
    }

    def.steps
        .iter()
        .filter(|s| !reachable.contains(s.id.as_str()))
        .map(|s| format!("step '{}' is unreachable from start step '{}'", s.id, start.id))
        .collect()
}

// ---------------------------------------------------------------------------
// Parsing and filesystem ingestion
// ---------------------------------------------------------------------------

/// Parse a YAML (or JSON, which is valid YAML) document into a definition.
///
/// Only deserializes. Structural validation happens at registration.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Discover all definition files (`.yaml` / `.yml`) under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning. A missing directory
/// yields an empty list.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_definition_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping unparseable definition file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Definition store
// ---------------------------------------------------------------------------

/// Concurrent, id-keyed store of validated definitions.
///
/// Re-registering an id replaces the stored definition. Instances already
/// running hold their own `Arc` and keep the version they started with.
#[derive(Debug, Default)]
pub struct DefinitionStore {
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    strict_termination: bool,
}

impl DefinitionStore {
    pub fn new(strict_termination: bool) -> Self {
        Self {
            definitions: DashMap::new(),
            strict_termination,
        }
    }

    /// Validate and store a definition, returning the shared handle.
    pub fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        validate_definition(&definition, self.strict_termination)?;
        for warning in lint_definition(&definition) {
            tracing::warn!(definition_id = %definition.id, "{warning}");
        }

        let definition = Arc::new(definition);
        let replaced = self
            .definitions
            .insert(definition.id.clone(), Arc::clone(&definition))
            .is_some();
        tracing::info!(
            definition_id = %definition.id,
            steps = definition.steps.len(),
            replaced,
            "registered workflow definition"
        );
        Ok(definition)
    }

    pub fn get(&self, id: &str) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        self.definitions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DefinitionError::NotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        self.definitions
            .remove(id)
            .map(|(_, def)| def)
            .ok_or_else(|| DefinitionError::NotFound(id.to_string()))
    }

    /// All stored definitions, ordered by id.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut defs: Vec<_> = self
            .definitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Definitions whose `trigger_event` matches `event` (case-insensitive), ordered by id.
    pub fn find_by_trigger(&self, event: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.list()
            .into_iter()
            .filter(|def| {
                def.trigger_event
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case(event))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
