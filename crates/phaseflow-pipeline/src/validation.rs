//! Pipeline definition validation: lint rules and diagnostics.
//!
//! Provides 9 built-in rules that check a [`PipelineDefinition`] before it is
//! turned into a chain. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on any `Error`-severity issue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use phaseflow_types::{Interceptor, PhaseflowError};

use crate::chain::PhaseChain;
use crate::config::{PipelineDefinition, StepBehavior};
use crate::phase::PhaseRegistry;
use crate::step::FnInterceptor;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step_id: Option<String>,
    pub phase: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The phases the definition describes, ignoring its fault phase. Rules
/// that need it stay quiet when it cannot be built; `phases` reports why.
fn registry_of(definition: &PipelineDefinition) -> Option<PhaseRegistry> {
    let mut phases = definition.registry.clone();
    phases.fault_phase = None;
    phases.build().ok()
}

fn phase_of<'a>(definition: &'a PipelineDefinition, id: &str) -> Option<&'a str> {
    definition.step(id).map(|s| s.phase.as_str())
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct PhasesRule;
impl LintRule for PhasesRule {
    fn name(&self) -> &str { "phases" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let registry = &definition.registry;
        if registry.builtin.is_none() && registry.phases.is_empty() {
            return vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Pipeline declares no phases".into(),
                step_id: None,
                phase: None,
                fix: Some("Add a \"phases\" list or a \"builtin\" phase table".into()),
            }];
        }
        let (err, fix) = match definition.build_registry() {
            Err(err @ (PhaseflowError::DuplicatePhase { .. } | PhaseflowError::DuplicatePriority { .. })) => {
                (err, "Give every phase a unique name and priority")
            }
            Err(err @ PhaseflowError::PriorityOverflow { .. }) => {
                (err, "Give the phase an explicit priority below the last one")
            }
            _ => return vec![],
        };
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Error,
            message: err.to_string(),
            step_id: None,
            phase: None,
            fix: Some(fix.into()),
        }]
    }
}

struct FaultPhaseRule;
impl LintRule for FaultPhaseRule {
    fn name(&self) -> &str { "fault_phase" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let Some(fault_phase) = &definition.registry.fault_phase else {
            return vec![];
        };
        let Some(registry) = registry_of(definition) else {
            return vec![];
        };
        if registry.contains(fault_phase) {
            vec![]
        } else {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Fault phase '{fault_phase}' is not a declared phase"),
                step_id: None,
                phase: Some(fault_phase.clone()),
                fix: Some(format!("Declare phase '{fault_phase}' or remove \"fault_phase\"")),
            }]
        }
    }
}

struct StepPhaseRule;
impl LintRule for StepPhaseRule {
    fn name(&self) -> &str { "step_phase" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let Some(registry) = registry_of(definition) else {
            return vec![];
        };
        definition
            .steps
            .iter()
            .filter(|s| !registry.contains(&s.phase))
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Step '{}' is in unknown phase '{}'", s.id, s.phase),
                step_id: Some(s.id.clone()),
                phase: Some(s.phase.clone()),
                fix: Some(format!("Declare phase '{}' or move the step", s.phase)),
            })
            .collect()
    }
}

struct DuplicateIdRule;
impl LintRule for DuplicateIdRule {
    fn name(&self) -> &str { "duplicate_id" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        definition
            .initial_steps()
            .filter(|s| !seen.insert(s.id.as_str()) && !s.force)
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Step id '{}' is declared more than once; only the first is added", s.id),
                step_id: Some(s.id.clone()),
                phase: Some(s.phase.clone()),
                fix: Some("Rename the step or set \"force\": true".into()),
            })
            .collect()
    }
}

struct DanglingReferenceRule;
impl LintRule for DanglingReferenceRule {
    fn name(&self) -> &str { "dangling_reference" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let ids: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        let mut diagnostics = Vec::new();
        for step in &definition.steps {
            for target in step.before.iter().chain(&step.after) {
                if !ids.contains(target.as_str()) {
                    diagnostics.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Info,
                        message: format!(
                            "Step '{}' is ordered relative to '{target}', which is not declared; the constraint has no effect",
                            step.id
                        ),
                        step_id: Some(step.id.clone()),
                        phase: Some(step.phase.clone()),
                        fix: None,
                    });
                }
            }
        }
        diagnostics
    }
}

struct CrossPhaseConstraintRule;
impl LintRule for CrossPhaseConstraintRule {
    fn name(&self) -> &str { "cross_phase_constraint" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for step in &definition.steps {
            for target in step.before.iter().chain(&step.after) {
                match phase_of(definition, target) {
                    Some(phase) if phase != step.phase => diagnostics.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Step '{}' ({}) is ordered relative to '{target}' ({phase}); phases decide that order and the constraint is ignored",
                            step.id, step.phase
                        ),
                        step_id: Some(step.id.clone()),
                        phase: Some(step.phase.clone()),
                        fix: Some("Drop the constraint or move both steps into one phase".into()),
                    }),
                    _ => {}
                }
            }
        }
        diagnostics
    }
}

struct ConstraintCycleRule;
impl LintRule for ConstraintCycleRule {
    fn name(&self) -> &str { "constraint_cycle" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let Some(registry) = registry_of(definition) else {
            return vec![];
        };
        let chain = PhaseChain::new(Arc::new(registry));
        for step in &definition.steps {
            let interceptor: Arc<dyn Interceptor> = Arc::new(FnInterceptor::noop(step.phase_step()));
            // Unknown phases are reported by `step_phase`.
            let _ = chain.add(interceptor);
        }
        chain
            .ordering_conflicts()
            .into_iter()
            .map(|conflict| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("{conflict}; insertion order is used instead"),
                step_id: conflict.interceptors.first().cloned(),
                phase: Some(conflict.phase.clone()),
                fix: Some("Remove one of the before/after constraints forming the cycle".into()),
            })
            .collect()
    }
}

struct InsertTargetRule;
impl LintRule for InsertTargetRule {
    fn name(&self) -> &str { "insert_target" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        definition
            .steps
            .iter()
            .filter_map(|s| match &s.behavior {
                StepBehavior::Insert { step } if definition.step(step).is_none() => Some(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Step '{}' inserts undeclared step '{step}'", s.id),
                    step_id: Some(s.id.clone()),
                    phase: Some(s.phase.clone()),
                    fix: Some(format!("Declare step '{step}' with \"deferred\": true")),
                }),
                _ => None,
            })
            .collect()
    }
}

struct DeferredReachableRule;
impl LintRule for DeferredReachableRule {
    fn name(&self) -> &str { "deferred_reachable" }
    fn apply(&self, definition: &PipelineDefinition) -> Vec<Diagnostic> {
        let inserted: HashMap<&str, &str> = definition
            .steps
            .iter()
            .filter_map(|s| match &s.behavior {
                StepBehavior::Insert { step } => Some((step.as_str(), s.id.as_str())),
                _ => None,
            })
            .collect();
        definition
            .steps
            .iter()
            .filter(|s| s.deferred && !inserted.contains_key(s.id.as_str()))
            .map(|s| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Deferred step '{}' is never inserted and will not run", s.id),
                step_id: Some(s.id.clone()),
                phase: Some(s.phase.clone()),
                fix: Some("Add an \"insert\" behaviour targeting it or drop \"deferred\"".into()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules against the definition.
pub fn validate(definition: &PipelineDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(PhasesRule),
        Box::new(FaultPhaseRule),
        Box::new(StepPhaseRule),
        Box::new(DuplicateIdRule),
        Box::new(DanglingReferenceRule),
        Box::new(CrossPhaseConstraintRule),
        Box::new(ConstraintCycleRule),
        Box::new(InsertTargetRule),
        Box::new(DeferredReachableRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(definition));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(definition: &PipelineDefinition) -> phaseflow_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(definition);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(PhaseflowError::InvalidDefinition(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
