//! Declarative pipeline definitions.
//!
//! A [`PipelineDefinition`] is a JSON document naming the phases, an optional
//! fault phase, and the interceptors to plan. Each declared step also carries a
//! scripted [`StepBehavior`] so a definition can be simulated end to end.

use std::path::Path;

use serde::{Deserialize, Serialize};

use phaseflow_types::{FaultMode, PhaseflowError, Result};

use crate::phase::PhaseRegistry;
use crate::step::PhaseStep;

/// Which built-in phase table a registry starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinPhases {
    Inbound,
    Outbound,
}

/// A phase entry: either a bare name (priority follows the previous phase)
/// or a name with an explicit priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseDefinition {
    Name(String),
    Explicit {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<i32>,
    },
}

impl PhaseDefinition {
    pub fn name(&self) -> &str {
        match self {
            PhaseDefinition::Name(name) => name,
            PhaseDefinition::Explicit { name, .. } => name,
        }
    }

    pub fn priority(&self) -> Option<i32> {
        match self {
            PhaseDefinition::Name(_) => None,
            PhaseDefinition::Explicit { priority, .. } => *priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin: Option<BuiltinPhases>,
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_phase: Option<String>,
}

impl RegistryDefinition {
    /// Build the registry. Phases without a priority are appended after the
    /// highest priority registered so far.
    pub fn build(&self) -> Result<PhaseRegistry> {
        let mut registry = match self.builtin {
            Some(BuiltinPhases::Inbound) => PhaseRegistry::inbound(),
            Some(BuiltinPhases::Outbound) => PhaseRegistry::outbound(),
            None => PhaseRegistry::new(),
        };
        for phase in &self.phases {
            match phase.priority() {
                Some(priority) => registry.register(phase.name(), priority)?,
                None => {
                    registry.push(phase.name())?;
                }
            }
        }
        if let Some(fault_phase) = &self.fault_phase {
            registry.set_fault_phase(fault_phase.clone())?;
        }
        Ok(registry)
    }
}

/// What a simulated step does when the chain reaches it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepBehavior {
    /// Succeed without side effects.
    #[default]
    Pass,
    /// Fail with a processing error.
    Fail {
        message: String,
        #[serde(default)]
        mode: FaultMode,
    },
    /// Pause the chain and ask the driver to resume it after a delay.
    Suspend { resume_after_ms: u64 },
    /// Add another declared step to the running chain.
    Insert { step: String },
    /// Abort the chain from inside the walk.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Add even if a step with the same id is already in the chain.
    #[serde(default)]
    pub force: bool,
    /// Left out of the initial chain; only added by an `insert` behaviour.
    #[serde(default)]
    pub deferred: bool,
    #[serde(default)]
    pub behavior: StepBehavior,
    /// The step's fault handler fails instead of succeeding.
    #[serde(default)]
    pub fault_handler_fails: bool,
}

impl StepDefinition {
    pub fn phase_step(&self) -> PhaseStep {
        let mut step = PhaseStep::new(&self.id, &self.phase);
        for id in &self.before {
            step.add_before(id);
        }
        for id in &self.after {
            step.add_after(id);
        }
        step
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(flatten)]
    pub registry: RegistryDefinition,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

fn default_name() -> String {
    "pipeline".to_string()
}

impl PipelineDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let definition = Self::from_json(&json)?;
        tracing::debug!(
            path = %path.display(),
            name = %definition.name,
            steps = definition.steps.len(),
            "Pipeline definition loaded"
        );
        Ok(definition)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn build_registry(&self) -> Result<PhaseRegistry> {
        self.registry.build()
    }

    /// First declared step with this id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps that belong in the chain before the first run.
    pub fn initial_steps(&self) -> impl Iterator<Item = &StepDefinition> + '_ {
        self.steps.iter().filter(|s| !s.deferred)
    }
}

impl std::str::FromStr for PipelineDefinition {
    type Err = PhaseflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_json(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "orders",
        "phases": ["receive", {"name": "decode", "priority": 50}, "invoke", "fault"],
        "fault_phase": "fault",
        "steps": [
            {"id": "log", "phase": "receive"},
            {"id": "gunzip", "phase": "decode", "before": ["parse"]},
            {"id": "parse", "phase": "decode",
             "behavior": {"kind": "fail", "message": "bad xml", "mode": "checked_application_fault"}},
            {"id": "late", "phase": "invoke", "deferred": true},
            {"id": "wait", "phase": "invoke",
             "behavior": {"kind": "suspend", "resume_after_ms": 20}}
        ]
    }"#;

    #[test]
    fn parses_phases_and_behaviours() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        assert_eq!(def.name, "orders");
        assert_eq!(def.registry.phases[0], PhaseDefinition::Name("receive".into()));
        assert_eq!(def.registry.phases[1].priority(), Some(50));
        assert_eq!(
            def.step("parse").unwrap().behavior,
            StepBehavior::Fail {
                message: "bad xml".into(),
                mode: FaultMode::CheckedApplicationFault,
            }
        );
        assert_eq!(def.step("log").unwrap().behavior, StepBehavior::Pass);
        assert_eq!(def.initial_steps().count(), 4);
    }

    #[test]
    fn registry_appends_unprioritised_phases() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        let registry = def.build_registry().unwrap();
        let names: Vec<_> = registry.phases().map(|p| p.name().to_string()).collect();
        // "receive" gets 1, "decode" is pinned at 50, later phases follow it.
        assert_eq!(names, vec!["receive", "decode", "invoke", "fault"]);
        assert_eq!(registry.priority("invoke"), Some(51));
        assert_eq!(registry.fault_phase(), Some("fault"));
    }

    #[test]
    fn registry_errors_surface() {
        let def = PipelineDefinition::from_json(
            r#"{"phases": [{"name": "a", "priority": 1}, {"name": "b", "priority": 1}]}"#,
        )
        .unwrap();
        assert!(def.build_registry().unwrap_err().is_configuration());

        let def = PipelineDefinition::from_json(r#"{"phases": ["a"], "fault_phase": "x"}"#).unwrap();
        assert!(matches!(
            def.build_registry().unwrap_err(),
            PhaseflowError::UnknownFaultPhase { .. }
        ));
    }

    #[test]
    fn builtin_table_with_custom_phase() {
        let def = PipelineDefinition::from_json(
            r#"{"builtin": "inbound", "phases": [{"name": "decrypt", "priority": 5001}]}"#,
        )
        .unwrap();
        let registry = def.build_registry().unwrap();
        assert!(registry.contains("receive"));
        assert!(registry.contains("decrypt"));
        assert_eq!(def.name, "pipeline");
    }

    #[test]
    fn step_definition_carries_constraints() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        let step = def.step("gunzip").unwrap().phase_step();
        assert_eq!(step.phase(), "decode");
        assert!(step.before_set().contains("parse"));
        assert!(step.after_set().is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();

        def.save(&path).unwrap();
        let loaded = PipelineDefinition::load(&path).unwrap();
        assert_eq!(loaded, def);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineDefinition::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, PhaseflowError::Io(_)));
    }

    #[test]
    fn malformed_json_is_json_error() {
        let err: PhaseflowError = "{not json".parse::<PipelineDefinition>().unwrap_err();
        assert!(matches!(err, PhaseflowError::Json(_)));
    }
}
