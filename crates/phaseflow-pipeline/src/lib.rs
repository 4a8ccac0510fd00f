//! Phase registry, interceptor ordering, and the chain execution engine.
//!
//! This crate implements the Phaseflow interceptor chain: priority-ordered
//! phases, per-phase before/after ordering, the pausable and re-entrant
//! [`PhaseChain`] walker with its reverse fault unwind, declarative pipeline
//! definitions, and the built-in lint rules for them.

pub mod chain;
pub mod config;
mod fault;
mod ordering;
pub mod phase;
pub mod step;
pub mod validation;

pub use chain::PhaseChain;
pub use config::{
    BuiltinPhases, PhaseDefinition, PipelineDefinition, RegistryDefinition, StepBehavior,
    StepDefinition,
};
pub use ordering::OrderingConflict;
pub use phase::{names, Phase, PhaseRegistry};
pub use step::{FnInterceptor, PhaseStep};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
