//! Shared types, errors, message context, and traits for the Phaseflow interceptor chain.
//!
//! This crate provides the foundational types used across all other Phaseflow crates:
//! - `PhaseflowError`: unified error taxonomy for configuration and state misuse
//! - `ProcessingError` / `StepError`: what an interceptor returns when it fails or suspends
//! - `Fault`: the failure record the engine writes onto a message
//! - `OrderingSet`: the before/after constraint sets interceptors declare
//! - `Message`: the mutable per-request context threaded through every interceptor
//! - `Interceptor`, `InterceptorChain`, `FaultSink`, `FaultListener`: the engine's seams

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

mod interceptor;
mod message;

pub use interceptor::{FaultListener, FaultSink, Interceptor, InterceptorChain};
pub use message::Message;

/// Unified error type for everything the chain surfaces to its callers.
///
/// Interceptor failures are deliberately absent: they are [`ProcessingError`]s,
/// which the engine contains and turns into a [`Fault`].
#[derive(Debug, thiserror::Error)]
pub enum PhaseflowError {
    // === Configuration Errors ===
    #[error("Phase '{name}' is already registered")]
    DuplicatePhase { name: String },

    #[error("Phase '{name}' reuses priority {priority} already held by '{existing}'")]
    DuplicatePriority {
        name: String,
        priority: i32,
        existing: String,
    },

    #[error("Phase '{name}' cannot be appended: the last priority is already i32::MAX")]
    PriorityOverflow { name: String },

    #[error("Interceptor '{interceptor}' references unknown phase '{phase}'")]
    UnknownPhase { interceptor: String, phase: String },

    #[error("Fault phase '{phase}' is not a registered phase")]
    UnknownFaultPhase { phase: String },

    #[error("Pipeline definition invalid: {0}")]
    InvalidDefinition(String),

    // === State Errors ===
    #[error("Cannot {operation} a chain in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ChainState,
    },

    #[error("Cannot {operation} while the chain is being walked")]
    WalkInProgress { operation: &'static str },

    #[error("No interceptor with id '{id}' in the remaining plan")]
    UnknownInterceptor { id: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PhaseflowError {
    /// Returns `true` for errors raised while registering phases or interceptors.
    /// These surface at build time and are never deferred to a run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PhaseflowError::DuplicatePhase { .. }
                | PhaseflowError::DuplicatePriority { .. }
                | PhaseflowError::PriorityOverflow { .. }
                | PhaseflowError::UnknownPhase { .. }
                | PhaseflowError::UnknownFaultPhase { .. }
                | PhaseflowError::InvalidDefinition(_)
        )
    }

    /// Returns `true` when an operation was invalid for the chain's current state.
    /// A state error never affects the run in progress.
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            PhaseflowError::InvalidState { .. }
                | PhaseflowError::WalkInProgress { .. }
                | PhaseflowError::UnknownInterceptor { .. }
        )
    }
}

/// A convenience alias for `Result<T, PhaseflowError>`.
pub type Result<T> = std::result::Result<T, PhaseflowError>;

// ---------------------------------------------------------------------------
// ChainState: execution state of an interceptor chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    Executing,
    Paused,
    Complete,
    Aborted,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainState::Executing => "EXECUTING",
            ChainState::Paused => "PAUSED",
            ChainState::Complete => "COMPLETE",
            ChainState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// FaultMode: classification of a fault's origin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    /// An unexpected failure inside the framework or an interceptor.
    #[default]
    RuntimeFault,
    /// A runtime failure raised by protocol-level logic (e.g. a malformed header).
    LogicalRuntimeFault,
    /// An expected, declared business fault.
    CheckedApplicationFault,
    /// An undeclared failure raised by application code.
    UncheckedApplicationFault,
}

impl FaultMode {
    /// Checked application faults are part of normal service behaviour and
    /// are logged quietly.
    pub fn is_expected(&self) -> bool {
        matches!(self, FaultMode::CheckedApplicationFault)
    }
}

// ---------------------------------------------------------------------------
// ProcessingError / StepError: interceptor failure signals
// ---------------------------------------------------------------------------

/// Failure raised by an interceptor's forward logic.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProcessingError {
    message: String,
    mode: Option<FaultMode>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: None,
            source: None,
        }
    }

    /// Classify the failure. Unclassified errors are treated as
    /// [`FaultMode::RuntimeFault`].
    pub fn with_mode(mut self, mode: FaultMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn mode(&self) -> Option<FaultMode> {
        self.mode
    }
}

/// What [`Interceptor::process`] returns instead of `Ok(())`.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Fault(#[from] ProcessingError),

    /// The interceptor handed its thread back to the caller. The chain pauses
    /// after this interceptor and continues with the next one on resume.
    #[error("interceptor suspended the chain")]
    Suspended,
}

impl StepError {
    pub fn fault(message: impl Into<String>) -> Self {
        StepError::Fault(ProcessingError::new(message))
    }
}

// ---------------------------------------------------------------------------
// Fault: failure record written onto the message
// ---------------------------------------------------------------------------

/// What went wrong, where, and why. Stored on the [`Message`] so fault
/// handlers downstream can inspect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// The interceptor whose `process` failed. `None` when the chain was aborted externally.
    pub interceptor_id: Option<String>,
    pub phase: Option<String>,
    /// Plan position of the failing interceptor.
    pub position: Option<usize>,
    pub message: String,
    /// Rendered `source()` chain, outermost first.
    pub causes: Vec<String>,
    pub mode: FaultMode,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

impl Fault {
    /// Build a fault from an interceptor failure.
    pub fn from_error(
        error: &ProcessingError,
        interceptor_id: &str,
        phase: &str,
        position: usize,
    ) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            interceptor_id: Some(interceptor_id.to_string()),
            phase: Some(phase.to_string()),
            position: Some(position),
            message: error.message().to_string(),
            causes,
            mode: error.mode().unwrap_or_default(),
            occurred_at: chrono::Utc::now(),
        }
    }

    /// Fault recorded when a chain is aborted from outside any interceptor.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            interceptor_id: None,
            phase: None,
            position: None,
            message: reason.into(),
            causes: Vec::new(),
            mode: FaultMode::RuntimeFault,
            occurred_at: chrono::Utc::now(),
        }
    }

    pub fn is_external_abort(&self) -> bool {
        self.interceptor_id.is_none()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.interceptor_id, self.position) {
            (Some(id), Some(position)) => {
                write!(f, "interceptor '{id}' at position {position}: {}", self.message)?
            }
            (Some(id), None) => write!(f, "interceptor '{id}': {}", self.message)?,
            _ => write!(f, "chain aborted: {}", self.message)?,
        }
        for cause in &self.causes {
            write!(f, "; caused by: {cause}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OrderingSet: before/after constraint ids
// ---------------------------------------------------------------------------

/// Set of interceptor ids used for before/after constraints.
///
/// Iteration is sorted so plans derived from it are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderingSet(BTreeSet<String>);

impl OrderingSet {
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.0.insert(id.into())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for OrderingSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> Extend<S> for OrderingSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("socket closed")]
    struct SocketClosed;

    #[test]
    fn error_display_duplicate_phase() {
        let err = PhaseflowError::DuplicatePhase {
            name: "receive".into(),
        };
        assert_eq!(err.to_string(), "Phase 'receive' is already registered");
    }

    #[test]
    fn error_display_unknown_phase() {
        let err = PhaseflowError::UnknownPhase {
            interceptor: "soap-header".into(),
            phase: "reed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Interceptor 'soap-header' references unknown phase 'reed'"
        );
    }

    #[test]
    fn error_display_invalid_state() {
        let err = PhaseflowError::InvalidState {
            operation: "resume",
            state: ChainState::Complete,
        };
        assert_eq!(err.to_string(), "Cannot resume a chain in state COMPLETE");
    }

    #[test]
    fn configuration_and_state_classification() {
        assert!(PhaseflowError::DuplicatePhase { name: "x".into() }.is_configuration());
        assert!(PhaseflowError::UnknownFaultPhase { phase: "x".into() }.is_configuration());
        assert!(PhaseflowError::PriorityOverflow { name: "x".into() }.is_configuration());
        assert!(!PhaseflowError::Other("x".into()).is_configuration());

        let state = PhaseflowError::InvalidState {
            operation: "pause",
            state: ChainState::Aborted,
        };
        assert!(state.is_state());
        assert!(!state.is_configuration());
        assert!(PhaseflowError::WalkInProgress { operation: "reset" }.is_state());
    }

    #[test]
    fn fault_from_error_captures_cause_chain() {
        let err = ProcessingError::new("could not read body")
            .with_mode(FaultMode::LogicalRuntimeFault)
            .with_source(SocketClosed);
        let fault = Fault::from_error(&err, "stream-reader", "read", 3);

        assert_eq!(fault.interceptor_id.as_deref(), Some("stream-reader"));
        assert_eq!(fault.phase.as_deref(), Some("read"));
        assert_eq!(fault.position, Some(3));
        assert_eq!(fault.causes, vec!["socket closed".to_string()]);
        assert_eq!(fault.mode, FaultMode::LogicalRuntimeFault);
        assert!(!fault.is_external_abort());
        assert_eq!(
            fault.to_string(),
            "interceptor 'stream-reader' at position 3: could not read body; caused by: socket closed"
        );
    }

    #[test]
    fn unclassified_error_defaults_to_runtime_fault() {
        let fault = Fault::from_error(&ProcessingError::new("boom"), "a", "p", 0);
        assert_eq!(fault.mode, FaultMode::RuntimeFault);
        assert!(fault.causes.is_empty());
    }

    #[test]
    fn aborted_fault_has_no_interceptor() {
        let fault = Fault::aborted("timed out");
        assert!(fault.is_external_abort());
        assert_eq!(fault.to_string(), "chain aborted: timed out");
    }

    #[test]
    fn fault_mode_serializes_snake_case() {
        let json = serde_json::to_string(&FaultMode::CheckedApplicationFault).unwrap();
        assert_eq!(json, "\"checked_application_fault\"");
        assert!(FaultMode::CheckedApplicationFault.is_expected());
        assert!(!FaultMode::RuntimeFault.is_expected());
    }

    #[test]
    fn ordering_set_membership_and_sorted_iteration() {
        let mut set: OrderingSet = ["zeta", "alpha"].into_iter().collect();
        assert!(set.insert("mid"));
        assert!(!set.insert("alpha"));
        assert!(set.contains("zeta"));
        assert!(!set.contains("omega"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["alpha", "mid", "zeta"]);
        assert!(set.remove("mid"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn ordering_set_is_a_plain_json_array() {
        let set: OrderingSet = ["b", "a"].into_iter().collect();
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn step_error_from_processing_error() {
        let err: StepError = ProcessingError::new("bad").into();
        assert!(matches!(err, StepError::Fault(_)));
        assert_eq!(err.to_string(), "bad");
    }
}
