//! Building blocks for concrete interceptors.

use std::fmt;

use phaseflow_types::{Interceptor, Message, OrderingSet, ProcessingError, StepError};

/// Identity and ordering metadata shared by every interceptor.
///
/// Concrete interceptors embed a `PhaseStep` and delegate `id`, `phase`,
/// `before` and `after` to it. Constraints should be settled before the
/// interceptor is added to a chain; later changes only affect future plans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseStep {
    id: String,
    phase: String,
    before: OrderingSet,
    after: OrderingSet,
}

impl PhaseStep {
    pub fn new(id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: phase.into(),
            before: OrderingSet::new(),
            after: OrderingSet::new(),
        }
    }

    /// Builder form of [`add_before`](Self::add_before).
    pub fn before(mut self, id: impl Into<String>) -> Self {
        self.before.insert(id);
        self
    }

    /// Builder form of [`add_after`](Self::add_after).
    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after.insert(id);
        self
    }

    /// Require this interceptor to run before `id`.
    pub fn add_before(&mut self, id: impl Into<String>) {
        self.before.insert(id);
    }

    /// Require this interceptor to run after `id`.
    pub fn add_after(&mut self, id: impl Into<String>) {
        self.after.insert(id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn before_set(&self) -> &OrderingSet {
        &self.before
    }

    pub fn after_set(&self) -> &OrderingSet {
        &self.after
    }
}

type ProcessFn = dyn Fn(&mut Message) -> Result<(), StepError> + Send + Sync;
type FaultFn = dyn Fn(&mut Message) -> Result<(), ProcessingError> + Send + Sync;

/// Interceptor backed by closures.
pub struct FnInterceptor {
    step: PhaseStep,
    process: Box<ProcessFn>,
    on_fault: Option<Box<FaultFn>>,
}

impl FnInterceptor {
    pub fn new<F>(step: PhaseStep, process: F) -> Self
    where
        F: Fn(&mut Message) -> Result<(), StepError> + Send + Sync + 'static,
    {
        Self {
            step,
            process: Box::new(process),
            on_fault: None,
        }
    }

    /// An interceptor that does nothing. Useful for planning and validation.
    pub fn noop(step: PhaseStep) -> Self {
        Self::new(step, |_| Ok(()))
    }

    pub fn on_fault<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Message) -> Result<(), ProcessingError> + Send + Sync + 'static,
    {
        self.on_fault = Some(Box::new(handler));
        self
    }

    pub fn step_mut(&mut self) -> &mut PhaseStep {
        &mut self.step
    }
}

impl Interceptor for FnInterceptor {
    fn id(&self) -> &str {
        self.step.id()
    }

    fn phase(&self) -> &str {
        self.step.phase()
    }

    fn before(&self) -> &OrderingSet {
        self.step.before_set()
    }

    fn after(&self) -> &OrderingSet {
        self.step.after_set()
    }

    fn process(&self, message: &mut Message) -> Result<(), StepError> {
        (self.process)(message)
    }

    fn handle_fault(&self, message: &mut Message) -> Result<(), ProcessingError> {
        match &self.on_fault {
            Some(handler) => handler(message),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for FnInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnInterceptor")
            .field("step", &self.step)
            .field("on_fault", &self.on_fault.is_some())
            .finish()
    }
}
