//! The seams between the chain engine and the code it drives.

use std::sync::Arc;

use crate::{ChainState, Fault, Message, OrderingSet, ProcessingError, Result, StepError};

static NO_CONSTRAINTS: OrderingSet = OrderingSet::new();

/// A unit of pipeline logic bound to a phase.
///
/// The engine only ever sees `Arc<dyn Interceptor>`; concrete interceptors
/// stay opaque to it.
pub trait Interceptor: Send + Sync {
    /// Identifier used for before/after constraints and duplicate detection.
    fn id(&self) -> &str;

    /// Name of the phase this interceptor belongs to.
    fn phase(&self) -> &str;

    /// Ids that must run after this interceptor (within the same phase).
    fn before(&self) -> &OrderingSet {
        &NO_CONSTRAINTS
    }

    /// Ids that must run before this interceptor (within the same phase).
    fn after(&self) -> &OrderingSet {
        &NO_CONSTRAINTS
    }

    /// Forward processing.
    fn process(&self, message: &mut Message) -> std::result::Result<(), StepError>;

    /// Called in reverse order on every interceptor whose `process` ran when
    /// the chain aborts. May be called more than once; errors are logged by
    /// the engine and never interrupt the unwind.
    fn handle_fault(&self, _message: &mut Message) -> std::result::Result<(), ProcessingError> {
        Ok(())
    }
}

/// Runtime handle to a chain, reachable from inside interceptors through
/// [`Message::chain`].
pub trait InterceptorChain: Send + Sync {
    /// Add an interceptor. Returns `Ok(false)` when an interceptor with the
    /// same id is already present.
    fn add(&self, interceptor: Arc<dyn Interceptor>) -> Result<bool>;

    /// Add an interceptor even if its id is already present.
    fn add_forced(&self, interceptor: Arc<dyn Interceptor>) -> Result<bool>;

    fn remove(&self, id: &str) -> bool;

    /// Walk the chain. Called from inside an interceptor of the same chain,
    /// continues the walk in progress instead of starting over.
    fn run(&self, message: &mut Message) -> Result<ChainState>;

    fn run_starting_after(&self, message: &mut Message, id: &str) -> Result<ChainState>;

    fn run_starting_at(&self, message: &mut Message, id: &str) -> Result<ChainState>;

    fn pause(&self) -> Result<()>;

    fn resume(&self, message: &mut Message) -> Result<ChainState>;

    fn abort(&self, message: &mut Message) -> Result<ChainState>;

    fn reset(&self) -> Result<()>;

    fn state(&self) -> ChainState;
}

/// Fallback consumer for faults no in-chain fault handler took care of.
pub trait FaultSink: Send + Sync {
    fn on_fault(&self, message: &mut Message, fault: &Fault);
}

/// Custom fault logger, looked up in the message's typed property bag as
/// `Arc<dyn FaultListener>`.
pub trait FaultListener: Send + Sync {
    /// Return `true` to also run the engine's default fault logging.
    fn fault_occurred(&self, fault: &Fault, description: &str, message: &Message) -> bool;
}
