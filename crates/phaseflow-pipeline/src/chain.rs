//! The phase interceptor chain: its plan, its cursor and the execution state machine.
//!
//! A [`PhaseChain`] is shared as `Arc<PhaseChain>`. Its state sits behind a
//! mutex that is never held while an interceptor runs, so interceptors may
//! call back into the chain: add interceptors, pause, abort, or re-enter
//! [`run`](PhaseChain::run) to delegate to the rest of the chain.
//!
//! The cursor is a plain index into the plan. Mid-run insertions only rebuild
//! the part of the plan at or after the cursor, so the cursor stays valid and
//! nested walks advance the same cursor instead of revisiting positions.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use phaseflow_types::{
    ChainState, Fault, FaultSink, Interceptor, InterceptorChain, Message, PhaseflowError,
    ProcessingError, Result, StepError,
};

use crate::fault;
use crate::ordering::{self, Entry, OrderingConflict};
use crate::phase::PhaseRegistry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

pub struct PhaseChain {
    id: Uuid,
    registry: Arc<PhaseRegistry>,
    fault_sink: Option<Arc<dyn FaultSink>>,
    inner: Mutex<ChainInner>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ChainInner {
    /// Everything added, in insertion order.
    registered: Vec<Entry>,
    next_seq: u64,
    plan: Vec<Entry>,
    /// `plan` no longer reflects `registered`; recompute before the next pass.
    stale: bool,
    conflicts: Vec<OrderingConflict>,
    cursor: usize,
    state: ChainState,
    /// Plan positions whose `process` was invoked this pass, in call order.
    invoked: Vec<usize>,
    /// Walk loops currently on the stack. Re-entrant runs nest.
    depth: usize,
    /// A pass has begun since construction or the last reset.
    started: bool,
    /// `abort` was called during a walk; the walk still owes the fault protocol.
    abort_requested: bool,
    /// The fault protocol already ran this pass.
    faulted: bool,
}

enum WalkExit {
    Settled,
    Failed(Fault),
    AbortRequested,
}

impl ChainInner {
    fn new() -> Self {
        Self {
            registered: Vec::new(),
            next_seq: 0,
            plan: Vec::new(),
            stale: true,
            conflicts: Vec::new(),
            cursor: 0,
            state: ChainState::Executing,
            invoked: Vec::new(),
            depth: 0,
            started: false,
            abort_requested: false,
            faulted: false,
        }
    }

    /// A pass is underway: positions before the cursor are settled history.
    fn in_flight(&self) -> bool {
        self.started && (self.depth > 0 || self.state == ChainState::Paused)
    }

    fn begin_pass(&mut self) {
        self.cursor = 0;
        self.invoked.clear();
        self.state = ChainState::Executing;
        self.started = true;
        self.abort_requested = false;
        self.faulted = false;
    }

    /// Claim the next interceptor, or settle the state when there is none.
    fn advance(&mut self) -> Option<(usize, Arc<dyn Interceptor>)> {
        if self.state != ChainState::Executing {
            return None;
        }
        let Some(entry) = self.plan.get(self.cursor) else {
            self.state = ChainState::Complete;
            return None;
        };
        let interceptor = entry.interceptor.clone();
        let position = self.cursor;
        self.cursor += 1;
        self.invoked.push(position);
        Some((position, interceptor))
    }

    fn settle(&mut self) -> WalkExit {
        if std::mem::take(&mut self.abort_requested) {
            WalkExit::AbortRequested
        } else {
            WalkExit::Settled
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseChain
// ---------------------------------------------------------------------------

impl PhaseChain {
    /// Create an empty chain ordered by `registry`. The chain starts in
    /// [`ChainState::Executing`].
    pub fn new(registry: Arc<PhaseRegistry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            fault_sink: None,
            inner: Mutex::new(ChainInner::new()),
        }
    }

    /// Route faults to `sink` when no fault-phase interceptor was reached.
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = Some(sink);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &Arc<PhaseRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ChainState {
        self.inner.lock().state
    }

    /// Position of the next interceptor to run.
    pub fn cursor(&self) -> usize {
        self.inner.lock().cursor
    }

    // --- registration ---

    /// Add an interceptor unless one with the same id is already registered.
    ///
    /// Fails immediately if the interceptor's phase is not in the registry.
    /// During a pass the interceptor is merged into the part of the plan not
    /// yet visited; if its phase has already passed it waits for the next pass.
    pub fn add(&self, interceptor: Arc<dyn Interceptor>) -> Result<bool> {
        self.insert(interceptor, false)
    }

    /// Add an interceptor even if its id is already registered.
    pub fn add_forced(&self, interceptor: Arc<dyn Interceptor>) -> Result<bool> {
        self.insert(interceptor, true)
    }

    /// Add several interceptors, stopping at the first configuration error.
    /// Returns how many were actually added.
    pub fn add_all<I>(&self, interceptors: I) -> Result<usize>
    where
        I: IntoIterator<Item = Arc<dyn Interceptor>>,
    {
        let mut added = 0;
        for interceptor in interceptors {
            if self.add(interceptor)? {
                added += 1;
            }
        }
        Ok(added)
    }

    fn insert(&self, interceptor: Arc<dyn Interceptor>, force: bool) -> Result<bool> {
        if !self.registry.contains(interceptor.phase()) {
            return Err(PhaseflowError::UnknownPhase {
                interceptor: interceptor.id().to_string(),
                phase: interceptor.phase().to_string(),
            });
        }

        let mut inner = self.inner.lock();
        if !force && inner.registered.iter().any(|e| e.id() == interceptor.id()) {
            tracing::debug!(
                chain = %self.id,
                step = interceptor.id(),
                "Interceptor id already present; not adding"
            );
            return Ok(false);
        }

        let entry = Entry {
            seq: inner.next_seq,
            interceptor,
        };
        inner.next_seq += 1;
        inner.registered.push(entry.clone());
        inner.stale = true;
        if inner.in_flight() {
            self.merge_into_remaining(&mut inner, entry);
        }
        Ok(true)
    }

    fn merge_into_remaining(&self, inner: &mut ChainInner, entry: Entry) {
        let last_visited = inner
            .cursor
            .checked_sub(1)
            .and_then(|p| inner.plan.get(p))
            .and_then(|e| self.registry.priority(e.phase()));
        if let (Some(floor), Some(priority)) = (last_visited, self.registry.priority(entry.phase())) {
            if priority < floor {
                tracing::debug!(
                    chain = %self.id,
                    step = entry.id(),
                    phase = entry.phase(),
                    "Phase already passed; interceptor joins the next pass"
                );
                return;
            }
        }

        let at = inner.cursor.min(inner.plan.len());
        let mut remaining = inner.plan.split_off(at);
        tracing::trace!(chain = %self.id, step = entry.id(), at, "Merging interceptor into remaining plan");
        remaining.push(entry);
        let (ordered, conflicts) = ordering::order(remaining, &self.registry);
        let fresh: Vec<OrderingConflict> = conflicts
            .into_iter()
            .filter(|c| !inner.conflicts.iter().any(|known| known.phase == c.phase))
            .collect();
        self.note_conflicts(&fresh);
        inner.conflicts.extend(fresh);
        inner.plan.extend(ordered);
    }

    /// Remove every interceptor with this id. Positions already visited in
    /// the current pass are left alone.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.registered.len();
        inner.registered.retain(|e| e.id() != id);
        if inner.registered.len() == before {
            return false;
        }
        inner.stale = true;
        if inner.in_flight() {
            let at = inner.cursor.min(inner.plan.len());
            let remaining = inner.plan.split_off(at);
            inner.plan.extend(remaining.into_iter().filter(|e| e.id() != id));
        }
        true
    }

    // --- plan ---

    fn refresh_plan(&self, inner: &mut ChainInner) {
        if !inner.stale {
            return;
        }
        let (plan, conflicts) = ordering::order(inner.registered.clone(), &self.registry);
        self.note_conflicts(&conflicts);
        inner.plan = plan;
        inner.conflicts = conflicts;
        inner.stale = false;
        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut flow = String::new();
            let _ = write_plan(&mut flow, self.id, &inner.plan);
            tracing::debug!(chain = %self.id, plan = %flow, "Plan computed");
        }
    }

    fn note_conflicts(&self, conflicts: &[OrderingConflict]) {
        for conflict in conflicts {
            tracing::warn!(
                chain = %self.id,
                phase = %conflict.phase,
                interceptors = ?conflict.interceptors,
                "Requested interceptor ordering is infeasible; falling back to insertion order"
            );
        }
    }

    /// The current plan, computing it first if nothing is in flight.
    pub fn plan(&self) -> Vec<Arc<dyn Interceptor>> {
        let mut inner = self.inner.lock();
        if !inner.in_flight() {
            self.refresh_plan(&mut inner);
        }
        inner.plan.iter().map(|e| e.interceptor.clone()).collect()
    }

    /// Interceptor ids of the current plan, in execution order.
    pub fn plan_ids(&self) -> Vec<String> {
        self.plan().iter().map(|i| i.id().to_string()).collect()
    }

    /// Ordering constraints that could not be honoured in the current plan.
    pub fn ordering_conflicts(&self) -> Vec<OrderingConflict> {
        let mut inner = self.inner.lock();
        if !inner.in_flight() {
            self.refresh_plan(&mut inner);
        }
        inner.conflicts.clone()
    }

    /// Human-readable plan, grouped by phase.
    pub fn describe(&self) -> String {
        self.to_string()
    }

    // --- execution ---

    /// Walk the chain from the beginning.
    ///
    /// Called from inside one of this chain's interceptors, continues the
    /// walk in progress at the shared cursor instead; each later interceptor
    /// still runs exactly once.
    ///
    /// Interceptor failures never surface here: they run the fault protocol
    /// and the returned state is [`ChainState::Aborted`].
    pub fn run(&self, message: &mut Message) -> Result<ChainState> {
        {
            let mut inner = self.inner.lock();
            if inner.depth == 0 {
                self.refresh_plan(&mut inner);
                inner.begin_pass();
                tracing::debug!(
                    chain = %self.id,
                    message_id = %message.id(),
                    steps = inner.plan.len(),
                    "Starting pass"
                );
            } else if inner.state != ChainState::Executing {
                return Ok(inner.state);
            }
        }
        Ok(self.walk(message))
    }

    /// Walk the chain starting with the interceptor after `id`.
    pub fn run_starting_after(&self, message: &mut Message, id: &str) -> Result<ChainState> {
        self.run_from(message, id, true)
    }

    /// Walk the chain starting with the interceptor `id` itself.
    pub fn run_starting_at(&self, message: &mut Message, id: &str) -> Result<ChainState> {
        self.run_from(message, id, false)
    }

    fn run_from(&self, message: &mut Message, id: &str, skip_target: bool) -> Result<ChainState> {
        {
            let mut inner = self.inner.lock();
            let reentrant = inner.depth > 0;
            if reentrant && inner.state != ChainState::Executing {
                return Ok(inner.state);
            }
            if !reentrant {
                self.refresh_plan(&mut inner);
            }
            let from = if reentrant { inner.cursor } else { 0 };
            let index = inner
                .plan
                .iter()
                .enumerate()
                .skip(from)
                .find(|(_, e)| e.id() == id)
                .map(|(i, _)| i)
                .ok_or_else(|| PhaseflowError::UnknownInterceptor { id: id.to_string() })?;
            if !reentrant {
                inner.begin_pass();
            }
            inner.cursor = if skip_target { index + 1 } else { index };
            tracing::debug!(
                chain = %self.id,
                message_id = %message.id(),
                start = inner.cursor,
                anchor = id,
                "Starting pass part-way through the plan"
            );
        }
        Ok(self.walk(message))
    }

    /// Stop after the interceptor currently running. Only valid while executing.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChainState::Executing => {
                inner.state = ChainState::Paused;
                tracing::debug!(chain = %self.id, position = inner.cursor, "Chain paused");
                Ok(())
            }
            state => Err(PhaseflowError::InvalidState {
                operation: "pause",
                state,
            }),
        }
    }

    /// Continue a paused chain at the retained cursor. The interceptor that
    /// paused is not invoked again. May be called from any thread.
    pub fn resume(&self, message: &mut Message) -> Result<ChainState> {
        {
            let mut inner = self.inner.lock();
            if inner.state != ChainState::Paused {
                return Err(PhaseflowError::InvalidState {
                    operation: "resume",
                    state: inner.state,
                });
            }
            inner.state = ChainState::Executing;
            if inner.depth > 0 {
                // The walk that paused has not unwound yet; it simply carries on.
                return Ok(ChainState::Executing);
            }
            if !inner.started {
                self.refresh_plan(&mut inner);
                inner.begin_pass();
            }
            tracing::debug!(chain = %self.id, position = inner.cursor, "Chain resumed");
        }
        Ok(self.walk(message))
    }

    /// Abort the chain and run the fault protocol.
    ///
    /// Called while a walk is in progress (typically by an interceptor), the
    /// protocol runs as soon as the current interceptor returns. Called on a
    /// paused chain, it runs here, on the calling thread.
    pub fn abort(&self, message: &mut Message) -> Result<ChainState> {
        let walking = {
            let mut inner = self.inner.lock();
            match inner.state {
                ChainState::Executing | ChainState::Paused => {}
                state => {
                    return Err(PhaseflowError::InvalidState {
                        operation: "abort",
                        state,
                    })
                }
            }
            inner.state = ChainState::Aborted;
            inner.abort_requested = inner.depth > 0;
            inner.depth > 0
        };
        if message.fault().is_none() {
            message.set_fault(Fault::aborted("chain aborted"));
        }
        if !walking {
            let fault = recorded_or_aborted(message);
            self.fail(message, fault);
        }
        Ok(ChainState::Aborted)
    }

    /// Forget the current pass so the next `run` starts from scratch with a
    /// freshly computed plan.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.depth > 0 {
            return Err(PhaseflowError::WalkInProgress { operation: "reset" });
        }
        inner.cursor = 0;
        inner.invoked.clear();
        inner.state = ChainState::Executing;
        inner.started = false;
        inner.abort_requested = false;
        inner.faulted = false;
        inner.stale = true;
        Ok(())
    }

    fn walk(&self, message: &mut Message) -> ChainState {
        self.inner.lock().depth += 1;

        let (exit, depth) = loop {
            let next = {
                let mut inner = self.inner.lock();
                match inner.advance() {
                    Some(next) => next,
                    None => {
                        inner.depth -= 1;
                        break (inner.settle(), inner.depth);
                    }
                }
            };
            let (position, interceptor) = next;
            tracing::trace!(
                chain = %self.id,
                step = interceptor.id(),
                phase = interceptor.phase(),
                position,
                "Invoking interceptor"
            );

            match invoke(interceptor.as_ref(), message) {
                Ok(()) => {}
                Err(StepError::Suspended) => {
                    let mut inner = self.inner.lock();
                    if inner.state == ChainState::Executing {
                        inner.state = ChainState::Paused;
                    }
                    tracing::debug!(
                        chain = %self.id,
                        step = interceptor.id(),
                        position,
                        "Interceptor suspended the chain"
                    );
                }
                Err(StepError::Fault(error)) => {
                    let fault =
                        Fault::from_error(&error, interceptor.id(), interceptor.phase(), position);
                    let mut inner = self.inner.lock();
                    inner.state = ChainState::Aborted;
                    inner.depth -= 1;
                    break (WalkExit::Failed(fault), inner.depth);
                }
            }
        };

        match exit {
            WalkExit::Settled => {}
            WalkExit::Failed(fault) => self.fail(message, fault),
            WalkExit::AbortRequested => {
                let fault = recorded_or_aborted(message);
                self.fail(message, fault);
            }
        }

        let state = self.state();
        if depth == 0 {
            tracing::debug!(chain = %self.id, message_id = %message.id(), %state, "Walk returned");
        }
        state
    }

    /// The fault protocol: record, unwind in reverse, then fall back to the
    /// sink unless a fault-phase interceptor was reached this pass. Runs at
    /// most once per pass.
    fn fail(&self, message: &mut Message, fault: Fault) {
        let (executed, handled_in_chain) = {
            let mut inner = self.inner.lock();
            if inner.faulted {
                tracing::debug!(chain = %self.id, "Fault protocol already ran for this pass");
                return;
            }
            inner.faulted = true;
            inner.abort_requested = false;
            inner.state = ChainState::Aborted;

            let executed: Vec<Arc<dyn Interceptor>> = inner
                .invoked
                .iter()
                .rev()
                .filter_map(|&p| inner.plan.get(p))
                .map(|e| e.interceptor.clone())
                .collect();
            let handled_in_chain = self.registry.fault_phase().is_some_and(|phase| {
                inner
                    .invoked
                    .iter()
                    .filter_map(|&p| inner.plan.get(p))
                    .any(|e| e.phase() == phase)
            });
            (executed, handled_in_chain)
        };

        message.set_fault(fault.clone());
        fault::report(self.id, &fault, message);
        fault::unwind(self.id, &executed, message);
        if !handled_in_chain {
            fault::deliver_unhandled(self.id, self.fault_sink.as_ref(), message, &fault);
        }
    }
}

fn recorded_or_aborted(message: &Message) -> Fault {
    message
        .fault()
        .cloned()
        .unwrap_or_else(|| Fault::aborted("chain aborted"))
}

/// Run `process`, turning a panic into a runtime fault.
fn invoke(interceptor: &dyn Interceptor, message: &mut Message) -> std::result::Result<(), StepError> {
    panic::catch_unwind(AssertUnwindSafe(|| interceptor.process(message))).unwrap_or_else(|payload| {
        Err(StepError::Fault(ProcessingError::new(format!(
            "interceptor panicked: {}",
            fault::panic_message(payload.as_ref())
        ))))
    })
}

fn write_plan(out: &mut impl fmt::Write, chain_id: Uuid, plan: &[Entry]) -> fmt::Result {
    write!(out, "Chain {chain_id}. Current flow:")?;
    let mut current: Option<&str> = None;
    for entry in plan {
        if current == Some(entry.phase()) {
            write!(out, ", {}", entry.id())?;
        } else {
            if current.is_some() {
                out.write_char(']')?;
            }
            write!(out, "\n  {} [{}", entry.phase(), entry.id())?;
            current = Some(entry.phase());
        }
    }
    if current.is_some() {
        out.write_char(']')?;
    }
    Ok(())
}

impl fmt::Display for PhaseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write_plan(f, self.id, &inner.plan)
    }
}

impl fmt::Debug for PhaseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PhaseChain")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("cursor", &inner.cursor)
            .field("planned", &inner.plan.len())
            .field("registered", &inner.registered.len())
            .finish()
    }
}

impl InterceptorChain for PhaseChain {
    fn add(&self, interceptor: Arc<dyn Interceptor>) -> Result<bool> {
        PhaseChain::add(self, interceptor)
    }

    fn add_forced(&self, interceptor: Arc<dyn Interceptor>) -> Result<bool> {
        PhaseChain::add_forced(self, interceptor)
    }

    fn remove(&self, id: &str) -> bool {
        PhaseChain::remove(self, id)
    }

    fn run(&self, message: &mut Message) -> Result<ChainState> {
        PhaseChain::run(self, message)
    }

    fn run_starting_after(&self, message: &mut Message, id: &str) -> Result<ChainState> {
        PhaseChain::run_starting_after(self, message, id)
    }

    fn run_starting_at(&self, message: &mut Message, id: &str) -> Result<ChainState> {
        PhaseChain::run_starting_at(self, message, id)
    }

    fn pause(&self) -> Result<()> {
        PhaseChain::pause(self)
    }

    fn resume(&self, message: &mut Message) -> Result<ChainState> {
        PhaseChain::resume(self, message)
    }

    fn abort(&self, message: &mut Message) -> Result<ChainState> {
        PhaseChain::abort(self, message)
    }

    fn reset(&self) -> Result<()> {
        PhaseChain::reset(self)
    }

    fn state(&self) -> ChainState {
        PhaseChain::state(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::step::{FnInterceptor, PhaseStep};

    fn registry() -> Arc<PhaseRegistry> {
        let mut registry = PhaseRegistry::new();
        registry.register("phase1", 1).unwrap();
        registry.register("phase2", 2).unwrap();
        registry.register("phase3", 3).unwrap();
        Arc::new(registry)
    }

    fn noop(id: &str, phase: &str) -> Arc<dyn Interceptor> {
        Arc::new(FnInterceptor::noop(PhaseStep::new(id, phase)))
    }

    fn counting(id: &str, phase: &str, hits: &Arc<AtomicUsize>) -> Arc<dyn Interceptor> {
        let hits = hits.clone();
        Arc::new(FnInterceptor::new(PhaseStep::new(id, phase), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    // Test 1: state machine walk-through on a fresh chain
    #[test]
    fn state_transitions() {
        let chain = PhaseChain::new(registry());
        let hits = Arc::new(AtomicUsize::new(0));
        chain.add(counting("p1", "phase1", &hits)).unwrap();
        let mut msg = Message::new();

        assert_eq!(chain.state(), ChainState::Executing);
        chain.pause().unwrap();
        assert_eq!(chain.state(), ChainState::Paused);
        assert_eq!(chain.resume(&mut msg).unwrap(), ChainState::Complete);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let err = chain.abort(&mut msg).unwrap_err();
        assert!(err.is_state());
        assert_eq!(chain.state(), ChainState::Complete);
    }

    // Test 2: every control operation is rejected on a completed chain
    #[test]
    fn complete_chain_rejects_control_operations() {
        let chain = PhaseChain::new(registry());
        let mut msg = Message::new();
        assert_eq!(chain.run(&mut msg).unwrap(), ChainState::Complete);

        for err in [
            chain.pause().unwrap_err(),
            chain.resume(&mut msg).unwrap_err(),
            chain.abort(&mut msg).unwrap_err(),
        ] {
            match err {
                PhaseflowError::InvalidState { state, .. } => {
                    assert_eq!(state, ChainState::Complete)
                }
                other => panic!("Expected InvalidState, got: {other:?}"),
            }
        }
        assert!(msg.fault().is_none());
    }

    // Test 3: unknown phase rejected at insert time
    #[test]
    fn unknown_phase_is_rejected_on_add() {
        let chain = PhaseChain::new(registry());
        let err = chain.add(noop("x", "phase9")).unwrap_err();
        assert!(err.is_configuration());
        assert!(chain.plan_ids().is_empty());
    }

    // Test 4: same instance twice, unforced then forced
    #[test]
    fn force_add_same_interceptor() {
        let chain = PhaseChain::new(registry());
        let p = noop("p1", "phase1");
        assert!(chain.add(p.clone()).unwrap());
        assert!(!chain.add(p.clone()).unwrap());
        assert_eq!(chain.plan().len(), 1);

        assert!(chain.add_forced(p.clone()).unwrap());
        let plan = chain.plan();
        assert_eq!(plan.len(), 2);
        assert!(Arc::ptr_eq(&plan[0], &p));
        assert!(Arc::ptr_eq(&plan[1], &p));
    }

    // Test 5: distinct instances with the same id keep insertion order when forced
    #[test]
    fn force_add_same_id_different_instances() {
        let chain = PhaseChain::new(registry());
        let p1 = noop("p1", "phase1");
        let p2 = noop("p1", "phase1");
        chain.add(p1.clone()).unwrap();
        chain.add(p2.clone()).unwrap();
        let plan = chain.plan();
        assert_eq!(plan.len(), 1);
        assert!(Arc::ptr_eq(&plan[0], &p1));

        chain.add_forced(p2.clone()).unwrap();
        let plan = chain.plan();
        assert!(Arc::ptr_eq(&plan[0], &p1));
        assert!(Arc::ptr_eq(&plan[1], &p2));
    }

    // Test 6: add_all counts only what was added
    #[test]
    fn add_all_skips_duplicates() {
        let chain = PhaseChain::new(registry());
        let added = chain
            .add_all(vec![noop("a", "phase1"), noop("b", "phase2"), noop("a", "phase3")])
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(chain.plan_ids(), vec!["a", "b"]);
    }

    // Test 7: plan rendering groups by phase
    #[test]
    fn describe_groups_by_phase() {
        let chain = PhaseChain::new(registry());
        chain.add(noop("c", "phase2")).unwrap();
        chain.add(noop("a", "phase1")).unwrap();
        chain.add(noop("b", "phase1")).unwrap();
        chain.plan();

        let text = chain.describe();
        assert!(text.starts_with(&format!("Chain {}. Current flow:", chain.id())));
        assert!(text.contains("\n  phase1 [a, b]"));
        assert!(text.ends_with("\n  phase2 [c]"));
    }

    // Test 8: a second run re-walks from the start
    #[test]
    fn repeated_runs_start_over() {
        let chain = PhaseChain::new(registry());
        let hits = Arc::new(AtomicUsize::new(0));
        chain.add(counting("a", "phase1", &hits)).unwrap();
        chain.add(counting("b", "phase2", &hits)).unwrap();
        let mut msg = Message::new();

        assert_eq!(chain.run(&mut msg).unwrap(), ChainState::Complete);
        assert_eq!(chain.run(&mut msg).unwrap(), ChainState::Complete);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(chain.cursor(), 2);
    }

    // Test 9: reset after abort allows a clean pass
    #[test]
    fn reset_clears_aborted_state() {
        let chain = PhaseChain::new(registry());
        chain
            .add(Arc::new(FnInterceptor::new(PhaseStep::new("bad", "phase1"), |_| {
                Err(StepError::fault("nope"))
            })))
            .unwrap();
        let mut msg = Message::new();
        assert_eq!(chain.run(&mut msg).unwrap(), ChainState::Aborted);

        chain.reset().unwrap();
        assert_eq!(chain.state(), ChainState::Executing);
        assert_eq!(chain.cursor(), 0);
        assert!(chain.remove("bad"));
        assert_eq!(chain.run(&mut Message::new()).unwrap(), ChainState::Complete);
    }

    // Test 10: reset is refused from inside a walk
    #[test]
    fn reset_inside_walk_is_refused() {
        let chain = Arc::new(PhaseChain::new(registry()));
        let seen = Arc::new(Mutex::new(None));
        let handle = chain.clone();
        let slot = seen.clone();
        chain
            .add(Arc::new(FnInterceptor::new(PhaseStep::new("r", "phase1"), move |_| {
                *slot.lock() = Some(handle.reset().is_err());
                Ok(())
            })))
            .unwrap();
        chain.run(&mut Message::new()).unwrap();
        assert_eq!(*seen.lock(), Some(true));
    }

    // Test 11: unknown starting point
    #[test]
    fn unknown_starting_point_is_an_error() {
        let chain = PhaseChain::new(registry());
        chain.add(noop("a", "phase1")).unwrap();
        let err = chain.run_starting_after(&mut Message::new(), "zzz").unwrap_err();
        assert!(matches!(err, PhaseflowError::UnknownInterceptor { id } if id == "zzz"));
    }

    // Test 12: panics inside process become faults
    #[test]
    fn panic_in_process_aborts_the_chain() {
        let chain = PhaseChain::new(registry());
        chain
            .add(Arc::new(FnInterceptor::new(PhaseStep::new("boom", "phase1"), |_| {
                panic!("unexpected")
            })))
            .unwrap();
        let mut msg = Message::new();
        assert_eq!(chain.run(&mut msg).unwrap(), ChainState::Aborted);
        let fault = msg.fault().unwrap();
        assert_eq!(fault.interceptor_id.as_deref(), Some("boom"));
        assert!(fault.message.contains("unexpected"));
    }

    // Test 13: a cycle left in the unvisited suffix is recorded once across mid-run inserts
    #[test]
    fn mid_run_inserts_do_not_repeat_conflicts() {
        let chain = Arc::new(PhaseChain::new(registry()));
        chain
            .add(Arc::new(FnInterceptor::noop(PhaseStep::new("x", "phase3").before("y"))))
            .unwrap();
        chain
            .add(Arc::new(FnInterceptor::noop(PhaseStep::new("y", "phase3").before("x"))))
            .unwrap();
        assert_eq!(chain.ordering_conflicts().len(), 1);

        let seen = Arc::new(Mutex::new(None));
        let handle = chain.clone();
        let slot = seen.clone();
        chain
            .add(Arc::new(FnInterceptor::new(PhaseStep::new("ins", "phase1"), move |_| {
                handle.add(Arc::new(FnInterceptor::noop(PhaseStep::new("n1", "phase3")))).unwrap();
                handle.add(Arc::new(FnInterceptor::noop(PhaseStep::new("n2", "phase3")))).unwrap();
                *slot.lock() = Some(handle.ordering_conflicts().len());
                Ok(())
            })))
            .unwrap();

        assert_eq!(chain.run(&mut Message::new()).unwrap(), ChainState::Complete);
        assert_eq!(*seen.lock(), Some(1));
        assert_eq!(chain.ordering_conflicts().len(), 1);
    }

    // Test 14: the chain is usable through the trait object
    #[test]
    fn usable_as_dyn_interceptor_chain() {
        let chain: Arc<dyn InterceptorChain> = Arc::new(PhaseChain::new(registry()));
        chain.add(noop("a", "phase1")).unwrap();
        assert_eq!(chain.run(&mut Message::new()).unwrap(), ChainState::Complete);
        assert!(chain.remove("a"));
        assert!(!chain.remove("a"));
    }
}
