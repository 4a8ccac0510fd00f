//! Scripted execution of a pipeline definition.
//!
//! Every declared step becomes a [`ScriptedInterceptor`] that acts out its
//! [`StepBehavior`]. Suspended chains are resumed on the blocking pool after
//! the requested delay, or aborted when the delay exceeds the deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use phaseflow_pipeline::{PhaseChain, PhaseStep, PipelineDefinition, StepBehavior, StepDefinition};
use phaseflow_types::{
    ChainState, Fault, FaultSink, Interceptor, Message, OrderingSet, ProcessingError, StepError,
};

/// Delay a suspending step asked for before the chain is resumed.
#[derive(Debug, Clone, Copy)]
pub struct ResumeAfter(pub Duration);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Process { step: String },
    Fault { step: String },
    Insert { step: String, target: String, added: bool },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Process { step } => write!(f, "process      {step}"),
            TraceEvent::Fault { step } => write!(f, "handle_fault {step}"),
            TraceEvent::Insert { step, target, added: true } => {
                write!(f, "insert       {target} (by {step})")
            }
            TraceEvent::Insert { step, target, added: false } => {
                write!(f, "insert       {target} (by {step}, already present)")
            }
        }
    }
}

pub type Trace = Arc<Mutex<Vec<TraceEvent>>>;

pub struct ScriptedInterceptor {
    step: PhaseStep,
    definition: StepDefinition,
    pipeline: Arc<PipelineDefinition>,
    trace: Trace,
}

impl ScriptedInterceptor {
    pub fn new(definition: &StepDefinition, pipeline: Arc<PipelineDefinition>, trace: Trace) -> Self {
        Self {
            step: definition.phase_step(),
            definition: definition.clone(),
            pipeline,
            trace,
        }
    }

    fn insert(&self, message: &mut Message, target: &str) -> Result<(), StepError> {
        let declared = self
            .pipeline
            .step(target)
            .ok_or_else(|| StepError::fault(format!("step '{target}' is not declared")))?;
        let chain = message
            .chain()
            .ok_or_else(|| StepError::fault("message is not attached to a chain"))?;
        let interceptor: Arc<dyn Interceptor> = Arc::new(ScriptedInterceptor::new(
            declared,
            self.pipeline.clone(),
            self.trace.clone(),
        ));
        let outcome = if declared.force {
            chain.add_forced(interceptor)
        } else {
            chain.add(interceptor)
        };
        let added = outcome.map_err(|e| ProcessingError::new(e.to_string()))?;

        self.trace.lock().push(TraceEvent::Insert {
            step: self.step.id().to_string(),
            target: target.to_string(),
            added,
        });
        Ok(())
    }
}

impl Interceptor for ScriptedInterceptor {
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
        self.trace.lock().push(TraceEvent::Process {
            step: self.step.id().to_string(),
        });
        match &self.definition.behavior {
            StepBehavior::Pass => Ok(()),
            StepBehavior::Fail { message: reason, mode } => {
                Err(ProcessingError::new(reason.clone()).with_mode(*mode).into())
            }
            StepBehavior::Suspend { resume_after_ms } => {
                message.put(ResumeAfter(Duration::from_millis(*resume_after_ms)));
                Err(StepError::Suspended)
            }
            StepBehavior::Insert { step } => self.insert(message, step),
            StepBehavior::Abort => {
                let chain = message
                    .chain()
                    .ok_or_else(|| StepError::fault("message is not attached to a chain"))?;
                chain
                    .abort(message)
                    .map_err(|e| StepError::fault(e.to_string()))?;
                Ok(())
            }
        }
    }

    fn handle_fault(&self, _message: &mut Message) -> Result<(), ProcessingError> {
        self.trace.lock().push(TraceEvent::Fault {
            step: self.step.id().to_string(),
        });
        if self.definition.fault_handler_fails {
            return Err(ProcessingError::new(format!(
                "fault handler of '{}' failed",
                self.step.id()
            )));
        }
        Ok(())
    }
}

/// Collects the faults that reached the chain's sink.
#[derive(Default)]
pub struct CollectingSink {
    faults: Mutex<Vec<Fault>>,
}

impl FaultSink for CollectingSink {
    fn on_fault(&self, message: &mut Message, fault: &Fault) {
        tracing::info!(message_id = %message.id(), %fault, "Fault delivered to sink");
        self.faults.lock().push(fault.clone());
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub pipeline: String,
    pub state: ChainState,
    pub plan: Vec<String>,
    pub trace: Vec<TraceEvent>,
    pub resumes: usize,
    pub fault: Option<Fault>,
    pub sink_deliveries: Vec<Fault>,
}

/// Build the chain for `definition` and add its initial steps.
pub fn build_chain(
    definition: &Arc<PipelineDefinition>,
    trace: &Trace,
    sink: Arc<dyn FaultSink>,
) -> anyhow::Result<Arc<PhaseChain>> {
    let registry = Arc::new(definition.build_registry()?);
    let chain = Arc::new(PhaseChain::new(registry).with_fault_sink(sink));
    for step in definition.initial_steps() {
        let interceptor: Arc<dyn Interceptor> =
            Arc::new(ScriptedInterceptor::new(step, definition.clone(), trace.clone()));
        let added = if step.force {
            chain.add_forced(interceptor)?
        } else {
            chain.add(interceptor)?
        };
        if !added {
            tracing::warn!(step = %step.id, "Duplicate step id ignored");
        }
    }
    Ok(chain)
}

/// Run the definition to a terminal state.
///
/// A step that suspends for longer than `deadline`, or a chain paused without
/// a resume request, is aborted the way an external timeout would.
pub async fn simulate(
    definition: Arc<PipelineDefinition>,
    deadline: Duration,
) -> anyhow::Result<SimulationReport> {
    let trace: Trace = Arc::default();
    let sink = Arc::new(CollectingSink::default());
    let chain = build_chain(&definition, &trace, sink.clone())?;
    let plan = chain.plan_ids();

    let mut message = Message::new();
    message.set_chain(chain.clone());
    tracing::info!(pipeline = %definition.name, chain = %chain.id(), message_id = %message.id(), "Simulation started");

    let mut state = chain.run(&mut message)?;
    let mut resumes = 0;
    while state == ChainState::Paused {
        match message.remove::<ResumeAfter>() {
            Some(ResumeAfter(delay)) if delay <= deadline => {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "Chain paused; scheduling resume");
                tokio::time::sleep(delay).await;
                let resumer = chain.clone();
                let (resumed, returned) = tokio::task::spawn_blocking(move || {
                    let resumed = resumer.resume(&mut message);
                    (resumed, message)
                })
                .await?;
                message = returned;
                state = resumed?;
                resumes += 1;
            }
            _ => {
                tokio::time::sleep(deadline).await;
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "Resume deadline exceeded; aborting paused chain"
                );
                state = chain.abort(&mut message)?;
            }
        }
    }
    message.clear_chain();

    let sink_deliveries = sink.faults.lock().clone();
    let trace = trace.lock().clone();
    Ok(SimulationReport {
        pipeline: definition.name.clone(),
        state,
        plan,
        trace,
        resumes,
        fault: message.take_fault(),
        sink_deliveries,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(json: &str) -> Arc<PipelineDefinition> {
        Arc::new(PipelineDefinition::from_json(json).unwrap())
    }

    fn processed(report: &SimulationReport) -> Vec<&str> {
        report
            .trace
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Process { step } => Some(step.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn passing_pipeline_completes() {
        let def = definition(
            r#"{"phases": ["a", "b"], "steps": [
                {"id": "second", "phase": "b"},
                {"id": "first", "phase": "a"}
            ]}"#,
        );
        let report = simulate(def, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.state, ChainState::Complete);
        assert_eq!(processed(&report), vec!["first", "second"]);
        assert!(report.fault.is_none());
    }

    #[tokio::test]
    async fn suspension_is_resumed() {
        let def = definition(
            r#"{"phases": ["a"], "steps": [
                {"id": "wait", "phase": "a", "behavior": {"kind": "suspend", "resume_after_ms": 5}},
                {"id": "after", "phase": "a"}
            ]}"#,
        );
        let report = simulate(def, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.state, ChainState::Complete);
        assert_eq!(report.resumes, 1);
        assert_eq!(processed(&report), vec!["wait", "after"]);
    }

    #[tokio::test]
    async fn slow_suspension_is_aborted() {
        let def = definition(
            r#"{"phases": ["a"], "steps": [
                {"id": "wait", "phase": "a", "behavior": {"kind": "suspend", "resume_after_ms": 60000}},
                {"id": "after", "phase": "a"}
            ]}"#,
        );
        let report = simulate(def, Duration::from_millis(10)).await.unwrap();
        assert_eq!(report.state, ChainState::Aborted);
        assert!(report.fault.as_ref().unwrap().is_external_abort());
        assert_eq!(report.sink_deliveries.len(), 1);
        assert_eq!(
            report.trace.last(),
            Some(&TraceEvent::Fault { step: "wait".into() })
        );
    }

    #[tokio::test]
    async fn failure_unwinds_and_reaches_sink() {
        let def = definition(
            r#"{"phases": ["a", "b"], "steps": [
                {"id": "ok", "phase": "a", "fault_handler_fails": true},
                {"id": "bad", "phase": "b", "behavior": {"kind": "fail", "message": "nope"}},
                {"id": "never", "phase": "b"}
            ]}"#,
        );
        let report = simulate(def, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.state, ChainState::Aborted);
        assert_eq!(
            report.trace,
            vec![
                TraceEvent::Process { step: "ok".into() },
                TraceEvent::Process { step: "bad".into() },
                TraceEvent::Fault { step: "bad".into() },
                TraceEvent::Fault { step: "ok".into() },
            ]
        );
        assert_eq!(report.sink_deliveries.len(), 1);
        assert_eq!(report.fault.unwrap().interceptor_id.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn insert_adds_deferred_step() {
        let def = definition(
            r#"{"phases": ["a", "b"], "steps": [
                {"id": "adder", "phase": "a", "behavior": {"kind": "insert", "step": "extra"}},
                {"id": "tail", "phase": "b"},
                {"id": "extra", "phase": "b", "before": ["tail"], "deferred": true}
            ]}"#,
        );
        let report = simulate(def, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.state, ChainState::Complete);
        assert_eq!(report.plan, vec!["adder", "tail"]);
        assert_eq!(processed(&report), vec!["adder", "extra", "tail"]);
    }

    #[tokio::test]
    async fn abort_behaviour_aborts() {
        let def = definition(
            r#"{"phases": ["a"], "steps": [
                {"id": "quit", "phase": "a", "behavior": {"kind": "abort"}},
                {"id": "after", "phase": "a"}
            ]}"#,
        );
        let report = simulate(def, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.state, ChainState::Aborted);
        assert_eq!(processed(&report), vec!["quit"]);
    }
}
