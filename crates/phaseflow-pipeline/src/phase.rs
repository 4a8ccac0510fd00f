//! Phases and the registry that orders them.
//!
//! A [`PhaseRegistry`] is built once at startup, wrapped in an `Arc`, and
//! shared read-only by every chain built from it.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use phaseflow_types::{PhaseflowError, Result};

/// Names of the built-in phases.
pub mod names {
    pub const RECEIVE: &str = "receive";
    pub const PRE_STREAM: &str = "pre-stream";
    pub const USER_STREAM: &str = "user-stream";
    pub const POST_STREAM: &str = "post-stream";
    pub const READ: &str = "read";
    pub const PRE_PROTOCOL: &str = "pre-protocol";
    pub const PRE_PROTOCOL_FRONTEND: &str = "pre-protocol-frontend";
    pub const USER_PROTOCOL: &str = "user-protocol";
    pub const POST_PROTOCOL: &str = "post-protocol";
    pub const UNMARSHAL: &str = "unmarshal";
    pub const PRE_LOGICAL: &str = "pre-logical";
    pub const USER_LOGICAL: &str = "user-logical";
    pub const POST_LOGICAL: &str = "post-logical";
    pub const PRE_INVOKE: &str = "pre-invoke";
    pub const INVOKE: &str = "invoke";
    pub const POST_INVOKE: &str = "post-invoke";

    pub const SETUP: &str = "setup";
    pub const PREPARE_SEND: &str = "prepare-send";
    pub const WRITE: &str = "write";
    pub const PRE_MARSHAL: &str = "pre-marshal";
    pub const MARSHAL: &str = "marshal";
    pub const POST_MARSHAL: &str = "post-marshal";
    pub const SEND: &str = "send";

    pub const SEND_ENDING: &str = "send-ending";
    pub const POST_STREAM_ENDING: &str = "post-stream-ending";
    pub const USER_STREAM_ENDING: &str = "user-stream-ending";
    pub const POST_PROTOCOL_ENDING: &str = "post-protocol-ending";
    pub const USER_PROTOCOL_ENDING: &str = "user-protocol-ending";
    pub const MARSHAL_ENDING: &str = "marshal-ending";
    pub const WRITE_ENDING: &str = "write-ending";
    pub const PRE_PROTOCOL_ENDING: &str = "pre-protocol-ending";
    pub const PRE_STREAM_ENDING: &str = "pre-stream-ending";
    pub const PREPARE_SEND_ENDING: &str = "prepare-send-ending";
    pub const POST_LOGICAL_ENDING: &str = "post-logical-ending";
    pub const USER_LOGICAL_ENDING: &str = "user-logical-ending";
    pub const PRE_LOGICAL_ENDING: &str = "pre-logical-ending";
    pub const SETUP_ENDING: &str = "setup-ending";

    pub const INBOUND: &[&str] = &[
        RECEIVE,
        PRE_STREAM,
        USER_STREAM,
        POST_STREAM,
        READ,
        PRE_PROTOCOL,
        PRE_PROTOCOL_FRONTEND,
        USER_PROTOCOL,
        POST_PROTOCOL,
        UNMARSHAL,
        PRE_LOGICAL,
        USER_LOGICAL,
        POST_LOGICAL,
        PRE_INVOKE,
        INVOKE,
        POST_INVOKE,
    ];

    pub const OUTBOUND: &[&str] = &[
        SETUP,
        PRE_LOGICAL,
        USER_LOGICAL,
        POST_LOGICAL,
        PREPARE_SEND,
        PRE_STREAM,
        PRE_PROTOCOL,
        WRITE,
        PRE_MARSHAL,
        MARSHAL,
        POST_MARSHAL,
        USER_PROTOCOL,
        POST_PROTOCOL,
        USER_STREAM,
        POST_STREAM,
        SEND,
        SEND_ENDING,
        POST_STREAM_ENDING,
        USER_STREAM_ENDING,
        POST_PROTOCOL_ENDING,
        USER_PROTOCOL_ENDING,
        MARSHAL_ENDING,
        WRITE_ENDING,
        PRE_PROTOCOL_ENDING,
        PRE_STREAM_ENDING,
        PREPARE_SEND_ENDING,
        POST_LOGICAL_ENDING,
        USER_LOGICAL_ENDING,
        PRE_LOGICAL_ENDING,
        SETUP_ENDING,
    ];
}

/// Gap left between the priorities of built-in phases so custom phases can
/// be slotted in between.
const BUILTIN_PRIORITY_STEP: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    name: String,
    priority: i32,
}

impl Phase {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// Totally ordered set of phases, lowest priority first.
#[derive(Debug, Clone, Default)]
pub struct PhaseRegistry {
    phases: Vec<Phase>,
    fault_phase: Option<String>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard inbound phase table (receive … post-invoke).
    pub fn inbound() -> Self {
        Self::from_names(names::INBOUND)
    }

    /// The standard outbound phase table (setup … setup-ending).
    pub fn outbound() -> Self {
        Self::from_names(names::OUTBOUND)
    }

    fn from_names(names: &[&str]) -> Self {
        let phases = names
            .iter()
            .zip(1..)
            .map(|(name, i)| Phase::new(*name, i * BUILTIN_PRIORITY_STEP))
            .collect();
        Self {
            phases,
            fault_phase: None,
        }
    }

    /// Register a phase with an explicit priority. Names and priorities must
    /// both be unique.
    pub fn register(&mut self, name: impl Into<String>, priority: i32) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PhaseflowError::DuplicatePhase { name });
        }
        match self.phases.binary_search_by_key(&priority, Phase::priority) {
            Ok(i) => Err(PhaseflowError::DuplicatePriority {
                name,
                priority,
                existing: self.phases[i].name.clone(),
            }),
            Err(i) => {
                self.phases.insert(i, Phase::new(name, priority));
                Ok(())
            }
        }
    }

    /// Register a phase after every phase registered so far. Returns the
    /// priority it was given.
    pub fn push(&mut self, name: impl Into<String>) -> Result<i32> {
        let name = name.into();
        let priority = match self.phases.last() {
            None => 1,
            Some(last) => last
                .priority
                .checked_add(1)
                .ok_or_else(|| PhaseflowError::PriorityOverflow { name: name.clone() })?,
        };
        self.register(name, priority)?;
        Ok(priority)
    }

    /// Designate the phase whose interceptors handle faults in-chain. When a
    /// failing pass reached none of them, the fault goes to the chain's sink.
    pub fn set_fault_phase(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if !self.contains(&name) {
            return Err(PhaseflowError::UnknownFaultPhase { phase: name });
        }
        self.fault_phase = Some(name);
        Ok(())
    }

    pub fn with_fault_phase(mut self, name: impl Into<String>) -> Result<Self> {
        self.set_fault_phase(name)?;
        Ok(self)
    }

    pub fn fault_phase(&self) -> Option<&str> {
        self.fault_phase.as_deref()
    }

    pub fn priority(&self, name: &str) -> Option<i32> {
        self.phases
            .iter()
            .find(|p| p.name == name)
            .map(Phase::priority)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.phases.iter().any(|p| p.name == name)
    }

    /// Order two phases by priority. `None` if either is not registered.
    pub fn compare(&self, a: &str, b: &str) -> Option<Ordering> {
        Some(self.priority(a)?.cmp(&self.priority(b)?))
    }

    /// Phases in priority order.
    pub fn phases(&self) -> impl Iterator<Item = &Phase> + '_ {
        self.phases.iter()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}
