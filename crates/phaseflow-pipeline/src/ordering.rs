//! Plan ordering: phase partitioning plus a stable topological sort inside
//! each phase.
//!
//! Phases are a hard partition. Before/after constraints only order
//! interceptors that share a phase; a reference to an id in another phase,
//! or to an id that is not present at all, is ignored. Ties fall back to
//! insertion order. A cyclic phase never hangs the sort: the earliest
//! inserted interceptor that cannot be placed is placed anyway and the
//! conflict is reported.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;

use phaseflow_types::Interceptor;

use crate::phase::PhaseRegistry;

/// An interceptor together with its insertion sequence number.
#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) seq: u64,
    pub(crate) interceptor: Arc<dyn Interceptor>,
}

impl Entry {
    pub(crate) fn id(&self) -> &str {
        self.interceptor.id()
    }

    pub(crate) fn phase(&self) -> &str {
        self.interceptor.phase()
    }
}

/// A phase whose before/after constraints could not all be honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingConflict {
    pub phase: String,
    /// Interceptors left unplaced when the sort stalled, in insertion order.
    pub interceptors: Vec<String>,
}

impl fmt::Display for OrderingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cyclic before/after constraints in phase '{}' between: {}",
            self.phase,
            self.interceptors.join(", ")
        )
    }
}

/// Order `entries` by phase priority, then by constraints within each phase.
pub(crate) fn order(
    entries: Vec<Entry>,
    registry: &PhaseRegistry,
) -> (Vec<Entry>, Vec<OrderingConflict>) {
    let mut partitions: BTreeMap<i32, Vec<Entry>> = BTreeMap::new();
    for entry in entries {
        // Entries are validated on insert; an unknown phase sorts last rather than vanishing.
        let priority = registry.priority(entry.phase()).unwrap_or(i32::MAX);
        partitions.entry(priority).or_default().push(entry);
    }

    let mut plan = Vec::new();
    let mut conflicts = Vec::new();
    for (_, mut partition) in partitions {
        partition.sort_by_key(|e| e.seq);
        let phase = partition[0].phase().to_string();
        let (sorted, stalled) = sort_phase(partition);
        if let Some(interceptors) = stalled {
            conflicts.push(OrderingConflict {
                phase,
                interceptors,
            });
        }
        plan.extend(sorted);
    }
    (plan, conflicts)
}

/// Kahn's algorithm over one phase. `entries` must be in insertion order so
/// that index order doubles as the tie-break.
fn sort_phase(entries: Vec<Entry>) -> (Vec<Entry>, Option<Vec<String>>) {
    let n = entries.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];

    let edges = {
        let mut by_id: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            by_id.entry(entry.id()).or_default().push(i);
        }
        let mut edges = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            for id in entry.interceptor.before().iter() {
                for &j in by_id.get(id).into_iter().flatten() {
                    edges.push((i, j));
                }
            }
            for id in entry.interceptor.after().iter() {
                for &j in by_id.get(id).into_iter().flatten() {
                    edges.push((j, i));
                }
            }
        }
        edges
    };
    for (from, to) in edges {
        if from != to {
            successors[from].push(to);
            indegree[to] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(Reverse)
        .collect();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut stalled: Option<Vec<String>> = None;

    while order.len() < n {
        let next = match ready.pop() {
            Some(Reverse(i)) => i,
            None => {
                let Some(i) = (0..n).find(|&i| !placed[i]) else {
                    break;
                };
                if stalled.is_none() {
                    stalled = Some(
                        (0..n)
                            .filter(|&j| !placed[j])
                            .map(|j| entries[j].id().to_string())
                            .collect(),
                    );
                }
                i
            }
        };
        if placed[next] {
            continue;
        }
        placed[next] = true;
        order.push(next);
        for &succ in &successors[next] {
            indegree[succ] = indegree[succ].saturating_sub(1);
            if indegree[succ] == 0 && !placed[succ] {
                ready.push(Reverse(succ));
            }
        }
    }

    let mut slots: Vec<Option<Entry>> = entries.into_iter().map(Some).collect();
    let sorted = order.into_iter().filter_map(|i| slots[i].take()).collect();
    (sorted, stalled)
}
