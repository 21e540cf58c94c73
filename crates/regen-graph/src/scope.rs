//! Regeneration scope: which phases run, in which order.

use std::collections::BTreeMap;

use serde::Serialize;

use regen_core::{DirtySet, NodeKind, Phase};

/// Phases needed for `dirty`. Structural always precedes Behavioral.
pub fn scope(dirty: &DirtySet) -> Vec<Phase> {
    let kinds = dirty.kinds();
    [Phase::Structural, Phase::Behavioral]
        .into_iter()
        .filter(|phase| phase.kinds().iter().any(|k| kinds.contains(k)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhasePlan {
    pub phase: Phase,
    pub nodes: BTreeMap<NodeKind, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegenerationPlan {
    pub phases: Vec<PhasePlan>,
}

impl RegenerationPlan {
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// [`scope`] together with the nodes each phase regenerates.
pub fn plan(dirty: &DirtySet) -> RegenerationPlan {
    RegenerationPlan {
        phases: scope(dirty)
            .into_iter()
            .map(|phase| PhasePlan {
                phase,
                nodes: dirty.for_phase(phase).by_kind(),
            })
            .collect(),
    }
}
