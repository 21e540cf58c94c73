use std::collections::BTreeSet;

use proptest::prelude::*;

use regen_core::{NodeKind, NodeRef, Props, RelType};
use regen_graph::store::WriteOp;
use regen_graph::{find_impact, GraphStore, ImpactOptions, ImpactReport, MemoryStore, UnitOfWork};

const WIDTH: usize = 4;

/// Event-chain edges between `Kind_i` nodes, as (from kind, rel, to kind).
const SHAPES: [(NodeKind, RelType, NodeKind); 5] = [
    (NodeKind::Command, RelType::EmitsEvent, NodeKind::Event),
    (NodeKind::Policy, RelType::ListensEvent, NodeKind::Event),
    (NodeKind::Policy, RelType::TriggersCommand, NodeKind::Command),
    (NodeKind::Aggregate, RelType::HandlesCommand, NodeKind::Command),
    (NodeKind::Event, RelType::AffectsAggregate, NodeKind::Aggregate),
];

fn n(kind: NodeKind, i: usize) -> NodeRef {
    NodeRef::new(kind, format!("{}_{}", kind.label().to_uppercase(), i))
}

fn build(edges: &[(usize, usize, usize)]) -> UnitOfWork {
    let mut unit = UnitOfWork::new();
    for kind in [NodeKind::Aggregate, NodeKind::Command, NodeKind::Event, NodeKind::Policy] {
        for i in 0..WIDTH {
            unit.push(WriteOp::MergeNode {
                node: n(kind, i),
                on_create: Props::new(),
                set: Props::new(),
            });
        }
    }
    for &(shape, i, j) in edges {
        let (from, rel, to) = SHAPES[shape];
        unit.push(WriteOp::MergeEdge {
            from: n(from, i),
            rel,
            to: n(to, j),
            on_create: Props::new(),
            set: Props::new(),
        });
    }
    unit
}

fn reached(report: &ImpactReport) -> BTreeSet<String> {
    report
        .impacted
        .iter()
        .flat_map(|(kind, ids)| ids.iter().map(move |id| format!("{kind}:{id}")))
        .collect()
}

proptest! {
    #[test]
    fn prop_traversal_terminates_without_duplicates(
        edges in proptest::collection::vec((0..SHAPES.len(), 0..WIDTH, 0..WIDTH), 0..40),
        root in 0..WIDTH,
        max_hops in 0..6u32,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (report, wider) = runtime.block_on(async {
            let store = MemoryStore::default();
            store.commit(build(&edges)).await.unwrap();
            let roots = [n(NodeKind::Command, root)];
            let report = find_impact(&store, &roots, ImpactOptions::default().with_max_hops(max_hops))
                .await
                .unwrap();
            let wider = find_impact(&store, &roots, ImpactOptions::default().with_max_hops(max_hops + 1))
                .await
                .unwrap();
            (report, wider)
        });

        for ids in report.impacted.values() {
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
        let root_id = n(NodeKind::Command, root).id;
        prop_assert!(!report.ids(NodeKind::Command).contains(&root_id));
        for id in &report.affected_aggregates {
            prop_assert!(!report.ids(NodeKind::Aggregate).contains(id));
        }
        prop_assert!(reached(&report).is_subset(&reached(&wider)));
    }
}
