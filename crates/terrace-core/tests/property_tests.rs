//! # Property-Based Tests
//!
//! Walk and pool invariants over randomly shaped graphs.

mod common;

use common::{AddOne, CountingSource};
use proptest::collection::vec;
use proptest::prelude::*;
use terrace_core::{
    BufferPool, EvalStatus, MeshSettings, NodeGuid, PortRef, Session, SessionConfig,
};

fn inline_session(max_walk_depth: usize) -> Session {
    let config = SessionConfig {
        max_walk_depth,
        ..SessionConfig::inline()
    };
    Session::new(config).expect("session")
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Every node of a random tree runs exactly once and every leaf
    /// receives the source value plus its depth.
    #[test]
    fn random_tree_runs_each_node_once(parents in vec(any::<prop::sample::Index>(), 1..40)) {
        let mut session = inline_session(64);
        let source = CountingSource::new(100);
        let graph = session.graph_mut();
        let mut guids = vec![graph.add_node(Box::new(source.clone()))];
        let mut depths = vec![0_u32];
        let mut counters = Vec::new();

        for parent in &parents {
            let parent = parent.index(guids.len());
            let node = AddOne::default();
            counters.push(node.clone());
            let guid = graph.add_node(Box::new(node));
            graph
                .connect(PortRef::new(guids[parent], "value"), PortRef::new(guid, "in"))
                .expect("connect");
            guids.push(guid);
            depths.push(depths[parent] + 1);
        }

        let leaves: Vec<NodeGuid> = guids
            .iter()
            .copied()
            .filter(|guid| session.graph().downstream(*guid).is_empty())
            .collect();
        let id = session
            .evaluate(&leaves, MeshSettings::with_resolution(4))
            .expect("evaluate");

        prop_assert_eq!(session.poll(id).expect("poll"), EvalStatus::Complete);
        prop_assert_eq!(source.calls(), 1);
        for counter in &counters {
            prop_assert_eq!(counter.calls(), 1);
        }
        for (guid, depth) in guids.iter().zip(&depths) {
            let value = session
                .try_get_output_data::<u32>(id, *guid, "value")
                .expect("output");
            prop_assert_eq!(*value, 100 + depth);
        }
    }

    /// A cycle of any length blocks on the first poll and never completes.
    #[test]
    fn cycles_always_block(length in 1_usize..12, limit in 4_usize..32) {
        let mut session = inline_session(limit);
        let graph = session.graph_mut();
        let nodes: Vec<NodeGuid> = (0..length)
            .map(|_| graph.add_node(Box::new(AddOne::default())))
            .collect();
        for (i, guid) in nodes.iter().enumerate() {
            let next = nodes[(i + 1) % length];
            graph
                .connect(PortRef::new(*guid, "value"), PortRef::new(next, "in"))
                .expect("connect");
        }

        let id = session
            .evaluate(&[nodes[0]], MeshSettings::with_resolution(4))
            .expect("evaluate");
        let status = session.poll(id).expect("poll");

        let blocked = matches!(status, EvalStatus::Blocked(ref d) if d.chain.len() == limit + 1);
        prop_assert!(blocked, "unexpected status {:?}", status);
    }

    /// Chains shorter than the depth limit finish; longer ones block.
    #[test]
    fn depth_limit_is_exact(length in 0_usize..24, limit in 1_usize..24) {
        let mut session = inline_session(limit);
        let graph = session.graph_mut();
        let mut last = graph.add_node(Box::new(CountingSource::new(0)));
        for _ in 0..length {
            let next = graph.add_node(Box::new(AddOne::default()));
            graph
                .connect(PortRef::new(last, "value"), PortRef::new(next, "in"))
                .expect("connect");
            last = next;
        }

        let id = session
            .evaluate(&[last], MeshSettings::with_resolution(4))
            .expect("evaluate");
        let status = session.poll(id).expect("poll");

        // the walk holds one frame per node on the chain
        if length < limit {
            prop_assert_eq!(status, EvalStatus::Complete);
        } else {
            prop_assert!(matches!(status, EvalStatus::Blocked(_)));
        }
    }

    /// Released storage is recycled: acquiring the same sizes again after a
    /// release allocates nothing new.
    #[test]
    fn pool_reuses_released_storage(sizes in vec(1_usize..512, 1..20)) {
        let mut pool = BufferPool::new();

        let mut first = pool.new_pack();
        for len in &sizes {
            let buffer = pool.acquire::<f32>(&mut first, *len);
            prop_assert_eq!(buffer.len(), *len);
        }
        prop_assert_eq!(pool.release_all(first).expect("release"), sizes.len());
        prop_assert_eq!(pool.free_count::<f32>(), sizes.len());

        let mut second = pool.new_pack();
        for len in &sizes {
            let buffer = pool.acquire::<f32>(&mut second, *len);
            prop_assert_eq!(buffer.len(), *len);
        }
        prop_assert_eq!(pool.stats().reused, sizes.len() as u64);
        prop_assert_eq!(pool.free_count::<f32>(), 0);
    }
}
