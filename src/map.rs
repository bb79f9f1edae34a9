//! Implements the Map phase.
//!

use crate::emitter::{MapOutput, MassEmitter};
use crate::error::Result;
use crate::generation::GenerationStore;
use crate::parameters::RankParameters;
use crate::partitioner::Partitioner;
use crate::record_types::MEmitter;
use crate::shuffle::LocalShuffle;

use log::debug;

/// Counters reported by a map task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapStats {
    pub nodes: u64,
    pub dangling: u64,
    pub emitted: u64,
    pub spilled: u64,
}

/// This is the base of the mapping phase: one instance per partition of the
/// current generation. It reads the partition file, splits every node's mass
/// among its neighbors and hands the sorted output to the shuffle.
///
/// All mutable state (the sorted output and the combiner) lives in the
/// instance, which is consumed by [`run`](Self::run).
pub struct MapPartition<'a, 's, P: Partitioner> {
    params: &'a RankParameters,
    store: &'s GenerationStore,
    shuffle: &'a LocalShuffle<'s, P>,
    generation: usize,
    partition: usize,
}

impl<'a, 's, P: Partitioner> MapPartition<'a, 's, P> {
    pub fn new(
        params: &'a RankParameters,
        store: &'s GenerationStore,
        shuffle: &'a LocalShuffle<'s, P>,
        generation: usize,
        partition: usize,
    ) -> MapPartition<'a, 's, P> {
        MapPartition {
            params,
            store,
            shuffle,
            generation,
            partition,
        }
    }

    pub fn run(self) -> Result<MapStats> {
        let emitter = MassEmitter::new(self.params.variant);
        let mut output = MapOutput::new(self.params.combiner);
        let mut em = MEmitter::new();
        let mut stats = MapStats::default();

        for node in self.store.read_partition(self.generation, self.partition)? {
            let node = node?;
            stats.nodes += 1;
            if node.is_dangling() {
                stats.dangling += 1;
            }
            emitter.map(&node, &mut em);
            stats.emitted += em.len() as u64;
            output.insert_result(&mut em);
        }

        stats.spilled = self.shuffle.write_spills(self.partition, output.into_records())?;
        debug!(
            "Map partition {}: {} node(s), {} dangling, {} record(s) emitted, {} spilled",
            self.partition, stats.nodes, stats.dangling, stats.emitted, stats.spilled
        );
        Ok(stats)
    }
}
