//! Implements the Reduce phase.
//!

use crate::aggregate::{Aggregator, BasicMerge, SchimmyMerge};
use crate::error::Result;
use crate::formats::wire::{write_side_value, RecordFileWriter};
use crate::generation::GenerationStore;
use crate::parameters::{RankParameters, Variant};
use crate::partitioner::Partitioner;
use crate::shuffle::LocalShuffle;

use log::debug;

/// Result of a reduce task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReduceStats {
    pub nodes: u64,
    /// Log-domain mass delivered to the partition, as written to its side
    /// file.
    pub delivered: f32,
}

/// One reduce task: aggregates the shuffled messages of a partition and
/// writes one COMPLETE record per node, carrying the mass the node received,
/// plus the partition's delivered-mass side file.
pub struct ReducePartition<'a, 's, P: Partitioner> {
    params: &'a RankParameters,
    store: &'s GenerationStore,
    shuffle: &'a LocalShuffle<'s, P>,
    generation: usize,
    partition: usize,
    map_tasks: usize,
}

impl<'a, 's, P: Partitioner> ReducePartition<'a, 's, P> {
    /// Create a new Reduce partition reading the spills of `map_tasks` map
    /// tasks and, with the resident-structure variant, partition `partition`
    /// of generation `generation`.
    pub fn new(
        params: &'a RankParameters,
        store: &'s GenerationStore,
        shuffle: &'a LocalShuffle<'s, P>,
        generation: usize,
        partition: usize,
        map_tasks: usize,
    ) -> ReducePartition<'a, 's, P> {
        ReducePartition {
            params,
            store,
            shuffle,
            generation,
            partition,
            map_tasks,
        }
    }

    /// Run the Reduce partition.
    pub fn run(self) -> Result<ReduceStats> {
        let input = self.shuffle.open_partition(self.partition, self.map_tasks)?;
        let stats = match self.params.variant {
            Variant::Schimmy => {
                let structure = self.store.read_partition(self.generation, self.partition)?;
                self.write(SchimmyMerge::new(self.partition, structure, input))?
            }
            Variant::Basic => self.write(BasicMerge::new(self.partition, input))?,
        };
        write_side_value(
            self.store.dangling_path(self.generation, self.partition),
            stats.delivered,
        )?;
        debug!(
            "Reduce partition {}: {} node(s), delivered mass {}",
            self.partition,
            stats.nodes,
            stats.delivered.exp()
        );
        Ok(stats)
    }

    fn write<A: Aggregator>(&self, mut aggregator: A) -> Result<ReduceStats> {
        let mut out =
            RecordFileWriter::create(self.store.received_path(self.generation, self.partition))?;
        for node in aggregator.by_ref() {
            out.write_node(node?)?;
        }
        let nodes = out.commit()? as u64;
        Ok(ReduceStats {
            nodes,
            delivered: aggregator.delivered() as f32,
        })
    }
}
