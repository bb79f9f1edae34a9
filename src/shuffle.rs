//! A shuffle over the local file system.
//!
//! Every map task writes one sorted spill file per partition. The reduce
//! task of partition `p` merges the spills of all map tasks for `p` and
//! groups the merged stream by destination id, so that all records for one
//! key are delivered together and keys arrive in ascending order.

use crate::error::Result;
use crate::formats::wire::{RecordFileWriter, RecordReader};
use crate::generation::GenerationStore;
use crate::partitioner::Partitioner;
use crate::record_types::{NodeId, WireRecord};
use crate::shard_merge::ShardMergeIterator;

use log::debug;
use std::iter::Peekable;

/// All records delivered for one destination id.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageGroup {
    pub id: NodeId,
    pub records: Vec<WireRecord>,
}

impl MessageGroup {
    pub fn new(id: NodeId, records: Vec<WireRecord>) -> MessageGroup {
        MessageGroup { id, records }
    }
}

/// Iterator adapter: Converts an Iterator<Item=Result<WireRecord>> into an
/// Iterator<Item=Result<MessageGroup>> by grouping subsequent records with identical key.
/// The original iterator must yield records in sorted order (or at least in an order where
/// identical keys are adjacent).
pub struct MessageGroups<It: Iterator<Item = Result<WireRecord>>> {
    it: Peekable<It>,
    /// Efficiency knob: How big groups of records are expected to be.
    expected_group_size: usize,
}

impl<It: Iterator<Item = Result<WireRecord>>> MessageGroups<It> {
    pub fn new(it: It, expected_group_size: usize) -> MessageGroups<It> {
        MessageGroups {
            it: it.peekable(),
            expected_group_size,
        }
    }
}

impl<It: Iterator<Item = Result<WireRecord>>> Iterator for MessageGroups<It> {
    type Item = Result<MessageGroup>;
    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.it.next()? {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        let key = first.id();
        let mut records = Vec::with_capacity(self.expected_group_size);
        records.push(first);

        while let Some(r) = self.it.next_if(|r| matches!(r, Ok(r) if r.id() == key)) {
            // next_if only yields Ok records here.
            if let Ok(r) = r {
                records.push(r);
            }
        }
        Some(Ok(MessageGroup::new(key, records)))
    }
}

/// The merged, grouped input of one reduce task.
pub type PartitionInput = MessageGroups<ShardMergeIterator<'static, WireRecord>>;

/// The shuffle of one iteration.
pub struct LocalShuffle<'s, P: Partitioner> {
    store: &'s GenerationStore,
    iteration: usize,
    partitions: usize,
    partitioner: P,
}

impl<'s, P: Partitioner> LocalShuffle<'s, P> {
    pub fn new(
        store: &'s GenerationStore,
        iteration: usize,
        partitions: usize,
        partitioner: P,
    ) -> LocalShuffle<'s, P> {
        LocalShuffle {
            store,
            iteration,
            partitions,
            partitioner,
        }
    }

    /// Routes the sorted output of map task `task` into one spill file per
    /// partition. Every partition gets a file, possibly empty. Returns the
    /// number of records written.
    pub fn write_spills<I>(&self, task: usize, sorted: I) -> Result<u64>
    where
        I: IntoIterator<Item = WireRecord>,
    {
        let mut outputs = (0..self.partitions)
            .map(|p| RecordFileWriter::create(self.store.spill_path(self.iteration, task, p)))
            .collect::<std::io::Result<Vec<_>>>()?;

        let mut written = 0;
        let mut last = None;
        for r in sorted {
            debug_assert!(last <= Some(r.id()), "map output is not sorted");
            last = Some(r.id());
            let p = self.partitioner.partition(self.partitions, r.id());
            outputs[p].write(&r)?;
            written += 1;
        }
        for out in outputs {
            out.commit()?;
        }
        debug!(
            "Map task {} of iteration {} spilled {} record(s)",
            task, self.iteration, written
        );
        Ok(written)
    }

    /// Opens the grouped input of partition `p`, merging the spills of
    /// `map_tasks` map tasks.
    pub fn open_partition(&self, p: usize, map_tasks: usize) -> Result<PartitionInput> {
        let readers = (0..map_tasks)
            .map(|task| RecordReader::open(self.store.spill_path(self.iteration, task, p)))
            .collect::<Result<Vec<_>>>()?;
        Ok(MessageGroups::new(ShardMergeIterator::build(readers), 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RankError;
    use crate::partitioner::ModPartitioner;

    fn mass(id: NodeId, mass: f32) -> WireRecord {
        WireRecord::Mass { id, mass }
    }

    #[test]
    fn test_grouping() {
        let input = vec![mass(1, -1.0), mass(1, -2.0), mass(3, -1.0), mass(4, 0.0), mass(4, 0.0)];
        let groups: Vec<MessageGroup> = MessageGroups::new(input.into_iter().map(Ok), 2)
            .collect::<Result<_>>()
            .unwrap();
        let shape: Vec<(NodeId, usize)> = groups.iter().map(|g| (g.id, g.records.len())).collect();
        assert_eq!(shape, vec![(1, 2), (3, 1), (4, 2)]);
    }

    #[test]
    fn test_grouping_stops_at_error() {
        let input = vec![
            Ok(mass(1, -1.0)),
            Err(RankError::Corrupt(String::from("bad frame"))),
            Ok(mass(1, -1.0)),
        ];
        let mut groups = MessageGroups::new(input.into_iter(), 1);
        assert_eq!(groups.next().unwrap().unwrap().records.len(), 1);
        assert!(groups.next().unwrap().is_err());
    }

    #[test]
    fn test_spill_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        store.prepare_iteration(0).unwrap();
        let shuffle = LocalShuffle::new(&store, 0, 2, ModPartitioner);

        assert_eq!(
            shuffle
                .write_spills(0, vec![mass(0, -1.0), mass(1, -1.0), mass(2, -1.0)])
                .unwrap(),
            3
        );
        shuffle
            .write_spills(1, vec![mass(2, -3.0), mass(4, -1.0)])
            .unwrap();

        let even: Vec<MessageGroup> = shuffle
            .open_partition(0, 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(even.iter().map(|g| g.id).collect::<Vec<_>>(), vec![0, 2, 4]);
        // Equal keys keep the order of the map tasks.
        assert_eq!(even[1].records, vec![mass(2, -1.0), mass(2, -3.0)]);

        let odd: Vec<MessageGroup> = shuffle
            .open_partition(1, 2)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(odd, vec![MessageGroup::new(1, vec![mass(1, -1.0)])]);
    }
}
