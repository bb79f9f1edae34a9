//! Aggregation of incoming mass per node.
//!
//! [`SchimmyMerge`] merge-joins the sorted message groups of a partition
//! against the partition's resident structure file; [`BasicMerge`] rebuilds
//! nodes from groups that carry their own STRUCTURE record. Both yield exactly
//! one node per structure id, ascending, carrying the `logSumExp` of the mass
//! it received (`-∞` if none), and keep a [`DanglingMassAccumulator`] of the
//! mass delivered to the partition.

use crate::error::{RankError, Result};
use crate::logprob::{log_sum_exp, NEG_INF};
use crate::record_types::{Node, NodeId, WireRecord};
use crate::shuffle::{MessageGroup, MessageGroups};

/// Log-domain total of the mass delivered to one partition in one
/// iteration. Summed over all partitions it is the mass that moved along
/// links; the complement is the mass lost at dangling nodes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DanglingMassAccumulator {
    total: f64,
}

impl Default for DanglingMassAccumulator {
    fn default() -> Self {
        DanglingMassAccumulator { total: NEG_INF }
    }
}

impl DanglingMassAccumulator {
    pub fn add(&mut self, mass: f64) {
        self.total = log_sum_exp(self.total, mass);
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

/// Mass aggregation over a partition. The accumulator is complete once the
/// iterator has been drained without error.
pub trait Aggregator: Iterator<Item = Result<Node>> {
    /// The partition's delivered mass so far.
    fn delivered(&self) -> f64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeState {
    /// Emitting structure records below the pending message key.
    Scanning,
    /// The last emitted record consumed a message group.
    Matched,
    /// A fatal inconsistency was reported; nothing more is emitted.
    Fault,
}

fn with_mass(node: Node, mass: f64) -> Node {
    Node {
        mass: mass as f32,
        ..node
    }
}

/// Checks that group keys strictly increase and sums a group of MASS records.
fn sum_group(partition: usize, last: &mut Option<NodeId>, group: MessageGroup) -> Result<(NodeId, f64)> {
    if let Some(previous) = *last {
        if group.id <= previous {
            return Err(RankError::UnsortedMessages {
                partition,
                previous,
                id: group.id,
            });
        }
    }
    *last = Some(group.id);

    let mut sum = NEG_INF;
    for r in group.records {
        match r {
            WireRecord::Mass { mass, .. } => sum = log_sum_exp(sum, mass as f64),
            other => {
                return Err(RankError::UnexpectedRecord {
                    partition,
                    tag: other.tag().name(),
                    id: other.id(),
                })
            }
        }
    }
    Ok((group.id, sum))
}

/// The merge-join of sorted message groups against sorted structure.
///
/// Both inputs must be ascending by id and produced with the same
/// partitioner. The join is a single sequential pass over both.
pub struct SchimmyMerge<S, M> {
    partition: usize,
    structure: S,
    messages: M,
    messages_done: bool,
    /// Key and summed mass of the message group waiting for its structure.
    pending: Option<(NodeId, f64)>,
    last_structure: Option<NodeId>,
    last_group: Option<NodeId>,
    state: MergeState,
    dangling: DanglingMassAccumulator,
}

impl<S, M> SchimmyMerge<S, M>
where
    S: Iterator<Item = Result<Node>>,
    M: Iterator<Item = Result<MessageGroup>>,
{
    pub fn new(partition: usize, structure: S, messages: M) -> SchimmyMerge<S, M> {
        SchimmyMerge {
            partition,
            structure,
            messages,
            messages_done: false,
            pending: None,
            last_structure: None,
            last_group: None,
            state: MergeState::Scanning,
            dangling: DanglingMassAccumulator::default(),
        }
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    fn fault(&mut self, e: RankError) -> Option<Result<Node>> {
        self.state = MergeState::Fault;
        Some(Err(e))
    }

    fn check_structure(&mut self, id: NodeId) -> Result<()> {
        if let Some(previous) = self.last_structure {
            if id == previous {
                return Err(RankError::DuplicateStructure {
                    partition: self.partition,
                    id,
                });
            }
            if id < previous {
                return Err(RankError::UnsortedStructure {
                    partition: self.partition,
                    previous,
                    id,
                });
            }
        }
        self.last_structure = Some(id);
        Ok(())
    }
}

impl<S, M> Iterator for SchimmyMerge<S, M>
where
    S: Iterator<Item = Result<Node>>,
    M: Iterator<Item = Result<MessageGroup>>,
{
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Result<Node>> {
        if self.state == MergeState::Fault {
            return None;
        }

        if self.pending.is_none() && !self.messages_done {
            match self.messages.next() {
                None => self.messages_done = true,
                Some(Err(e)) => return self.fault(e),
                Some(Ok(group)) => match sum_group(self.partition, &mut self.last_group, group) {
                    Ok(pending) => self.pending = Some(pending),
                    Err(e) => return self.fault(e),
                },
            }
        }

        let node = match self.structure.next() {
            None => {
                return match self.pending {
                    Some((id, _)) => self.fault(RankError::MissingStructure {
                        partition: self.partition,
                        id,
                    }),
                    None => None,
                }
            }
            Some(Err(e)) => return self.fault(e),
            Some(Ok(node)) => node,
        };
        if let Err(e) = self.check_structure(node.id) {
            return self.fault(e);
        }

        match self.pending {
            Some((k, sum)) if node.id == k => {
                self.pending = None;
                self.state = MergeState::Matched;
                self.dangling.add(sum);
                Some(Ok(with_mass(node, sum)))
            }
            Some((k, _)) if node.id > k => self.fault(RankError::KeyMismatch {
                partition: self.partition,
                message: k,
                structure: node.id,
            }),
            _ => {
                self.state = MergeState::Scanning;
                Some(Ok(with_mass(node, NEG_INF)))
            }
        }
    }
}

impl<S, M> Aggregator for SchimmyMerge<S, M>
where
    S: Iterator<Item = Result<Node>>,
    M: Iterator<Item = Result<MessageGroup>>,
{
    fn delivered(&self) -> f64 {
        self.dangling.total()
    }
}

/// Aggregation for the basic variant, where every group carries the
/// STRUCTURE record of its node next to the MASS records.
pub struct BasicMerge<M> {
    partition: usize,
    messages: M,
    last_group: Option<NodeId>,
    failed: bool,
    dangling: DanglingMassAccumulator,
}

impl<M: Iterator<Item = Result<MessageGroup>>> BasicMerge<M> {
    pub fn new(partition: usize, messages: M) -> BasicMerge<M> {
        BasicMerge {
            partition,
            messages,
            last_group: None,
            failed: false,
            dangling: DanglingMassAccumulator::default(),
        }
    }

    fn rebuild(&mut self, group: MessageGroup) -> Result<Node> {
        if let Some(previous) = self.last_group {
            if group.id <= previous {
                return Err(RankError::UnsortedMessages {
                    partition: self.partition,
                    previous,
                    id: group.id,
                });
            }
        }
        self.last_group = Some(group.id);

        let mut adjacency = None;
        let mut sum = NEG_INF;
        for r in group.records {
            match r {
                WireRecord::Structure { adjacency: a, .. } => {
                    if adjacency.replace(a).is_some() {
                        return Err(RankError::DuplicateStructure {
                            partition: self.partition,
                            id: group.id,
                        });
                    }
                }
                WireRecord::Mass { mass, .. } => sum = log_sum_exp(sum, mass as f64),
                other @ WireRecord::Complete(_) => {
                    return Err(RankError::UnexpectedRecord {
                        partition: self.partition,
                        tag: other.tag().name(),
                        id: other.id(),
                    })
                }
            }
        }
        let adjacency = adjacency.ok_or(RankError::MissingStructure {
            partition: self.partition,
            id: group.id,
        })?;
        self.dangling.add(sum);
        Ok(Node::new(group.id, sum as f32, adjacency))
    }
}

impl<M: Iterator<Item = Result<MessageGroup>>> Iterator for BasicMerge<M> {
    type Item = Result<Node>;

    fn next(&mut self) -> Option<Result<Node>> {
        if self.failed {
            return None;
        }
        let item = match self.messages.next()? {
            Ok(group) => self.rebuild(group),
            Err(e) => Err(e),
        };
        self.failed = item.is_err();
        Some(item)
    }
}

impl<M: Iterator<Item = Result<MessageGroup>>> Aggregator for BasicMerge<M> {
    fn delivered(&self) -> f64 {
        self.dangling.total()
    }
}

/// Drains an aggregator into memory, returning the nodes and the
/// partition's delivered mass.
pub fn drain<A: Aggregator>(mut aggregator: A) -> Result<(Vec<Node>, f64)> {
    let nodes = aggregator.by_ref().collect::<Result<Vec<_>>>()?;
    Ok((nodes, aggregator.delivered()))
}

/// Merge-joins sorted `messages` (MASS records ascending by destination)
/// against the sorted `structure` of one partition, in memory.
pub fn aggregate<S, M>(partition: usize, structure: S, messages: M) -> Result<(Vec<Node>, f64)>
where
    S: IntoIterator<Item = Node>,
    M: IntoIterator<Item = WireRecord>,
{
    let groups = MessageGroups::new(messages.into_iter().map(Ok), 1);
    drain(SchimmyMerge::new(
        partition,
        structure.into_iter().map(Ok),
        groups,
    ))
}

/// Rebuilds the nodes of one partition from sorted STRUCTURE and MASS
/// records, in memory.
pub fn aggregate_basic<M>(partition: usize, messages: M) -> Result<(Vec<Node>, f64)>
where
    M: IntoIterator<Item = WireRecord>,
{
    let groups = MessageGroups::new(messages.into_iter().map(Ok), 2);
    drain(BasicMerge::new(partition, groups))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure(ids: &[NodeId]) -> Vec<Node> {
        ids.iter().map(|&id| Node::new(id, -1.0, vec![id])).collect()
    }

    fn mass(id: NodeId, mass: f32) -> WireRecord {
        WireRecord::Mass { id, mass }
    }

    #[test]
    fn test_merge_join() {
        let messages = vec![
            mass(2, (0.1f32).ln()),
            mass(2, (0.2f32).ln()),
            mass(5, (0.4f32).ln()),
        ];
        let (nodes, delivered) = aggregate(0, structure(&[1, 2, 3, 5]), messages).unwrap();

        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 5]);
        assert_eq!(nodes[0].mass, f32::NEG_INFINITY);
        assert!((nodes[1].mass.exp() - 0.3).abs() < 1e-6);
        assert_eq!(nodes[2].mass, f32::NEG_INFINITY);
        assert!((nodes[3].mass.exp() - 0.4).abs() < 1e-6);
        // Structure passes through.
        assert_eq!(nodes[3].adjacency, vec![5]);
        assert!((delivered.exp() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_no_messages() {
        let (nodes, delivered) = aggregate(0, structure(&[0]), Vec::new()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].mass, f32::NEG_INFINITY);
        assert_eq!(delivered, NEG_INF);
    }

    #[test]
    fn test_states() {
        let groups = vec![Ok(MessageGroup::new(1, vec![mass(1, 0.0)]))];
        let mut merge = SchimmyMerge::new(0, structure(&[0, 1, 2]).into_iter().map(Ok), groups.into_iter());
        assert_eq!(merge.state(), MergeState::Scanning);
        merge.next().unwrap().unwrap();
        assert_eq!(merge.state(), MergeState::Scanning);
        merge.next().unwrap().unwrap();
        assert_eq!(merge.state(), MergeState::Matched);
        merge.next().unwrap().unwrap();
        assert_eq!(merge.state(), MergeState::Scanning);
        assert!(merge.next().is_none());
        assert_eq!(merge.delivered(), 0.0);
    }

    #[test]
    fn test_message_without_structure() {
        let err = aggregate(3, structure(&[1, 4]), vec![mass(2, 0.0)]).unwrap_err();
        assert!(matches!(
            err,
            RankError::KeyMismatch {
                partition: 3,
                message: 2,
                structure: 4
            }
        ));

        let err = aggregate(0, structure(&[1]), vec![mass(9, 0.0)]).unwrap_err();
        assert!(matches!(err, RankError::MissingStructure { id: 9, .. }));
    }

    #[test]
    fn test_fault_is_terminal() {
        let mut merge = SchimmyMerge::new(
            0,
            structure(&[4, 5]).into_iter().map(Ok),
            vec![Ok(MessageGroup::new(2, vec![mass(2, 0.0)]))].into_iter(),
        );
        assert!(merge.next().unwrap().is_err());
        assert_eq!(merge.state(), MergeState::Fault);
        assert!(merge.next().is_none());
    }

    #[test]
    fn test_duplicate_and_unsorted_structure() {
        let err = aggregate(0, structure(&[1, 1]), Vec::new()).unwrap_err();
        assert!(matches!(err, RankError::DuplicateStructure { id: 1, .. }));
        let err = aggregate(0, structure(&[2, 1]), Vec::new()).unwrap_err();
        assert!(matches!(err, RankError::UnsortedStructure { .. }));
    }

    #[test]
    fn test_unsorted_messages_and_foreign_records() {
        let err = aggregate(0, structure(&[1, 2]), vec![mass(2, 0.0), mass(1, 0.0)]).unwrap_err();
        assert!(matches!(err, RankError::UnsortedMessages { .. }));

        let structure_record = WireRecord::Structure {
            id: 1,
            adjacency: vec![],
        };
        let err = aggregate(0, structure(&[1]), vec![structure_record]).unwrap_err();
        assert!(matches!(err, RankError::UnexpectedRecord { .. }));
    }

    #[test]
    fn test_basic_merge() {
        let records = vec![
            WireRecord::Structure {
                id: 0,
                adjacency: vec![1],
            },
            WireRecord::Structure {
                id: 1,
                adjacency: vec![0],
            },
            mass(1, (0.5f32).ln()),
            mass(1, (0.25f32).ln()),
        ];
        let (nodes, delivered) = aggregate_basic(0, records).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], Node::new(0, f32::NEG_INFINITY, vec![1]));
        assert!((nodes[1].mass.exp() - 0.75).abs() < 1e-6);
        assert!((delivered.exp() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_basic_merge_errors() {
        let err = aggregate_basic(0, vec![mass(3, 0.0)]).unwrap_err();
        assert!(matches!(err, RankError::MissingStructure { id: 3, .. }));

        let s = WireRecord::Structure {
            id: 3,
            adjacency: vec![],
        };
        let err = aggregate_basic(0, vec![s.clone(), s]).unwrap_err();
        assert!(matches!(err, RankError::DuplicateStructure { id: 3, .. }));
    }
}
