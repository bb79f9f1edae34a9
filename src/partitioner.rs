//! Functions assigning node ids to partitions.
//!
//! The same partitioner must be used to lay out generation files and to
//! route messages: the merge-join relies on partition `p` of the shuffle
//! holding exactly the ids stored in partition file `p`.

use crate::record_types::NodeId;

/// Default partitioning function: `id mod n`.
pub fn _std_partition(n: usize, id: NodeId) -> usize {
    id as usize % n
}

pub trait Partitioner: Send + Sync + Clone {
    /// Returns the partition of `id`, a number in [0; n).
    ///
    /// Must be deterministic: every stage of an iteration calls it
    /// independently.
    fn partition(&self, n: usize, id: NodeId) -> usize {
        _std_partition(n, id)
    }

    /// Short name recorded in generation manifests.
    fn name(&self) -> String;
}

/// Routes ids round-robin, `id mod n`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModPartitioner;

impl Partitioner for ModPartitioner {
    fn name(&self) -> String {
        String::from("mod")
    }
}

/// Splits `0..nodes` into `n` contiguous ranges of (almost) equal size.
#[derive(Clone, Copy, Debug)]
pub struct RangePartitioner {
    nodes: usize,
}

impl RangePartitioner {
    pub fn new(nodes: usize) -> RangePartitioner {
        RangePartitioner { nodes }
    }
}

impl Partitioner for RangePartitioner {
    fn partition(&self, n: usize, id: NodeId) -> usize {
        let per = self.nodes.div_ceil(n).max(1);
        (id as usize / per).min(n - 1)
    }

    fn name(&self) -> String {
        format!("range:{}", self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mod() {
        let p = ModPartitioner;
        assert_eq!(p.partition(3, 0), 0);
        assert_eq!(p.partition(3, 4), 1);
        assert_eq!(p.partition(1, 77), 0);
    }

    #[test]
    fn test_range_is_contiguous() {
        let p = RangePartitioner::new(10);
        let parts: Vec<usize> = (0..10).map(|id| p.partition(3, id)).collect();
        assert_eq!(parts, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2]);
        assert!(parts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_range_more_partitions_than_nodes() {
        let p = RangePartitioner::new(2);
        assert_eq!(p.partition(5, 0), 0);
        assert_eq!(p.partition(5, 1), 1);
    }
}
