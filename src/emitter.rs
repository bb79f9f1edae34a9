//! Splitting a node's mass among its neighbors.
//!
//! A node with out-degree `d > 0` sends `mass − ln(d)` to every neighbor. A
//! dangling node sends nothing: its mass is accounted for by the damping
//! stage through the total mass that was actually delivered.

use crate::logprob::{log_sum_exp, NEG_INF};
use crate::parameters::Variant;
use crate::record_types::{MEmitter, Node, NodeId, WireRecord};

use std::collections::BTreeMap;

/// The map function of an iteration.
#[derive(Clone, Copy, Debug)]
pub struct MassEmitter {
    variant: Variant,
}

impl MassEmitter {
    pub fn new(variant: Variant) -> MassEmitter {
        MassEmitter { variant }
    }

    /// Emits the MASS records of `node` (and, in the basic variant, its
    /// STRUCTURE record).
    pub fn map(&self, node: &Node, em: &mut MEmitter) {
        if self.variant == Variant::Basic {
            em.emit(WireRecord::Structure {
                id: node.id,
                adjacency: node.adjacency.clone(),
            });
        }
        let d = node.adjacency.len();
        if d == 0 {
            return;
        }
        let share = (node.mass as f64 - (d as f64).ln()) as f32;
        for &neighbor in &node.adjacency {
            em.emit(WireRecord::Mass {
                id: neighbor,
                mass: share,
            });
        }
    }
}

/// Local pre-aggregation of MASS records by destination.
///
/// One instance per map task invocation; it is dropped with the task, so no
/// partial sums leak between tasks or retries.
#[derive(Debug, Default)]
pub struct Combiner {
    sums: BTreeMap<NodeId, f64>,
}

impl Combiner {
    pub fn new() -> Combiner {
        Combiner::default()
    }

    pub fn add(&mut self, id: NodeId, mass: f32) {
        let sum = self.sums.entry(id).or_insert(NEG_INF);
        *sum = log_sum_exp(*sum, mass as f64);
    }

    /// One MASS record per destination, ascending.
    pub fn into_records(self) -> impl Iterator<Item = WireRecord> {
        self.sums.into_iter().map(|(id, sum)| WireRecord::Mass {
            id,
            mass: sum as f32,
        })
    }
}

/// The sorted output of one map task.
pub struct MapOutput {
    sorted_output: BTreeMap<NodeId, Vec<WireRecord>>,
    combiner: Option<Combiner>,
}

impl MapOutput {
    pub fn new(combine: bool) -> MapOutput {
        MapOutput {
            sorted_output: BTreeMap::new(),
            combiner: combine.then(Combiner::new),
        }
    }

    /// Moves the records emitted for one node into the task output.
    pub fn insert_result(&mut self, em: &mut MEmitter) {
        for r in em.drain() {
            match (r, &mut self.combiner) {
                (WireRecord::Mass { id, mass }, Some(c)) => c.add(id, mass),
                (r, _) => self.sorted_output.entry(r.id()).or_default().push(r),
            }
        }
    }

    /// All records, ascending by key. Records with equal keys keep their
    /// emission order; combined MASS records follow the STRUCTURE record of
    /// the same key.
    pub fn into_records(mut self) -> impl Iterator<Item = WireRecord> {
        if let Some(c) = self.combiner.take() {
            for r in c.into_records() {
                self.sorted_output.entry(r.id()).or_default().push(r);
            }
        }
        self.sorted_output.into_values().flatten()
    }
}

/// Runs the map function over `nodes` in memory and returns the messages,
/// sorted by destination.
pub fn emit<'a, I>(nodes: I, variant: Variant, combine: bool) -> Vec<WireRecord>
where
    I: IntoIterator<Item = &'a Node>,
{
    let emitter = MassEmitter::new(variant);
    let mut output = MapOutput::new(combine);
    let mut em = MEmitter::new();
    for node in nodes {
        emitter.map(node, &mut em);
        output.insert_result(&mut em);
    }
    output.into_records().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mass_of(r: &WireRecord) -> f64 {
        match r {
            WireRecord::Mass { mass, .. } => *mass as f64,
            other => panic!("not a MASS record: {:?}", other),
        }
    }

    #[test]
    fn test_equal_split() {
        let node = Node::new(0, (0.6f32).ln(), vec![1, 2, 3]);
        let mut em = MEmitter::new();
        MassEmitter::new(Variant::Schimmy).map(&node, &mut em);
        let out = em.into_records();
        assert_eq!(out.len(), 3);
        for r in &out {
            assert!((mass_of(r).exp() - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dangling_emits_nothing() {
        let node = Node::new(4, 0.0, vec![]);
        let mut em = MEmitter::new();
        MassEmitter::new(Variant::Schimmy).map(&node, &mut em);
        assert!(em.is_empty());

        // The basic variant still ships the (empty) structure.
        MassEmitter::new(Variant::Basic).map(&node, &mut em);
        assert_eq!(
            em.into_records(),
            vec![WireRecord::Structure {
                id: 4,
                adjacency: vec![]
            }]
        );
    }

    #[test]
    fn test_sorted_by_destination() {
        let nodes = vec![
            Node::new(0, (0.5f32).ln(), vec![3, 1]),
            Node::new(1, (0.5f32).ln(), vec![0]),
        ];
        let out = emit(&nodes, Variant::Basic, false);
        let keys: Vec<NodeId> = out.iter().map(|r| r.id()).collect();
        assert_eq!(keys, vec![0, 0, 1, 1, 3]);
        assert!(matches!(out[0], WireRecord::Structure { id: 0, .. }));
        assert!(matches!(out[1], WireRecord::Mass { id: 0, .. }));
    }

    #[test]
    fn test_combiner_merges_duplicates() {
        let q = (0.25f32).ln();
        let nodes = vec![
            Node::new(0, q, vec![2]),
            Node::new(1, q, vec![2, 2]),
            Node::new(3, q, vec![0]),
        ];
        let raw = emit(&nodes, Variant::Schimmy, false);
        assert_eq!(raw.len(), 4);

        let combined = emit(&nodes, Variant::Schimmy, true);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].id(), 0);
        assert_eq!(combined[1].id(), 2);
        assert!((mass_of(&combined[1]).exp() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_combiner_is_per_task() {
        let mut a = Combiner::new();
        a.add(1, 0.0);
        a.add(1, 0.0);
        let merged: Vec<WireRecord> = a.into_records().collect();
        assert_eq!(merged.len(), 1);
        assert!((mass_of(&merged[0]) - 2.0f64.ln()).abs() < 1e-6);
        assert_eq!(Combiner::new().into_records().count(), 0);
    }
}
