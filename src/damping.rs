//! Combines random-jump mass, redistributed dangling mass and link mass
//! into the next generation's mass:
//!
//! ```text
//! jump    = ln(α) − ln(N)
//! link    = ln(1 − α) + logSumExp(r, ln(missing) − ln(N))
//! newMass = logSumExp(jump, link)
//! ```
//!
//! where `r` is the mass a node received along links and `missing` is the
//! probability lost at dangling nodes during the iteration.

use crate::error::{RankError, Result};
use crate::formats::wire::{NodeReader, RecordFileWriter};
use crate::generation::GenerationStore;
use crate::logprob::{log_sum_exp, NEG_INF};
use crate::record_types::Node;

use log::debug;

/// The damping function of one iteration. It depends only on global scalars,
/// so every partition applies the same instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Damping {
    jump: f64,
    link: f64,
    redistributed: f64,
}

impl Damping {
    pub fn new(alpha: f64, nodes: usize, missing_mass: f64) -> Damping {
        let ln_n = (nodes as f64).ln();
        Damping {
            jump: alpha.ln() - ln_n,
            link: (1.0 - alpha).ln(),
            redistributed: missing_mass.ln() - ln_n,
        }
    }

    /// The new log mass of a node that received `received`.
    #[inline]
    pub fn mass(&self, received: f64) -> f64 {
        let link = self.link + log_sum_exp(received, self.redistributed);
        log_sum_exp(self.jump, link)
    }

    /// Replaces the received mass of `node` with its damped mass.
    pub fn apply(&self, node: Node) -> Node {
        Node {
            mass: self.mass(node.mass as f64) as f32,
            ..node
        }
    }
}

/// Applies the damping function to the aggregated nodes of one partition,
/// in memory.
pub fn damp<I>(complete: I, alpha: f64, nodes: usize, missing_mass: f64) -> Vec<Node>
where
    I: IntoIterator<Item = Node>,
{
    let damping = Damping::new(alpha, nodes, missing_mass);
    complete.into_iter().map(|n| damping.apply(n)).collect()
}

/// Result of a damping task.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DampStats {
    pub nodes: u64,
    /// ℓ₁ distance, in probability space, between the partition's old and
    /// new masses.
    pub l1_delta: f64,
    /// Log-domain total of the partition's new mass.
    pub mass: f64,
}

/// One damping task: reads the received-mass file of a partition together
/// with the same partition of the previous generation, and writes the
/// partition of the next generation into its staging directory.
pub struct DampPartition<'s> {
    store: &'s GenerationStore,
    damping: Damping,
    generation: usize,
    partition: usize,
}

impl<'s> DampPartition<'s> {
    pub fn new(
        store: &'s GenerationStore,
        damping: Damping,
        generation: usize,
        partition: usize,
    ) -> DampPartition<'s> {
        DampPartition {
            store,
            damping,
            generation,
            partition,
        }
    }

    pub fn run(self) -> Result<DampStats> {
        let mut received =
            NodeReader::open(self.store.received_path(self.generation, self.partition))?;
        let previous = self.store.read_partition(self.generation, self.partition)?;
        let mut out = RecordFileWriter::create(
            self.store
                .staging_partition_path(self.generation + 1, self.partition),
        )?;

        let mut stats = DampStats {
            nodes: 0,
            l1_delta: 0.0,
            mass: NEG_INF,
        };
        for old in previous {
            let old = old?;
            let node = match received.next() {
                Some(node) => node?,
                None => {
                    return Err(RankError::Corrupt(format!(
                        "received mass of partition {} ends before node {}",
                        self.partition, old.id
                    )))
                }
            };
            if node.id != old.id {
                return Err(RankError::NodeMismatch {
                    partition: self.partition,
                    expected: old.id,
                    found: node.id,
                });
            }
            let node = self.damping.apply(node);
            stats.nodes += 1;
            stats.l1_delta += ((node.mass as f64).exp() - (old.mass as f64).exp()).abs();
            stats.mass = log_sum_exp(stats.mass, node.mass as f64);
            out.write_node(node)?;
        }
        if let Some(extra) = received.next() {
            let found = extra?.id;
            return Err(RankError::Corrupt(format!(
                "received mass of partition {} has extra node {}",
                self.partition, found
            )));
        }
        out.commit()?;
        debug!(
            "Damp partition {}: {} node(s), l1 delta {}",
            self.partition, stats.nodes, stats.l1_delta
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_dangling_node_keeps_all_mass() {
        // Nothing was delivered, so all of the mass is missing.
        let next = damp(vec![Node::new(0, f32::NEG_INFINITY, vec![])], 0.15, 1, 1.0);
        assert!(next[0].mass.abs() < 1e-6);
    }

    #[test]
    fn test_stationary_cycle() {
        let quarter = (0.25f32).ln();
        let d = Damping::new(0.15, 4, 0.0);
        assert!((d.mass(quarter as f64) - quarter as f64).abs() < 1e-6);
    }

    #[test]
    fn test_zero_alpha_is_pure_link_mass() {
        let d = Damping::new(0.0, 10, 0.0);
        assert_eq!(d.mass(-2.0), -2.0);
        assert_eq!(d.mass(NEG_INF), NEG_INF);
    }

    #[test]
    fn test_total_mass_is_one() {
        // Three nodes received 0.5, 0.2, 0.0 of the mass; 0.3 went missing.
        let received = [0.5f64, 0.2, 0.0];
        let d = Damping::new(0.15, 3, 0.3);
        let total: f64 = received.iter().map(|&r| d.mass(r.ln()).exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_structure_is_copied() {
        let n = Damping::new(0.15, 2, 0.0).apply(Node::new(1, -0.1, vec![0, 1]));
        assert_eq!((n.id, n.adjacency), (1, vec![0, 1]));
    }
}
