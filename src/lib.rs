//! Computes PageRank over a partitioned graph with the Schimmy design
//! pattern, in log space, on one machine.
//!
//! Each iteration turns the immutable generation `k` into generation `k + 1`
//! through three barrier-separated stages:
//!
//! 1. map: every node splits its mass among its neighbors ([`emitter`],
//!    [`map`]); messages are partitioned, sorted and spilled ([`shuffle`]);
//! 2. reduce: the messages of a partition are merge-joined against the
//!    partition's resident structure ([`aggregate`], [`reduce`]);
//! 3. damping: random-jump and dangling mass are added ([`damping`]).
//!
//! The [`controller`] sequences the stages on a worker pool and commits
//! generations atomically into a [`generation::GenerationStore`].
//!

pub mod aggregate;
pub mod controller;
pub mod damping;
pub mod emitter;
pub mod error;
pub mod formats;
pub mod generation;
pub mod logprob;
pub mod map;
pub mod parameters;
pub mod partitioner;
pub mod record_types;
pub mod reduce;
pub mod shard_merge;
pub mod shuffle;
