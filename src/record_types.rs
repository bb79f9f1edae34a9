//! Node records and the tagged records that cross stage boundaries.

use std::fmt;

/// Dense node identifier in `0..N`.
pub type NodeId = u32;

/// One node of a generation: its immutable adjacency list and its mass,
/// the natural logarithm of its share of the total probability.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub mass: f32,
    pub adjacency: Vec<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, mass: f32, adjacency: Vec<NodeId>) -> Node {
        Node {
            id,
            mass,
            adjacency,
        }
    }

    /// A node without outgoing edges; its mass is lost along links and
    /// redistributed by the damping stage.
    pub fn is_dangling(&self) -> bool {
        self.adjacency.is_empty()
    }
}

/// Discriminant of a [`WireRecord`]; also its first encoded byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Structure = 0,
    Mass = 1,
    Complete = 2,
}

impl TryFrom<u8> for Tag {
    type Error = u8;
    fn try_from(b: u8) -> Result<Tag, u8> {
        match b {
            0 => Ok(Tag::Structure),
            1 => Ok(Tag::Mass),
            2 => Ok(Tag::Complete),
            other => Err(other),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Tag {
    pub fn name(self) -> &'static str {
        match self {
            Tag::Structure => "STRUCTURE",
            Tag::Mass => "MASS",
            Tag::Complete => "COMPLETE",
        }
    }
}

/// The unit written to spill files, partition files and the shuffle.
///
/// STRUCTURE only crosses the shuffle in the basic variant; with the
/// resident-structure merge, MASS records are the only thing shuffled.
#[derive(Clone, Debug, PartialEq)]
pub enum WireRecord {
    Structure { id: NodeId, adjacency: Vec<NodeId> },
    Mass { id: NodeId, mass: f32 },
    Complete(Node),
}

impl WireRecord {
    /// The key the record is routed and sorted by.
    pub fn id(&self) -> NodeId {
        match self {
            WireRecord::Structure { id, .. } | WireRecord::Mass { id, .. } => *id,
            WireRecord::Complete(node) => node.id,
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            WireRecord::Structure { .. } => Tag::Structure,
            WireRecord::Mass { .. } => Tag::Mass,
            WireRecord::Complete(_) => Tag::Complete,
        }
    }
}

/// Anything that can be ordered by the node it is destined for.
pub trait Keyed {
    fn key(&self) -> NodeId;
}

impl Keyed for WireRecord {
    fn key(&self) -> NodeId {
        self.id()
    }
}

/// Emitter used by the map stage; collects the records produced for one
/// node before they are moved into the task's sorted output.
#[derive(Default)]
pub struct MEmitter {
    r: Vec<WireRecord>,
}

impl MEmitter {
    pub fn new() -> MEmitter {
        MEmitter { r: Vec::new() }
    }

    pub fn emit(&mut self, record: WireRecord) {
        self.r.push(record)
    }

    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, WireRecord> {
        self.r.drain(..)
    }

    pub fn into_records(self) -> Vec<WireRecord> {
        self.r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_byte() {
        for tag in [Tag::Structure, Tag::Mass, Tag::Complete] {
            assert_eq!(Tag::try_from(tag as u8), Ok(tag));
        }
        assert_eq!(Tag::try_from(7), Err(7));
    }

    #[test]
    fn test_record_key() {
        let s = WireRecord::Structure {
            id: 4,
            adjacency: vec![1, 2],
        };
        let m = WireRecord::Mass { id: 9, mass: -1.0 };
        let c = WireRecord::Complete(Node::new(3, 0.0, vec![]));
        assert_eq!((s.key(), m.key(), c.key()), (4, 9, 3));
        assert_eq!(c.tag().name(), "COMPLETE");
    }

    #[test]
    fn test_emitter() {
        let mut e = MEmitter::new();
        assert!(e.is_empty());
        e.emit(WireRecord::Mass { id: 1, mass: -0.5 });
        e.emit(WireRecord::Mass { id: 2, mass: -0.5 });
        assert_eq!(e.len(), 2);
        assert_eq!(e.drain().count(), 2);
        assert!(e.into_records().is_empty());
    }
}
