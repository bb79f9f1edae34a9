//! Binary encoding of [`WireRecord`]s on top of a write log.
//!
//! All integers and floats are big-endian:
//!
//! ```text
//! tag: u8 | id: u32 | mass: f32 (unless STRUCTURE) | count: u32, count × u32 (unless MASS)
//! ```

use crate::error::{RankError, Result};
use crate::formats::writelog::{WriteLogReader, WriteLogWriter};
use crate::record_types::{Node, NodeId, Tag, WireRecord};

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Appends the encoding of `record` to `buf`.
pub fn encode(record: &WireRecord, buf: &mut Vec<u8>) {
    buf.push(record.tag() as u8);
    buf.extend_from_slice(&record.id().to_be_bytes());
    match record {
        WireRecord::Structure { adjacency, .. } => encode_adjacency(adjacency, buf),
        WireRecord::Mass { mass, .. } => buf.extend_from_slice(&mass.to_be_bytes()),
        WireRecord::Complete(node) => {
            buf.extend_from_slice(&node.mass.to_be_bytes());
            encode_adjacency(&node.adjacency, buf);
        }
    }
}

fn encode_adjacency(adjacency: &[NodeId], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(adjacency.len() as u32).to_be_bytes());
    for n in adjacency {
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Cursor over one encoded record.
struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.buf.len() < N {
            return Err(RankError::Corrupt(String::from("record too short")));
        }
        let (head, rest) = self.buf.split_at(N);
        self.buf = rest;
        let mut out = [0; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    fn f32(&mut self) -> Result<f32> {
        self.take::<4>().map(f32::from_be_bytes)
    }

    fn adjacency(&mut self) -> Result<Vec<NodeId>> {
        let count = self.u32()? as usize;
        if count.checked_mul(4) != Some(self.buf.len()) {
            return Err(RankError::Corrupt(format!(
                "adjacency of {} entries in {} bytes",
                count,
                self.buf.len()
            )));
        }
        (0..count).map(|_| self.u32()).collect()
    }
}

/// Decodes one record; the frame must contain exactly one record.
pub fn decode(buf: &[u8]) -> Result<WireRecord> {
    let mut d = Decoder { buf };
    let [tag] = d.take::<1>()?;
    let tag = Tag::try_from(tag).map_err(|t| RankError::Corrupt(format!("unknown tag {}", t)))?;
    let id = d.u32()?;
    let record = match tag {
        Tag::Structure => WireRecord::Structure {
            id,
            adjacency: d.adjacency()?,
        },
        Tag::Mass => WireRecord::Mass { id, mass: d.f32()? },
        Tag::Complete => {
            let mass = d.f32()?;
            WireRecord::Complete(Node::new(id, mass, d.adjacency()?))
        }
    };
    if !d.buf.is_empty() {
        return Err(RankError::Corrupt(format!(
            "{} trailing bytes after {} record",
            d.buf.len(),
            tag
        )));
    }
    Ok(record)
}

/// Writes encoded records as write-log frames.
pub struct RecordWriter<W: Write> {
    log: WriteLogWriter<W>,
    scratch: Vec<u8>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(dest: W) -> RecordWriter<W> {
        RecordWriter {
            log: WriteLogWriter::new(dest),
            scratch: Vec::with_capacity(64),
        }
    }

    pub fn write(&mut self, record: &WireRecord) -> io::Result<()> {
        self.scratch.clear();
        encode(record, &mut self.scratch);
        self.log.append(&self.scratch)
    }

    pub fn write_node(&mut self, node: Node) -> io::Result<()> {
        self.write(&WireRecord::Complete(node))
    }

    pub fn records_written(&self) -> u32 {
        self.log.get_stats().1
    }

    pub fn into_inner(self) -> W {
        self.log.into_inner()
    }

    fn into_log(self) -> WriteLogWriter<W> {
        self.log
    }
}

/// Writes a record file under a temporary name; [`commit`](Self::commit)
/// renames it into place, so readers never see a partial file and a rerun
/// task simply overwrites a previous attempt.
pub struct RecordFileWriter {
    writer: RecordWriter<BufWriter<fs::File>>,
    tmp: PathBuf,
    path: PathBuf,
}

impl RecordFileWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<RecordFileWriter> {
        let path = path.as_ref().to_path_buf();
        let tmp = tmp_name(&path);
        Ok(RecordFileWriter {
            writer: RecordWriter {
                log: WriteLogWriter::new_to_file(&tmp)?,
                scratch: Vec::with_capacity(64),
            },
            tmp,
            path,
        })
    }

    pub fn write(&mut self, record: &WireRecord) -> io::Result<()> {
        self.writer.write(record)
    }

    pub fn write_node(&mut self, node: Node) -> io::Result<()> {
        self.writer.write_node(node)
    }

    pub fn commit(self) -> io::Result<u32> {
        let written = self.writer.records_written();
        self.writer.into_log().finish()?;
        fs::rename(&self.tmp, &self.path)?;
        Ok(written)
    }
}

fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Iterates the records of a write log. After the first error the iterator
/// is exhausted.
pub struct RecordReader<R: Read> {
    log: WriteLogReader<R>,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(src: R) -> RecordReader<R> {
        RecordReader {
            log: WriteLogReader::new(src),
            done: false,
        }
    }
}

impl RecordReader<BufReader<fs::File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(RecordReader {
            log: WriteLogReader::new_from_file(path)?,
            done: false,
        })
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<WireRecord>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.log.read_vec() {
            Ok(None) => None,
            Ok(Some(frame)) => Some(decode(&frame)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Some(Err(RankError::Corrupt(e.to_string())))
            }
            Err(e) => Some(Err(e.into())),
        };
        self.done = !matches!(item, Some(Ok(_)));
        item
    }
}

/// Adapts a record stream of COMPLETE records into nodes, as stored in
/// generation and received-mass partition files.
pub struct NodeReader<I> {
    records: I,
}

impl<I: Iterator<Item = Result<WireRecord>>> NodeReader<I> {
    pub fn new(records: I) -> NodeReader<I> {
        NodeReader { records }
    }
}

impl NodeReader<RecordReader<BufReader<fs::File>>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        RecordReader::open(path).map(NodeReader::new)
    }
}

impl<I: Iterator<Item = Result<WireRecord>>> Iterator for NodeReader<I> {
    type Item = Result<Node>;
    fn next(&mut self) -> Option<Self::Item> {
        Some(match self.records.next()? {
            Ok(WireRecord::Complete(node)) => Ok(node),
            Ok(other) => Err(RankError::Corrupt(format!(
                "expected COMPLETE record, found {} for node {}",
                other.tag(),
                other.id()
            ))),
            Err(e) => Err(e),
        })
    }
}

/// Writes a side value: exactly one big-endian `f32`.
pub fn write_side_value<P: AsRef<Path>>(path: P, value: f32) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = tmp_name(path);
    fs::write(&tmp, value.to_be_bytes())?;
    fs::rename(&tmp, path)
}

pub fn read_side_value<P: AsRef<Path>>(path: P) -> Result<f32> {
    let bytes = fs::read(path.as_ref())?;
    let bytes: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
        RankError::Corrupt(format!(
            "side file {} holds {} bytes",
            path.as_ref().display(),
            bytes.len()
        ))
    })?;
    Ok(f32::from_be_bytes(bytes))
}
