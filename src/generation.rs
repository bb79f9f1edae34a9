//! Immutable generation snapshots and the per-iteration scratch space.
//!
//! A generation is a directory with one partition file per partition (COMPLETE
//! records sorted by id) and a manifest. It is written under a temporary
//! name and committed by renaming the directory, so a crashed or cancelled
//! run never leaves a half-written generation behind a committed name, and
//! a committed generation is never written again.

use crate::error::{RankError, Result};
use crate::formats::wire::{NodeReader, RecordFileWriter, RecordReader};
use crate::partitioner::Partitioner;
use crate::record_types::{Node, NodeId};

use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const GENERATION_PREFIX: &str = "gen-";
const ITERATION_PREFIX: &str = "iter-";
const STAGING_SUFFIX: &str = ".tmp";
const MANIFEST: &str = "manifest.properties";

/// Describes a committed generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub generation: usize,
    pub nodes: usize,
    pub partitions: usize,
    pub partitioner: String,
    /// Commit time, seconds since the Unix epoch (UTC).
    pub created: i64,
}

impl Manifest {
    pub fn new(generation: usize, nodes: usize, partitions: usize, partitioner: String) -> Manifest {
        Manifest {
            generation,
            nodes,
            partitions,
            partitioner,
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// The manifest of the generation following this one.
    pub fn next(&self) -> Manifest {
        Manifest::new(
            self.generation + 1,
            self.nodes,
            self.partitions,
            self.partitioner.clone(),
        )
    }

    fn to_properties(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("generation".to_owned(), self.generation.to_string());
        map.insert("nodes".to_owned(), self.nodes.to_string());
        map.insert("partitions".to_owned(), self.partitions.to_string());
        map.insert("partitioner".to_owned(), self.partitioner.clone());
        map.insert("created".to_owned(), self.created.to_string());
        map
    }

    fn from_properties(map: &HashMap<String, String>, name: &str) -> Result<Manifest> {
        fn get<T: std::str::FromStr>(
            map: &HashMap<String, String>,
            key: &str,
            name: &str,
        ) -> Result<T> {
            map.get(key)
                .ok_or_else(|| RankError::Corrupt(format!("missing '{}' property in {}", key, name)))?
                .parse::<T>()
                .map_err(|_| RankError::Corrupt(format!("cannot parse '{}' in {}", key, name)))
        }
        Ok(Manifest {
            generation: get(map, "generation", name)?,
            nodes: get(map, "nodes", name)?,
            partitions: get(map, "partitions", name)?,
            partitioner: get(map, "partitioner", name)?,
            created: get(map, "created", name)?,
        })
    }
}

/// File-system layout of generations and iteration scratch directories.
#[derive(Clone, Debug)]
pub struct GenerationStore {
    root: PathBuf,
}

impl GenerationStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<GenerationStore> {
        fs::create_dir_all(root.as_ref())?;
        Ok(GenerationStore {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, k: usize) -> PathBuf {
        self.root.join(format!("{}{:05}", GENERATION_PREFIX, k))
    }

    fn staging_dir(&self, k: usize) -> PathBuf {
        self.root
            .join(format!("{}{:05}{}", GENERATION_PREFIX, k, STAGING_SUFFIX))
    }

    pub fn partition_path(&self, k: usize, p: usize) -> PathBuf {
        self.generation_dir(k).join(part_name(p))
    }

    /// Where a damping task writes partition `p` of generation `k` before
    /// the generation is committed.
    pub fn staging_partition_path(&self, k: usize, p: usize) -> PathBuf {
        self.staging_dir(k).join(part_name(p))
    }

    pub fn iteration_dir(&self, k: usize) -> PathBuf {
        self.root.join(format!("{}{:05}", ITERATION_PREFIX, k))
    }

    /// Sorted output of map task `task` destined for partition `p`.
    pub fn spill_path(&self, k: usize, task: usize, p: usize) -> PathBuf {
        self.iteration_dir(k)
            .join("spill")
            .join(format!("map-{:05}.{:05}", task, p))
    }

    pub fn received_path(&self, k: usize, p: usize) -> PathBuf {
        self.iteration_dir(k).join("received").join(part_name(p))
    }

    pub fn dangling_path(&self, k: usize, p: usize) -> PathBuf {
        self.iteration_dir(k).join("dangling").join(part_name(p))
    }

    /// Creates an empty scratch directory for iteration `k`, discarding
    /// whatever an earlier, interrupted attempt left there.
    pub fn prepare_iteration(&self, k: usize) -> Result<()> {
        let dir = self.iteration_dir(k);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        for sub in ["spill", "received", "dangling"] {
            fs::create_dir_all(dir.join(sub))?;
        }
        Ok(())
    }

    pub fn remove_iteration(&self, k: usize) -> Result<()> {
        let dir = self.iteration_dir(k);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Creates the staging directory of generation `k`.
    pub fn begin_generation(&self, k: usize) -> Result<()> {
        if self.generation_dir(k).exists() {
            return Err(RankError::InvalidParameter(format!(
                "generation {} is already committed",
                k
            )));
        }
        let staging = self.staging_dir(k);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(staging)?;
        Ok(())
    }

    /// Writes the manifest and atomically publishes the staged generation.
    pub fn commit_generation(&self, manifest: &Manifest) -> Result<()> {
        let staging = self.staging_dir(manifest.generation);
        for p in 0..manifest.partitions {
            let part = staging.join(part_name(p));
            if !part.exists() {
                return Err(RankError::Corrupt(format!(
                    "cannot commit generation {}: {} is missing",
                    manifest.generation,
                    part.display()
                )));
            }
        }
        {
            let mut f = BufWriter::new(fs::File::create(staging.join(MANIFEST))?);
            java_properties::write(&mut f, &manifest.to_properties())?;
            f.flush()?;
            f.get_ref().sync_all()?;
        }
        fs::rename(&staging, self.generation_dir(manifest.generation))?;
        debug!("Committed generation {}", manifest.generation);
        Ok(())
    }

    /// Discards the staging directory of generation `k`, if any.
    pub fn abort_generation(&self, k: usize) -> Result<()> {
        let staging = self.staging_dir(k);
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        Ok(())
    }

    pub fn manifest(&self, k: usize) -> Result<Manifest> {
        let path = self.generation_dir(k).join(MANIFEST);
        let name = path.display().to_string();
        let f = fs::File::open(&path)?;
        let map = java_properties::read(BufReader::new(f))?;
        let manifest = Manifest::from_properties(&map, &name)?;
        if manifest.generation != k {
            return Err(RankError::Corrupt(format!(
                "{} describes generation {}",
                name, manifest.generation
            )));
        }
        Ok(manifest)
    }

    /// The number of the newest committed generation.
    pub fn latest(&self) -> Result<Option<usize>> {
        let mut latest = None;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(k) = name
                .to_str()
                .and_then(|n| n.strip_prefix(GENERATION_PREFIX))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if entry.path().join(MANIFEST).exists() {
                latest = latest.max(Some(k));
            }
        }
        Ok(latest)
    }

    /// Removes staging generations left behind by an interrupted run.
    pub fn remove_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let stale = name
                .to_str()
                .is_some_and(|n| n.starts_with(GENERATION_PREFIX) && n.ends_with(STAGING_SUFFIX));
            if stale {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale staging generation(s)", removed);
        }
        Ok(removed)
    }

    /// Seeds generation 0 from decoded `(id, adjacency)` pairs.
    ///
    /// Ids must be exactly `0..N`, each appearing once, and every neighbor
    /// must be one of them. Each node starts with mass `ln(1/N)`; nodes are
    /// laid out with `partitioner` and sorted by id inside each partition.
    pub fn create<I, P>(&self, graph: I, partitions: usize, partitioner: &P) -> Result<Manifest>
    where
        I: IntoIterator<Item = (NodeId, Vec<NodeId>)>,
        P: Partitioner,
    {
        if partitions == 0 {
            return Err(RankError::InvalidParameter(String::from(
                "at least one partition is required",
            )));
        }
        if self.latest()?.is_some() {
            return Err(RankError::InvalidParameter(format!(
                "{} already holds a generation",
                self.root.display()
            )));
        }

        let graph: Vec<(NodeId, Vec<NodeId>)> = graph.into_iter().collect();
        let n = graph.len();
        if n == 0 {
            return Err(RankError::InvalidGraph(String::from("the graph has no nodes")));
        }
        if n > NodeId::MAX as usize {
            return Err(RankError::InvalidGraph(format!("{} nodes do not fit node ids", n)));
        }

        let mut seen = vec![false; n];
        let mut parts: Vec<Vec<Node>> = vec![Vec::new(); partitions];
        let mass = -(n as f64).ln() as f32;
        for (id, adjacency) in graph {
            match seen.get_mut(id as usize) {
                None => {
                    return Err(RankError::InvalidGraph(format!(
                        "node id {} outside 0..{}",
                        id, n
                    )))
                }
                Some(true) => {
                    return Err(RankError::InvalidGraph(format!("node {} appears twice", id)))
                }
                Some(s) => *s = true,
            }
            if let Some(bad) = adjacency.iter().find(|&&t| t as usize >= n) {
                return Err(RankError::InvalidGraph(format!(
                    "node {} links to unknown node {}",
                    id, bad
                )));
            }
            parts[partitioner.partition(partitions, id)].push(Node::new(id, mass, adjacency));
        }

        self.begin_generation(0)?;
        for (p, mut nodes) in parts.into_iter().enumerate() {
            nodes.sort_unstable_by_key(|node| node.id);
            let mut w = RecordFileWriter::create(self.staging_partition_path(0, p))?;
            for node in nodes {
                w.write_node(node)?;
            }
            w.commit()?;
        }
        let manifest = Manifest::new(0, n, partitions, partitioner.name());
        self.commit_generation(&manifest)?;
        info!(
            "Created generation 0 with {} nodes in {} partition(s)",
            n, partitions
        );
        Ok(manifest)
    }

    /// Opens partition `p` of committed generation `k`.
    pub fn read_partition(
        &self,
        k: usize,
        p: usize,
    ) -> Result<NodeReader<RecordReader<BufReader<fs::File>>>> {
        NodeReader::open(self.partition_path(k, p))
    }

    /// Loads every node of generation `k`, sorted by id.
    pub fn read_generation(&self, k: usize) -> Result<Vec<Node>> {
        let manifest = self.manifest(k)?;
        let mut nodes = Vec::with_capacity(manifest.nodes);
        for p in 0..manifest.partitions {
            for node in self.read_partition(k, p)? {
                nodes.push(node?);
            }
        }
        nodes.sort_unstable_by_key(|node| node.id);
        if nodes.len() != manifest.nodes {
            return Err(RankError::Corrupt(format!(
                "generation {} holds {} nodes, manifest says {}",
                k,
                nodes.len(),
                manifest.nodes
            )));
        }
        Ok(nodes)
    }
}

fn part_name(p: usize) -> String {
    format!("part-{:05}", p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::ModPartitioner;

    fn cycle(n: u32) -> Vec<(NodeId, Vec<NodeId>)> {
        (0..n).map(|i| (i, vec![(i + 1) % n])).collect()
    }

    #[test]
    fn test_create_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        assert_eq!(store.latest().unwrap(), None);

        let m = store.create(cycle(5).into_iter().rev(), 2, &ModPartitioner).unwrap();
        assert_eq!((m.generation, m.nodes, m.partitions), (0, 5, 2));
        assert_eq!(store.latest().unwrap(), Some(0));
        assert_eq!(store.manifest(0).unwrap(), m);

        // Partition 1 holds the odd ids, ascending.
        let odd: Vec<NodeId> = store
            .read_partition(0, 1)
            .unwrap()
            .map(|n| n.unwrap().id)
            .collect();
        assert_eq!(odd, vec![1, 3]);

        let nodes = store.read_generation(0).unwrap();
        assert_eq!(nodes.len(), 5);
        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(node.id, i as NodeId);
            assert!((node.mass as f64 - (0.2f64).ln()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_create_rejects_bad_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        let dup = vec![(0, vec![1]), (1, vec![]), (1, vec![0])];
        assert!(matches!(
            store.create(dup, 1, &ModPartitioner),
            Err(RankError::InvalidGraph(_))
        ));
        let sparse = vec![(0, vec![]), (2, vec![])];
        assert!(matches!(
            store.create(sparse, 1, &ModPartitioner),
            Err(RankError::InvalidGraph(_))
        ));
        let dangling_link = vec![(0, vec![5])];
        assert!(matches!(
            store.create(dangling_link, 1, &ModPartitioner),
            Err(RankError::InvalidGraph(_))
        ));
        assert!(store.create(Vec::new(), 1, &ModPartitioner).is_err());
        assert_eq!(store.latest().unwrap(), None);
    }

    #[test]
    fn test_committed_generation_is_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        store.create(cycle(3), 1, &ModPartitioner).unwrap();
        assert!(store.begin_generation(0).is_err());
        assert!(store.create(cycle(3), 1, &ModPartitioner).is_err());
    }

    #[test]
    fn test_uncommitted_generation_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = GenerationStore::open(dir.path()).unwrap();
        let m = store.create(cycle(3), 1, &ModPartitioner).unwrap();

        store.begin_generation(1).unwrap();
        // A commit with missing partitions is refused.
        assert!(store.commit_generation(&m.next()).is_err());
        assert_eq!(store.latest().unwrap(), Some(0));

        assert_eq!(store.remove_stale().unwrap(), 1);
        assert_eq!(store.remove_stale().unwrap(), 0);
    }
}
