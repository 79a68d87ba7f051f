//! Graph store
//!
//! Persists knowledge graphs by name. The default backend writes one
//! `<name>.kg.json` per graph under a root directory, atomically
//! (temp file + rename), fronted by an in-process cache that gives
//! read-your-writes and serializes concurrent writers on the same name
//! (last writer wins, atomically).

use parking_lot::RwLock;
use reconkg_model::graph::{GraphPattern, KnowledgeGraph, NodeLabel, PathStep, Relationship};
use reconkg_model::InvariantViolation;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("knowledge graph `{0}` not found")]
    NotFound(String),
    #[error("invariant violation in graph `{name}`: {source}")]
    Invariant {
        name: String,
        #[source]
        source: InvariantViolation,
    },
    #[error("store I/O failure for `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt graph document `{name}`: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a [`GraphPattern`] query.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternMatch {
    Edges(Vec<Relationship>),
    Paths(Vec<Vec<PathStep>>),
    Stats {
        nodes_by_label: BTreeMap<String, usize>,
        edges_by_type: BTreeMap<String, usize>,
    },
}

/// Capability set of a graph backend. The filesystem store is the default;
/// anything that can round-trip the three JSON groupings per KG name
/// (`nodes`, `relationships`, `metadata`) is acceptable.
pub trait GraphStore: Send + Sync {
    /// Atomically replace the KG with this name.
    fn put(&self, kg: &KnowledgeGraph) -> Result<(), StoreError>;
    fn get(&self, name: &str) -> Result<KnowledgeGraph, StoreError>;
    fn list(&self) -> Result<Vec<String>, StoreError>;
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    fn exists(&self, name: &str) -> bool;

    /// Best-effort subgraph query.
    fn query(&self, name: &str, pattern: &GraphPattern) -> Result<PatternMatch, StoreError> {
        let kg = self.get(name)?;
        Ok(run_pattern(&kg, pattern))
    }
}

// ============================================================================
// Filesystem store
// ============================================================================

const IO_RETRIES: u32 = 3;

pub struct FsGraphStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, KnowledgeGraph>>,
}

impl FsGraphStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            name: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.kg.json"))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8], name: &str) -> Result<(), StoreError> {
        let tmp = path.with_extension("kg.json.tmp");
        let mut last_err = None;
        for attempt in 0..IO_RETRIES {
            let result = std::fs::write(&tmp, bytes)
                .and_then(|()| std::fs::rename(&tmp, path));
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(graph = name, attempt, error = %e, "store write failed, retrying");
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(50 << attempt));
                }
            }
        }
        Err(StoreError::Io {
            name: name.to_string(),
            source: last_err.unwrap_or_else(|| std::io::Error::other("write failed")),
        })
    }
}

impl GraphStore for FsGraphStore {
    fn put(&self, kg: &KnowledgeGraph) -> Result<(), StoreError> {
        kg.verify_invariants().map_err(|source| StoreError::Invariant {
            name: kg.name.clone(),
            source,
        })?;

        // Hold the write lock across serialize + rename so concurrent writers
        // on the same name serialize and the cache never disagrees with disk.
        let mut cache = self.cache.write();
        let bytes = serde_json::to_vec_pretty(kg).map_err(|source| StoreError::Corrupt {
            name: kg.name.clone(),
            source,
        })?;
        self.write_atomic(&self.path_of(&kg.name), &bytes, &kg.name)?;
        cache.insert(kg.name.clone(), kg.clone());
        debug!(graph = %kg.name, nodes = kg.nodes.len(),
               relationships = kg.relationships.len(), "persisted knowledge graph");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<KnowledgeGraph, StoreError> {
        if let Some(kg) = self.cache.read().get(name) {
            return Ok(kg.clone());
        }
        let path = self.path_of(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            name: name.to_string(),
            source,
        })?;
        let kg: KnowledgeGraph =
            serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
                name: name.to_string(),
                source,
            })?;
        self.cache.write().insert(name.to_string(), kg.clone());
        Ok(kg)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            name: self.root.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                name: self.root.display().to_string(),
                source,
            })?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".kg.json") {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_of(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        std::fs::remove_file(&path).map_err(|source| StoreError::Io {
            name: name.to_string(),
            source,
        })?;
        self.cache.write().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.cache.read().contains_key(name) || self.path_of(name).exists()
    }
}

// ============================================================================
// Pattern queries
// ============================================================================

pub fn run_pattern(kg: &KnowledgeGraph, pattern: &GraphPattern) -> PatternMatch {
    match pattern {
        GraphPattern::NeighborsOf { node_id } => PatternMatch::Edges(
            kg.edges_of(node_id).into_iter().cloned().collect(),
        ),
        GraphPattern::EdgesBetween { table_a, table_b } => {
            let edges = kg
                .relationships
                .iter()
                .filter(|r| {
                    let between = |a: &str, b: &str| {
                        (r.source_id.starts_with(a) || r.source_id == a)
                            && (r.target_id.starts_with(b) || r.target_id == b)
                    };
                    between(table_a, table_b) || between(table_b, table_a)
                })
                .cloned()
                .collect();
            PatternMatch::Edges(edges)
        }
        GraphPattern::PathsUpTo {
            source_id,
            target_id,
            max_hops,
        } => PatternMatch::Paths(find_paths(kg, source_id, target_id, *max_hops)),
        GraphPattern::Stats => {
            let mut nodes_by_label = BTreeMap::new();
            for node in &kg.nodes {
                let label = match node.label {
                    NodeLabel::Table => "TABLE",
                    NodeLabel::Column => "COLUMN",
                    NodeLabel::Entity => "ENTITY",
                };
                *nodes_by_label.entry(label.to_string()).or_insert(0) += 1;
            }
            let mut edges_by_type = BTreeMap::new();
            for rel in &kg.relationships {
                let key = serde_json::to_value(rel.rel_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                *edges_by_type.entry(key).or_insert(0) += 1;
            }
            PatternMatch::Stats {
                nodes_by_label,
                edges_by_type,
            }
        }
    }
}

/// Bounded-length paths between two table nodes.
///
/// Paths walk table-to-table edges in either direction. Results are sorted
/// best-first: lowest summed type priority (FOREIGN_KEY before REFERENCES
/// before CROSS_SCHEMA_REFERENCE), then lowest total `1 - confidence`.
pub fn find_paths(
    kg: &KnowledgeGraph,
    source_id: &str,
    target_id: &str,
    max_hops: usize,
) -> Vec<Vec<PathStep>> {
    // Adjacency over table nodes only; column-level edges do not extend paths.
    let table_ids: std::collections::HashSet<&str> = kg.table_ids().into_iter().collect();
    let mut adjacency: HashMap<&str, Vec<(&Relationship, bool)>> = HashMap::new();
    for rel in &kg.relationships {
        if table_ids.contains(rel.source_id.as_str()) && table_ids.contains(rel.target_id.as_str())
        {
            adjacency
                .entry(rel.source_id.as_str())
                .or_default()
                .push((rel, true));
            adjacency
                .entry(rel.target_id.as_str())
                .or_default()
                .push((rel, false));
        }
    }

    let mut paths = Vec::new();
    let mut queue: VecDeque<(String, Vec<PathStep>)> = VecDeque::new();
    queue.push_back((source_id.to_string(), Vec::new()));

    while let Some((current, path)) = queue.pop_front() {
        if path.len() >= max_hops {
            continue;
        }
        let Some(edges) = adjacency.get(current.as_str()) else {
            continue;
        };
        for (rel, forward) in edges {
            let next = if *forward { &rel.target_id } else { &rel.source_id };
            if path.iter().any(|s| s.from_id == *next) || *next == source_id {
                continue;
            }
            let (source_column, target_column) = if *forward {
                (
                    rel.property_str("source_column").map(str::to_string),
                    rel.property_str("target_column").map(str::to_string),
                )
            } else {
                (
                    rel.property_str("target_column").map(str::to_string),
                    rel.property_str("source_column").map(str::to_string),
                )
            };
            let step = PathStep {
                from_id: current.clone(),
                to_id: next.clone(),
                rel_type: rel.rel_type,
                confidence: rel.confidence,
                source_column,
                target_column,
            };
            let mut extended = path.clone();
            extended.push(step);
            if next == target_id {
                paths.push(extended);
            } else {
                queue.push_back((next.clone(), extended));
            }
        }
    }

    paths.sort_by(|a, b| path_score(a).partial_cmp(&path_score(b)).unwrap_or(std::cmp::Ordering::Equal));
    paths
}

/// `(summed type priority, total 1 - confidence)` as a single comparable.
fn path_score(path: &[PathStep]) -> (u32, f64) {
    let priority: u32 = path.iter().map(|s| s.rel_type.path_priority() as u32).sum();
    let cost: f64 = path.iter().map(|s| 1.0 - s.confidence).sum();
    (priority, cost)
}
