use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// External ANN index contract, keyed by chunk id.
///
/// The on-disk format and distance metric belong to the implementation; the
/// engine only relies on these operations. The relational store stays
/// authoritative: the engine reconciles stale index entries on startup.
pub trait VectorIndex: Send {
    /// Adds (or replaces) a vector under `chunk_id`. Returns false if the
    /// vector is unusable; the caller then leaves `has_embedding` unset so a
    /// later pass can retry.
    fn add(&mut self, embedding: &[f32], chunk_id: i64) -> bool;

    fn remove(&mut self, chunk_id: i64);

    /// Top-`k` nearest chunk ids, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<i64>;

    fn save(&mut self) -> Result<()>;

    /// Loads the persisted index; false on failure.
    fn load(&mut self) -> bool;

    fn file_exists(&self) -> bool;

    fn is_loaded(&self) -> bool;

    /// All stored chunk ids, for reconciliation against the relational store.
    fn keys(&self) -> Vec<i64>;
}

/// Brute-force cosine index persisted as JSON next to the database.
///
/// Good enough for the corpus sizes a local folder index sees; anything
/// larger can swap in a real ANN structure behind [`VectorIndex`].
pub struct FlatIndex {
    path: PathBuf,
    entries: HashMap<i64, Vec<f32>>,
    loaded: bool,
}

impl FlatIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: HashMap::new(),
            loaded: false,
        }
    }

    pub fn index_file_name(version: i32) -> String {
        format!("localdocs_embeddings_v{version}.json")
    }

    pub fn at_dir(dir: &Path, version: i32) -> Self {
        Self::new(dir.join(Self::index_file_name(version)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, embedding: &[f32], chunk_id: i64) -> bool {
        if embedding.is_empty() {
            return false;
        }
        self.entries.insert(chunk_id, embedding.to_vec());
        self.loaded = true;
        true
    }

    fn remove(&mut self, chunk_id: i64) {
        self.entries.remove(&chunk_id);
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<i64> {
        if query.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(i64, f32)> = self
            .entries
            .iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(&id, v)| (id, cosine(query, v)))
            .collect();
        // Deterministic order: best score first, chunk id breaks ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }

    fn save(&mut self) -> Result<()> {
        let serializable: HashMap<String, &Vec<f32>> = self
            .entries
            .iter()
            .map(|(id, v)| (id.to_string(), v))
            .collect();
        let data = serde_json::to_vec(&serializable).context("failed to encode vector index")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("failed to write vector index at {}", self.path.display()))?;
        Ok(())
    }

    fn load(&mut self) -> bool {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("cannot read vector index {}: {e}", self.path.display());
                return false;
            }
        };
        let parsed: HashMap<String, Vec<f32>> = match serde_json::from_slice(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("cannot parse vector index {}: {e}", self.path.display());
                return false;
            }
        };
        self.entries = parsed
            .into_iter()
            .filter_map(|(id, v)| id.parse::<i64>().ok().map(|id| (id, v)))
            .collect();
        self.loaded = true;
        log::info!("loaded vector index with {} entries", self.entries.len());
        true
    }

    fn file_exists(&self) -> bool {
        self.path.exists()
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.entries.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}
