use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine configuration. Passed in at construction; the engine never reads
/// settings from a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Directory holding the database and the vector index file.
    pub index_dir: PathBuf,

    /// Target chunk length in characters (sum of word lengths plus single
    /// joining spaces).
    pub chunk_size: usize,

    /// Number of chunks buffered before an embedding batch is dispatched.
    pub batch_size: usize,

    /// Soft per-tick budget in milliseconds, checked between documents.
    pub tick_budget_ms: u64,

    /// Whether to register filesystem watches for tracked folders. Disabled
    /// in tests that drive directory events by hand.
    pub watch_folders: bool,
}

impl EngineSettings {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("."),
            chunk_size: 512,
            batch_size: 100,
            tick_budget_ms: 100,
            watch_folders: true,
        }
    }
}
