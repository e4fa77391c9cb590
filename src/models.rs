use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A watched directory root. Destroyed only when no collection references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub path: String,
}

/// A scanned file inside a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub folder_id: i64,
    /// Last modification time in milliseconds since the Unix epoch.
    pub mtime_ms: i64,
    pub path: String,
}

/// A unit of retrievable text, mirrored into the FTS shadow table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: i64,
    pub document_id: i64,
    pub text: String,
    pub file: String,
    pub title: String,
    pub author: String,
    pub subject: String,
    pub keywords: String,
    pub page: i64,
    pub line_from: i64,
    pub line_to: i64,
    pub words: i64,
    pub tokens: i64,
    pub has_embedding: bool,
}

/// A chunk waiting to be embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingChunk {
    pub folder_id: i64,
    pub chunk_id: i64,
    pub text: String,
}

/// A completed embedding delivered by the embedder.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub folder_id: i64,
    pub chunk_id: i64,
    pub embedding: Vec<f32>,
}

/// An entry in a per-folder scan queue.
///
/// `current_page` / `current_position` carry resumption state for documents
/// that span more than one worker tick; such documents are re-queued at the
/// front of their folder's queue with `currently_processing` set.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub folder_id: i64,
    pub path: PathBuf,
    pub size: u64,
    pub is_pdf: bool,
    pub currently_processing: bool,
    pub current_page: usize,
    pub current_position: u64,
}

impl DocumentInfo {
    pub fn new(folder_id: i64, path: PathBuf, size: u64) -> Self {
        let is_pdf = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        Self {
            folder_id,
            path,
            size,
            is_pdf,
            currently_processing: false,
            current_page: 0,
            current_position: 0,
        }
    }
}

/// Progress snapshot for one folder attachment, emitted as an immutable value
/// event. The engine keeps the authoritative copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionItem {
    pub collection: String,
    pub folder_path: String,
    pub folder_id: i64,
    pub indexing: bool,
    pub installed: bool,
    pub force_indexing: bool,
    pub current_docs_to_index: usize,
    pub total_docs_to_index: usize,
    pub current_bytes_to_index: u64,
    pub total_bytes_to_index: u64,
    pub current_embeddings_to_index: usize,
    pub total_embeddings_to_index: usize,
    pub total_docs: i64,
    pub total_words: i64,
    pub total_tokens: i64,
    pub file_currently_processing: String,
    pub error: String,
    pub embedding_model: String,
    /// Milliseconds since the Unix epoch, if the collection was ever synced.
    pub last_update: Option<i64>,
}

impl CollectionItem {
    pub fn new(collection: &str, folder_path: &str, folder_id: i64) -> Self {
        Self {
            collection: collection.to_string(),
            folder_path: folder_path.to_string(),
            folder_id,
            ..Default::default()
        }
    }
}

/// Value events produced by the engine for subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    CollectionAdded(CollectionItem),
    CollectionUpdated(CollectionItem),
    FolderRemoved { folder_id: i64 },
    ValidityChanged { valid: bool },
}

/// A single retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultInfo {
    pub file: String,
    pub title: String,
    pub author: String,
    /// Formatted document modification date, e.g. "2024, March 05".
    pub date: String,
    pub text: String,
    pub page: i64,
    pub line_from: i64,
    pub line_to: i64,
}

/// Per-folder aggregate statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatistics {
    pub total_docs: i64,
    pub total_words: i64,
    pub total_tokens: i64,
}
