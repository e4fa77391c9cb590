pub mod chunker;
pub mod config;
pub mod db;
pub mod embedder;
pub mod engine;
pub mod models;
pub mod pdf;
pub mod progress;
pub mod search;
pub mod vector_index;
pub mod watcher;
pub mod worker;

pub use config::EngineSettings;
pub use embedder::Embedder;
pub use engine::Engine;
pub use models::{CollectionItem, EngineEvent, ResultInfo};
pub use pdf::{PdfExtractor, PdfPages};
pub use vector_index::{FlatIndex, VectorIndex};
pub use worker::{EngineHandle, Message};
