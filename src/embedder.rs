use crate::models::EmbeddingChunk;
use crate::worker::EmbeddingSink;

/// External embedding service contract.
///
/// `embed_async` must eventually deliver one result per chunk through the
/// sink, or report a per-folder failure; the engine applies completions on
/// its own thread. `embed_sync` is used for retrieval queries only.
pub trait Embedder: Send {
    /// The active model name. Empty means no model is available, in which
    /// case folder attachment is refused.
    fn model_name(&self) -> String;

    /// Embed a query synchronously. An empty vector signals failure and makes
    /// retrieval fall back to full-text search.
    fn embed_sync(&self, text: &str) -> Vec<f32>;

    /// Embed a batch of chunks asynchronously, posting completions or a
    /// per-folder error through `sink`.
    fn embed_async(&self, chunks: Vec<EmbeddingChunk>, sink: EmbeddingSink);
}

/// Buffers chunks bound for the embedder and dispatches them in fixed-size
/// batches. A batch also goes out whenever a folder's scan queue drains.
pub struct Batcher {
    buffer: Vec<EmbeddingChunk>,
    batch_size: usize,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    pub fn push(&mut self, chunk: EmbeddingChunk, embedder: &dyn Embedder, sink: &EmbeddingSink) {
        self.buffer.push(chunk);
        if self.buffer.len() >= self.batch_size {
            self.flush(embedder, sink);
        }
    }

    pub fn flush(&mut self, embedder: &dyn Embedder, sink: &EmbeddingSink) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        log::debug!("dispatching embedding batch of {}", batch.len());
        embedder.embed_async(batch, sink.clone());
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
