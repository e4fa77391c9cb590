use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::config::EngineSettings;
use crate::db::DB_VERSION;
use crate::embedder::Embedder;
use crate::engine::Engine;
use crate::models::{EmbeddingResult, EngineEvent, ResultInfo};
use crate::pdf::{PdfExtractBackend, PdfExtractor};
use crate::vector_index::{FlatIndex, VectorIndex};

/// Poll interval while no scan work is queued. Watcher events, embedder
/// completions, and user requests all arrive through the channel, so the
/// timeout only bounds shutdown latency.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Everything the worker thread reacts to. Callers on other threads post
/// messages; the engine itself never runs off-thread.
#[derive(Debug)]
pub enum Message {
    AddFolder {
        collection: String,
        path: PathBuf,
    },
    RemoveFolder {
        collection: String,
        path: PathBuf,
    },
    ForceIndexing {
        collection: String,
    },
    ChangeChunkSize {
        chunk_size: usize,
    },
    DirectoryChanged {
        path: PathBuf,
    },
    EmbeddingsReady {
        results: Vec<EmbeddingResult>,
    },
    EmbeddingFailed {
        folder_id: i64,
        error: String,
    },
    Retrieve {
        collections: Vec<String>,
        text: String,
        k: usize,
        reply: Sender<Vec<ResultInfo>>,
    },
    Stop,
}

/// Completion channel handed to the embedder with every async batch.
#[derive(Clone, Debug)]
pub struct EmbeddingSink {
    tx: Sender<Message>,
}

impl EmbeddingSink {
    pub fn new(tx: Sender<Message>) -> Self {
        Self { tx }
    }

    pub fn complete(&self, results: Vec<EmbeddingResult>) {
        let _ = self.tx.send(Message::EmbeddingsReady { results });
    }

    pub fn fail(&self, folder_id: i64, error: String) {
        let _ = self.tx.send(Message::EmbeddingFailed { folder_id, error });
    }
}

/// Owning handle over the background worker thread. Dropping (or calling
/// [`EngineHandle::stop`]) shuts the worker down and joins it.
pub struct EngineHandle {
    tx: Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Spawns the worker with the default vector index and PDF backend.
    pub fn spawn(
        settings: EngineSettings,
        embedder: Box<dyn Embedder>,
        events: Option<Sender<EngineEvent>>,
    ) -> Result<Self> {
        let vector = Box::new(FlatIndex::at_dir(&settings.index_dir, DB_VERSION));
        Self::spawn_with(settings, embedder, vector, Box::new(PdfExtractBackend), events)
    }

    pub fn spawn_with(
        settings: EngineSettings,
        embedder: Box<dyn Embedder>,
        vector: Box<dyn VectorIndex>,
        extractor: Box<dyn PdfExtractor>,
        events: Option<Sender<EngineEvent>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let worker_tx = tx.clone();

        let thread = std::thread::Builder::new()
            .name("docdex-worker".into())
            .spawn(move || {
                let mut engine =
                    match Engine::new(settings, embedder, vector, extractor, worker_tx, events) {
                        Ok(engine) => engine,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let started = engine.start();
                let failed = started.is_err();
                let _ = ready_tx.send(started);
                if failed {
                    return;
                }
                run(&mut engine, rx);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                anyhow::bail!("engine worker exited during startup")
            }
        }
    }

    pub fn sender(&self) -> Sender<Message> {
        self.tx.clone()
    }

    pub fn add_folder(&self, collection: &str, path: impl Into<PathBuf>) {
        let _ = self.tx.send(Message::AddFolder {
            collection: collection.to_string(),
            path: path.into(),
        });
    }

    pub fn remove_folder(&self, collection: &str, path: impl Into<PathBuf>) {
        let _ = self.tx.send(Message::RemoveFolder {
            collection: collection.to_string(),
            path: path.into(),
        });
    }

    pub fn force_indexing(&self, collection: &str) {
        let _ = self.tx.send(Message::ForceIndexing {
            collection: collection.to_string(),
        });
    }

    pub fn change_chunk_size(&self, chunk_size: usize) {
        let _ = self.tx.send(Message::ChangeChunkSize { chunk_size });
    }

    /// Synchronous hybrid retrieval through the worker. Failures come back as
    /// an empty result list; details land in the log.
    pub fn retrieve(&self, collections: &[String], text: &str, k: usize) -> Vec<ResultInfo> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let sent = self.tx.send(Message::Retrieve {
            collections: collections.to_vec(),
            text: text.to_string(),
            k,
            reply: reply_tx,
        });
        if sent.is_err() {
            return Vec::new();
        }
        reply_rx.recv().unwrap_or_default()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(Message::Stop);
            let _ = thread.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(engine: &mut Engine, rx: Receiver<Message>) {
    loop {
        let timeout = if engine.has_pending_work() {
            Duration::ZERO
        } else {
            IDLE_POLL
        };
        match rx.recv_timeout(timeout) {
            Ok(Message::Stop) => break,
            Ok(message) => dispatch(engine, message),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if engine.has_pending_work() {
            if let Err(e) = engine.scan_tick() {
                log::warn!("scan tick failed: {e:#}");
            }
        }
    }
    log::debug!("engine worker stopped");
}

fn dispatch(engine: &mut Engine, message: Message) {
    match message {
        Message::AddFolder { collection, path } => {
            if let Err(e) = engine.add_folder(&collection, &path) {
                log::warn!("cannot add folder {}: {e:#}", path.display());
            }
        }
        Message::RemoveFolder { collection, path } => {
            if let Err(e) = engine.remove_folder(&collection, &path) {
                log::warn!("cannot remove folder {}: {e:#}", path.display());
            }
        }
        Message::ForceIndexing { collection } => {
            if let Err(e) = engine.force_indexing(&collection) {
                log::warn!("cannot force-index {collection}: {e:#}");
            }
        }
        Message::ChangeChunkSize { chunk_size } => {
            if let Err(e) = engine.change_chunk_size(chunk_size) {
                log::warn!("cannot change chunk size: {e:#}");
            }
        }
        Message::DirectoryChanged { path } => engine.directory_changed(&path),
        Message::EmbeddingsReady { results } => engine.handle_embeddings(results),
        Message::EmbeddingFailed { folder_id, error } => {
            engine.handle_embedding_error(folder_id, &error)
        }
        Message::Retrieve {
            collections,
            text,
            k,
            reply,
        } => {
            let results = engine.retrieve(&collections, &text, k).unwrap_or_else(|e| {
                log::warn!("retrieval failed: {e:#}");
                Vec::new()
            });
            let _ = reply.send(results);
        }
        Message::Stop => {}
    }
}
