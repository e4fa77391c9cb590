use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Cursor, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::chunker::Chunker;
use crate::config::EngineSettings;
use crate::db::{NewChunk, Store, DB_VERSION};
use crate::embedder::{Batcher, Embedder};
use crate::models::{
    CollectionItem, Document, DocumentInfo, EmbeddingChunk, EmbeddingResult, EngineEvent,
    ResultInfo,
};
use crate::pdf::PdfExtractor;
use crate::progress::CollectionMap;
use crate::search;
use crate::vector_index::VectorIndex;
use crate::watcher::FolderWatch;
use crate::worker::{EmbeddingSink, Message};

/// File extensions picked up during folder enumeration.
const EXTENSIONS: &[&str] = &["txt", "pdf", "md", "rst"];

/// Cap on chunks emitted per text-file pass; larger files resume at the
/// recorded byte position on the next tick.
const MAX_TEXT_CHUNKS_PER_PASS: usize = 100;

/// The indexing core. Owns the relational store, the vector index, the scan
/// queues, and the embedding batcher; every mutation runs on the single
/// worker thread that drives it.
pub struct Engine {
    settings: EngineSettings,
    store: Store,
    vector: Box<dyn VectorIndex>,
    embedder: Box<dyn Embedder>,
    extractor: Box<dyn PdfExtractor>,
    batcher: Batcher,
    /// Per-folder FIFO queues. BTreeMap keeps the first-key draw order
    /// deterministic.
    docs_to_scan: BTreeMap<i64, VecDeque<DocumentInfo>>,
    collections: CollectionMap,
    watch: Option<FolderWatch>,
    tx: Sender<Message>,
    legacy: Vec<CollectionItem>,
    valid: bool,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        embedder: Box<dyn Embedder>,
        vector: Box<dyn VectorIndex>,
        extractor: Box<dyn PdfExtractor>,
        tx: Sender<Message>,
        events: Option<Sender<EngineEvent>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.index_dir).with_context(|| {
            format!("cannot create index directory {}", settings.index_dir.display())
        })?;
        let (store, legacy) = Store::open_latest(&settings.index_dir)?;
        let watch = if settings.watch_folders {
            match FolderWatch::new(tx.clone()) {
                Ok(watch) => Some(watch),
                Err(e) => {
                    log::warn!("filesystem watching unavailable: {e:#}");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            batcher: Batcher::new(settings.batch_size),
            settings,
            store,
            vector,
            embedder,
            extractor,
            docs_to_scan: BTreeMap::new(),
            collections: CollectionMap::new(events),
            watch,
            tx,
            legacy,
            valid: true,
        })
    }

    /// Completes startup: carries migrated collections over, loads the vector
    /// index, reconciles it against the relational store, and re-attaches
    /// every known folder (re-dispatching unfinished embeddings).
    pub fn start(&mut self) -> Result<()> {
        let legacy = std::mem::take(&mut self.legacy);
        if !legacy.is_empty() {
            self.store.begin()?;
            let mut carried = true;
            for item in &legacy {
                if let Err(e) = self.add_forced_collection(item) {
                    log::warn!(
                        "cannot carry over collection {} at {}: {e:#}",
                        item.collection,
                        item.folder_path
                    );
                    carried = false;
                    break;
                }
            }
            if carried {
                self.store.commit()?;
            } else {
                self.store.rollback()?;
                self.set_valid(false);
            }
        }

        if self.valid && self.vector.file_exists() {
            if self.vector.load() {
                self.reconcile_vector_index();
            } else {
                log::warn!("could not load vector index");
                self.set_valid(false);
            }
        }

        if self.valid {
            self.add_current_folders()?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn set_valid(&mut self, valid: bool) {
        if self.valid != valid {
            self.valid = valid;
            self.collections.emit(EngineEvent::ValidityChanged { valid });
        }
    }

    fn sink(&self) -> EmbeddingSink {
        EmbeddingSink::new(self.tx.clone())
    }

    /// Re-inserts a collection read from an older database version. Content
    /// is not migrated; the user re-triggers indexing explicitly.
    fn add_forced_collection(&mut self, item: &CollectionItem) -> Result<()> {
        let model = self.embedder.model_name();
        if model.is_empty() {
            bail!("no embedding model available");
        }
        let (folder_id, canonical) = self.check_and_add_folder(Path::new(&item.folder_path))?;
        self.store
            .add_collection(&item.collection, folder_id, None, &model, true)?;

        let mut carried = CollectionItem::new(
            &item.collection,
            &canonical.to_string_lossy(),
            folder_id,
        );
        carried.force_indexing = true;
        carried.installed = true;
        carried.embedding_model = model;
        self.collections.insert(carried);
        Ok(())
    }

    /// Canonicalizes the path and finds or inserts its folder row.
    fn check_and_add_folder(&mut self, path: &Path) -> Result<(i64, PathBuf)> {
        let canonical = std::fs::canonicalize(path)
            .with_context(|| format!("folder {} does not exist or is unreadable", path.display()))?;
        let canonical_str = canonical.to_string_lossy().to_string();
        let folder_id = match self.store.folder_id_for_path(&canonical_str)? {
            Some(id) => id,
            None => self.store.add_folder(&canonical_str)?,
        };
        Ok((folder_id, canonical))
    }

    /// Drops vector entries whose chunk no longer claims an embedding. Such
    /// orphans appear when a crash lands between a relational commit and the
    /// vector persist; the relational store wins.
    fn reconcile_vector_index(&mut self) {
        let completed: HashSet<i64> = match self.store.completed_chunk_ids() {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                log::warn!("cannot read completed chunks for reconciliation: {e:#}");
                return;
            }
        };
        let orphans: Vec<i64> = self
            .vector
            .keys()
            .into_iter()
            .filter(|id| !completed.contains(id))
            .collect();
        if orphans.is_empty() {
            return;
        }
        log::info!("removing {} stale vector index entries", orphans.len());
        for chunk_id in &orphans {
            self.vector.remove(*chunk_id);
        }
        if let Err(e) = self.vector.save() {
            log::warn!("cannot persist vector index: {e:#}");
        }
    }

    fn add_current_folders(&mut self) -> Result<()> {
        let items = self.store.all_collections(DB_VERSION)?;
        self.collections.replace_all(items.clone());

        for item in &items {
            if item.force_indexing {
                continue;
            }
            self.schedule_uncompleted_embeddings(item.folder_id);
            if let Err(e) = self.add_folder(&item.collection, Path::new(&item.folder_path)) {
                log::warn!(
                    "cannot re-attach folder {} to {}: {e:#}",
                    item.folder_path,
                    item.collection
                );
            }
        }

        self.update_collection_statistics();
        Ok(())
    }

    /// Re-dispatches chunks that never received an embedding, in batch-size
    /// slices.
    fn schedule_uncompleted_embeddings(&mut self, folder_id: i64) {
        let chunks = match self.store.uncompleted_chunks(folder_id) {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("cannot select uncompleted chunks: {e:#}");
                return;
            }
        };
        if chunks.is_empty() {
            return;
        }

        let total = self.store.count_chunks(folder_id).unwrap_or(0) as usize;
        self.collections.with(folder_id, |item| {
            item.total_embeddings_to_index = total;
            item.current_embeddings_to_index = total.saturating_sub(chunks.len());
        });

        let sink = self.sink();
        for batch in chunks.chunks(self.settings.batch_size) {
            self.embedder.embed_async(batch.to_vec(), sink.clone());
        }
    }

    // folder and collection lifecycle

    pub fn add_folder(&mut self, collection: &str, path: &Path) -> Result<()> {
        let model = self.embedder.model_name();
        if model.is_empty() {
            bail!("refusing to attach folder: no embedding model available");
        }
        let (folder_id, canonical) = self.check_and_add_folder(path)?;

        let attached = self.store.folders_for_collection(collection)?;
        if !attached.iter().any(|folder| folder.id == folder_id) {
            self.store
                .add_collection(collection, folder_id, None, &model, false)?;
            let mut item =
                CollectionItem::new(collection, &canonical.to_string_lossy(), folder_id);
            item.embedding_model = model;
            self.collections.insert(item);
        }

        self.add_to_watch(&canonical);
        self.scan_documents(folder_id, &canonical);
        Ok(())
    }

    pub fn remove_folder(&mut self, collection: &str, path: &Path) -> Result<()> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let canonical_str = canonical.to_string_lossy().to_string();
        let Some(folder_id) = self.store.folder_id_for_path(&canonical_str)? else {
            log::warn!("folder {} is not tracked", canonical_str);
            self.remove_from_watch(&canonical);
            return Ok(());
        };
        self.remove_folder_internal(collection, folder_id, &canonical)
    }

    fn remove_folder_internal(
        &mut self,
        collection: &str,
        folder_id: i64,
        path: &Path,
    ) -> Result<()> {
        let referencing = self.store.collections_for_folder(folder_id)?;

        self.store.begin()?;
        let outcome = (|| -> Result<Option<Vec<i64>>> {
            self.store.remove_collection(collection, folder_id)?;

            // Other collections still reference the folder: only the
            // association goes.
            if referencing.len() > 1 {
                return Ok(None);
            }

            let mut chunks_to_remove = Vec::new();
            for document_id in self.store.documents_for_folder(folder_id)? {
                chunks_to_remove.extend(self.store.chunk_ids_for_document(document_id)?);
                self.store.remove_chunks_by_document(document_id)?;
                self.store.remove_document(document_id)?;
            }
            self.store.remove_folder(folder_id)?;
            Ok(Some(chunks_to_remove))
        })();

        match outcome {
            Err(e) => {
                self.store.rollback()?;
                Err(e)
            }
            Ok(None) => {
                self.store.commit()?;
                Ok(())
            }
            Ok(Some(chunks_to_remove)) => {
                // Pending scans for the folder are moot.
                self.docs_to_scan.remove(&folder_id);
                self.store.commit()?;
                for chunk_id in &chunks_to_remove {
                    self.vector.remove(*chunk_id);
                }
                if !chunks_to_remove.is_empty() {
                    if let Err(e) = self.vector.save() {
                        log::warn!("cannot persist vector index: {e:#}");
                    }
                }
                self.collections.remove(folder_id);
                self.remove_from_watch(path);
                Ok(())
            }
        }
    }

    /// Clears the force flag and re-attaches every folder of the collection,
    /// which re-enqueues their scans.
    pub fn force_indexing(&mut self, collection: &str) -> Result<()> {
        let folders = self.store.folders_for_collection(collection)?;
        self.store.clear_force_indexing(collection)?;
        for folder in folders {
            self.collections
                .with(folder.id, |item| item.force_indexing = false);
            if let Err(e) = self.add_folder(collection, Path::new(&folder.path)) {
                log::warn!("cannot re-index folder {}: {e:#}", folder.path);
            }
        }
        Ok(())
    }

    /// Truncates every chunk and document, then re-adds the current folders
    /// so everything is rechunked at the new size.
    pub fn change_chunk_size(&mut self, chunk_size: usize) -> Result<()> {
        if chunk_size == self.settings.chunk_size {
            return Ok(());
        }
        log::info!("changing chunk size to {chunk_size}");
        self.settings.chunk_size = chunk_size;

        let documents = self.store.all_documents()?;
        self.store.begin()?;
        let outcome = (|| -> Result<Vec<i64>> {
            let mut chunks_to_remove = Vec::new();
            for document in &documents {
                chunks_to_remove.extend(self.store.chunk_ids_for_document(document.id)?);
                self.store.remove_chunks_by_document(document.id)?;
                self.store.remove_document(document.id)?;
            }
            Ok(chunks_to_remove)
        })();

        let chunks_to_remove = match outcome {
            Err(e) => {
                self.store.rollback()?;
                return Err(e);
            }
            Ok(chunks) => {
                self.store.commit()?;
                chunks
            }
        };
        for chunk_id in &chunks_to_remove {
            self.vector.remove(*chunk_id);
        }
        if !chunks_to_remove.is_empty() {
            if let Err(e) = self.vector.save() {
                log::warn!("cannot persist vector index: {e:#}");
            }
        }

        self.add_current_folders()
    }

    // scanning

    fn scan_documents(&mut self, folder_id: i64, folder_path: &Path) {
        log::debug!("scanning {} for documents", folder_path.display());

        let mut infos = Vec::new();
        for entry in WalkDir::new(folder_path).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("skipping unreadable entry under {}: {e}", folder_path.display());
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                let dir = entry.path().to_path_buf();
                self.add_to_watch(&dir);
                continue;
            }
            let supported = entry
                .path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext.to_ascii_lowercase())
                .is_some_and(|ext| EXTENSIONS.contains(&ext.as_str()));
            if !supported {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            infos.push(DocumentInfo::new(folder_id, entry.into_path(), size));
        }

        if !infos.is_empty() {
            self.collections.with(folder_id, |item| item.indexing = true);
            self.enqueue_documents(folder_id, infos);
        }
    }

    fn enqueue_documents(&mut self, folder_id: i64, infos: Vec<DocumentInfo>) {
        let queue = self.docs_to_scan.entry(folder_id).or_default();
        for info in infos {
            queue.push_back(info);
        }
        let count = queue.len();
        let bytes: u64 = queue.iter().map(|info| info.size).sum();
        self.collections.with(folder_id, |item| {
            item.current_docs_to_index = count;
            item.total_docs_to_index = count;
            item.current_bytes_to_index = bytes;
            item.total_bytes_to_index = bytes;
        });
    }

    fn enqueue_front(&mut self, info: DocumentInfo) {
        self.docs_to_scan
            .entry(info.folder_id)
            .or_default()
            .push_front(info);
    }

    /// Draws from the first non-empty folder queue.
    fn dequeue_document(&mut self) -> Option<DocumentInfo> {
        let (&folder_id, _) = self.docs_to_scan.iter().next()?;
        let queue = self.docs_to_scan.get_mut(&folder_id)?;
        let info = queue.pop_front();
        if queue.is_empty() {
            self.docs_to_scan.remove(&folder_id);
        }
        info
    }

    fn count_of_documents(&self, folder_id: i64) -> usize {
        self.docs_to_scan.get(&folder_id).map_or(0, VecDeque::len)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.docs_to_scan.is_empty()
    }

    /// One worker tick: a single transaction draining documents until the
    /// queues empty or the time budget runs out. Any per-document failure
    /// rolls the whole tick back; vector removals land only after the commit.
    pub fn scan_tick(&mut self) -> Result<()> {
        if self.docs_to_scan.is_empty() {
            return Ok(());
        }
        let budget = Duration::from_millis(self.settings.tick_budget_ms);
        let started = Instant::now();

        self.store.begin()?;
        let mut chunks_to_remove = Vec::new();
        loop {
            if self.docs_to_scan.is_empty() {
                break;
            }
            if let Err(e) = self.scan_one(&mut chunks_to_remove) {
                log::warn!("scan tick rolled back: {e:#}");
                self.store.rollback()?;
                return Ok(());
            }
            if started.elapsed() >= budget {
                break;
            }
        }
        self.store.commit()?;

        for chunk_id in &chunks_to_remove {
            self.vector.remove(*chunk_id);
        }
        if !chunks_to_remove.is_empty() {
            if let Err(e) = self.vector.save() {
                log::warn!("cannot persist vector index: {e:#}");
            }
        }
        Ok(())
    }

    fn document_error(
        &mut self,
        folder_id: i64,
        remaining: usize,
        op: &str,
        document_path: &str,
        err: anyhow::Error,
    ) -> anyhow::Error {
        log::warn!("{op} failed for {document_path}: {err:#}");
        self.schedule_next(folder_id, remaining);
        err.context(format!("{op} for {document_path}"))
    }

    /// Processes one queue entry: reconcile against the stored document by
    /// mtime, then chunk one PDF page or one capped text slice, re-queueing
    /// at the front when the document has more to give.
    fn scan_one(&mut self, chunks_to_remove: &mut Vec<i64>) -> Result<()> {
        let Some(mut info) = self.dequeue_document() else {
            return Ok(());
        };
        let folder_id = info.folder_id;
        let remaining = self.count_of_documents(folder_id);

        // A vanished or unreadable file is skipped; the cleanup pass owns the
        // cascade.
        let metadata = match std::fs::metadata(&info.path) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::debug!("skipping {}: {e}", info.path.display());
                self.schedule_next(folder_id, remaining);
                return Ok(());
            }
        };
        info.size = metadata.len();
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let canonical = match std::fs::canonicalize(&info.path) {
            Ok(canonical) => canonical,
            Err(e) => {
                log::debug!("skipping {}: {e}", info.path.display());
                self.schedule_next(folder_id, remaining);
                return Ok(());
            }
        };
        let document_path = canonical.to_string_lossy().to_string();
        let currently_processing = info.currently_processing;

        let existing = self
            .store
            .document_for_path(&document_path)
            .map_err(|e| self.document_error(folder_id, remaining, "select document", &document_path, e))?;

        if let Some((_, existing_time)) = existing {
            if !currently_processing && existing_time == mtime_ms {
                // Unchanged since the last scan.
                self.schedule_next(folder_id, remaining);
                return Ok(());
            }
        }

        let mut document_id = existing.map(|(id, _)| id);
        if !currently_processing {
            if let Some((existing_id, _)) = existing {
                // Stale: evict the old chunks before rescanning.
                let old_chunks = self
                    .store
                    .chunk_ids_for_document(existing_id)
                    .map_err(|e| self.document_error(folder_id, remaining, "select chunks", &document_path, e))?;
                chunks_to_remove.extend(old_chunks);
                self.store
                    .remove_chunks_by_document(existing_id)
                    .map_err(|e| self.document_error(folder_id, remaining, "remove chunks", &document_path, e))?;
                self.update_collection_statistics();
                self.store
                    .update_document_time(existing_id, mtime_ms)
                    .map_err(|e| self.document_error(folder_id, remaining, "update document", &document_path, e))?;
            }
        }
        let document_id = match document_id.take() {
            Some(id) => id,
            None => {
                let id = self
                    .store
                    .add_document(folder_id, mtime_ms, &document_path)
                    .map_err(|e| self.document_error(folder_id, remaining, "add document", &document_path, e))?;
                self.collections.with(folder_id, |item| item.total_docs += 1);
                id
            }
        };

        let file_name = info
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if info.is_pdf {
            let doc = self
                .extractor
                .load(&canonical)
                .map_err(|e| self.document_error(folder_id, remaining, "load pdf", &document_path, e))?;
            let page_count = doc.page_count();
            if page_count == 0 {
                self.schedule_next(folder_id, remaining);
                return Ok(());
            }

            let bytes = info.size;
            let bytes_per_page = bytes / page_count as u64;
            let page_index = info.current_page;
            let text = doc
                .page_text(page_index)
                .map_err(|e| self.document_error(folder_id, remaining, "extract pdf page", &document_path, e))?;
            let (title, author, subject, keywords) =
                (doc.title(), doc.author(), doc.subject(), doc.keywords());

            self.chunk_stream(
                Cursor::new(text.into_bytes()),
                folder_id,
                document_id,
                &file_name,
                &title,
                &author,
                &subject,
                &keywords,
                (page_index + 1) as i64,
                0,
            )
            .map_err(|e| self.document_error(folder_id, remaining, "chunk pdf page", &document_path, e))?;

            self.collections.with(folder_id, |item| {
                item.current_bytes_to_index = item.current_bytes_to_index.saturating_sub(bytes_per_page);
            });

            if page_index + 1 < page_count {
                info.current_page += 1;
                info.currently_processing = true;
                self.enqueue_front(info);
                self.schedule_next(folder_id, remaining + 1);
                return Ok(());
            }

            // Last page: account for the rounding remainder.
            let remainder = bytes.saturating_sub(bytes_per_page * page_count as u64);
            self.collections.with(folder_id, |item| {
                item.current_bytes_to_index = item.current_bytes_to_index.saturating_sub(remainder);
            });
        } else {
            let file = std::fs::File::open(&canonical)
                .map_err(|e| self.document_error(folder_id, remaining, "open file", &document_path, e.into()))?;
            let mut reader = BufReader::new(file);
            let byte_index = info.current_position;
            reader
                .seek(SeekFrom::Start(byte_index))
                .map_err(|e| self.document_error(folder_id, remaining, "seek file", &document_path, e.into()))?;

            let consumed = self
                .chunk_stream(
                    reader,
                    folder_id,
                    document_id,
                    &file_name,
                    "",
                    "",
                    "",
                    "",
                    -1,
                    MAX_TEXT_CHUNKS_PER_PASS,
                )
                .map_err(|e| self.document_error(folder_id, remaining, "chunk file", &document_path, e))?;
            let pos = byte_index + consumed;

            self.collections.with(folder_id, |item| {
                item.current_bytes_to_index = item.current_bytes_to_index.saturating_sub(consumed);
            });

            if pos < info.size {
                info.current_position = pos;
                info.currently_processing = true;
                self.enqueue_front(info);
                self.schedule_next(folder_id, remaining + 1);
                return Ok(());
            }
        }

        self.schedule_next(folder_id, remaining);
        Ok(())
    }

    /// Streams words into chunk rows (relational + FTS) and the embedding
    /// batcher. Returns bytes consumed from the reader.
    #[allow(clippy::too_many_arguments)]
    fn chunk_stream<R: BufRead>(
        &mut self,
        reader: R,
        folder_id: i64,
        document_id: i64,
        file: &str,
        title: &str,
        author: &str,
        subject: &str,
        keywords: &str,
        page: i64,
        max_chunks: usize,
    ) -> Result<u64> {
        self.collections.with(folder_id, |item| {
            item.file_currently_processing = file.to_string();
        });

        let chunker = Chunker::new(self.settings.chunk_size);
        let sink = EmbeddingSink::new(self.tx.clone());
        let store = &self.store;
        let batcher = &mut self.batcher;
        let embedder = self.embedder.as_ref();

        let mut chunk_count = 0usize;
        let mut added_words = 0i64;
        let pos = chunker.stream(reader, max_chunks, |piece| {
            let chunk_id = store.add_chunk(&NewChunk {
                document_id,
                text: &piece.text,
                file,
                title,
                author,
                subject,
                keywords,
                page,
                line_from: -1,
                line_to: -1,
                words: piece.words,
            })?;
            added_words += piece.words;
            batcher.push(
                EmbeddingChunk {
                    folder_id,
                    chunk_id,
                    text: piece.text,
                },
                embedder,
                &sink,
            );
            chunk_count += 1;
            Ok(())
        })?;

        if chunk_count > 0 {
            self.collections.with(folder_id, |item| {
                item.total_embeddings_to_index += chunk_count;
                item.total_words += added_words;
            });
        }
        Ok(pos)
    }

    /// Updates scheduling progress after each document visit. A drained
    /// folder flushes any partial embedding batch and leaves indexing state.
    fn schedule_next(&mut self, folder_id: i64, remaining: usize) {
        if remaining == 0 {
            let sink = self.sink();
            self.batcher.flush(self.embedder.as_ref(), &sink);
        }
        self.collections.with(folder_id, |item| {
            item.current_docs_to_index = remaining;
            if remaining == 0 {
                item.indexing = false;
                item.installed = true;
            }
        });
    }

    // embedding completions

    /// Applies one completed batch: vector insert first, then the
    /// `has_embedding` flip, then progress, then persist.
    pub fn handle_embeddings(&mut self, results: Vec<EmbeddingResult>) {
        if results.is_empty() {
            return;
        }
        let folder_id = results[results.len() - 1].folder_id;
        let first_chunk = results[0].chunk_id;
        let count = results.len();

        for result in &results {
            if self.vector.add(&result.embedding, result.chunk_id) {
                if let Err(e) = self.store.set_chunk_embedded(result.chunk_id) {
                    log::warn!("cannot mark chunk {} embedded: {e:#}", result.chunk_id);
                }
            } else {
                log::warn!("cannot add chunk {} to vector index", result.chunk_id);
            }
        }

        let file = self
            .store
            .file_for_chunk(first_chunk)
            .ok()
            .flatten()
            .unwrap_or_default();
        self.collections.with(folder_id, |item| {
            item.current_embeddings_to_index += count;
            item.file_currently_processing = file;
        });

        if let Err(e) = self.vector.save() {
            log::warn!("cannot persist vector index: {e:#}");
        }
    }

    /// Embedding failures surface as the folder's error without tearing the
    /// pipeline down.
    pub fn handle_embedding_error(&mut self, folder_id: i64, error: &str) {
        log::warn!("embedding failed for folder {folder_id}: {error}");
        let message = error.to_string();
        self.collections.with(folder_id, |item| item.error = message);
    }

    // maintenance

    /// Removes folders whose directory vanished, then documents whose file
    /// vanished, then refreshes statistics. Runs before every event-driven
    /// rescan.
    pub fn clean_db(&mut self) {
        let items = match self.store.all_collections(DB_VERSION) {
            Ok(items) => items,
            Err(e) => {
                log::warn!("cannot select collections for cleanup: {e:#}");
                return;
            }
        };
        for item in items {
            let path = Path::new(&item.folder_path);
            if std::fs::metadata(path).is_err() {
                log::info!("cleanup removing vanished folder {}", item.folder_path);
                if let Err(e) = self.remove_folder_internal(&item.collection, item.folder_id, path)
                {
                    log::warn!("cannot remove folder {}: {e:#}", item.folder_path);
                }
            }
        }

        let documents = match self.store.all_documents() {
            Ok(documents) => documents,
            Err(e) => {
                log::warn!("cannot select documents for cleanup: {e:#}");
                return;
            }
        };
        let stale: Vec<Document> = documents
            .into_iter()
            .filter(|document| std::fs::metadata(&document.path).is_err())
            .collect();

        if !stale.is_empty() {
            if let Err(e) = self.remove_stale_documents(&stale) {
                log::warn!("document cleanup failed: {e:#}");
            }
        }

        self.update_collection_statistics();
    }

    fn remove_stale_documents(&mut self, stale: &[Document]) -> Result<()> {
        self.store.begin()?;
        let outcome = (|| -> Result<Vec<i64>> {
            let mut chunks_to_remove = Vec::new();
            for document in stale {
                log::info!("cleanup removing vanished document {}", document.path);
                chunks_to_remove.extend(self.store.chunk_ids_for_document(document.id)?);
                self.store.remove_chunks_by_document(document.id)?;
                self.store.remove_document(document.id)?;
            }
            Ok(chunks_to_remove)
        })();

        let chunks_to_remove = match outcome {
            Err(e) => {
                self.store.rollback()?;
                return Err(e);
            }
            Ok(chunks) => {
                self.store.commit()?;
                chunks
            }
        };
        for chunk_id in &chunks_to_remove {
            self.vector.remove(*chunk_id);
        }
        if !chunks_to_remove.is_empty() {
            if let Err(e) = self.vector.save() {
                log::warn!("cannot persist vector index: {e:#}");
            }
        }
        Ok(())
    }

    /// Reacts to a watcher event for a known folder: cleanup, then rescan.
    pub fn directory_changed(&mut self, path: &Path) {
        let path_str = path.to_string_lossy().to_string();
        let folder_id = match self.store.folder_id_for_path(&path_str) {
            Ok(folder_id) => folder_id,
            Err(e) => {
                log::warn!("cannot look up watched folder {path_str}: {e:#}");
                return;
            }
        };
        let Some(folder_id) = folder_id else {
            log::warn!("watched folder {path_str} is not tracked, unwatching");
            self.remove_from_watch(path);
            return;
        };

        self.clean_db();
        self.scan_documents(folder_id, path);
    }

    fn update_collection_statistics(&mut self) {
        let items = match self.store.all_collections(DB_VERSION) {
            Ok(items) => items,
            Err(e) => {
                log::warn!("cannot select collections for statistics: {e:#}");
                return;
            }
        };
        for item in items {
            match self.store.statistics(item.folder_id) {
                Ok(stats) => self.collections.with(item.folder_id, |it| {
                    it.total_docs = stats.total_docs;
                    it.total_words = stats.total_words;
                    it.total_tokens = stats.total_tokens;
                }),
                Err(e) => log::warn!(
                    "cannot compute statistics for folder {}: {e:#}",
                    item.folder_id
                ),
            }
        }
    }

    // retrieval

    pub fn retrieve(
        &self,
        collections: &[String],
        text: &str,
        k: usize,
    ) -> Result<Vec<ResultInfo>> {
        search::retrieve(
            &self.store,
            self.vector.as_ref(),
            self.embedder.as_ref(),
            collections,
            text,
            k,
        )
    }

    // watch plumbing

    fn add_to_watch(&mut self, path: &Path) {
        if let Some(watch) = &mut self.watch {
            watch.add_path(path);
        }
    }

    fn remove_from_watch(&mut self, path: &Path) {
        if let Some(watch) = &mut self.watch {
            watch.remove_path(path);
        }
    }

    // introspection, used by the worker and by tests

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn vector_index(&self) -> &dyn VectorIndex {
        self.vector.as_ref()
    }

    pub fn collection_item(&self, folder_id: i64) -> Option<CollectionItem> {
        self.collections.get(folder_id)
    }

    pub fn queued_documents(&self, folder_id: i64) -> usize {
        self.count_of_documents(folder_id)
    }

    pub fn chunk_size(&self) -> usize {
        self.settings.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::PdfPages;
    use crate::vector_index::FlatIndex;
    use rusqlite::Connection;
    use std::collections::HashMap;
    use std::sync::mpsc::{self, Receiver};
    use tempfile::tempdir;

    /// Deterministic embedder: one bucket count per hashed word. Identical
    /// texts embed identically, so exact matches win dense retrieval.
    struct WordHashEmbedder;

    fn word_vector(text: &str) -> Vec<f32> {
        let mut v = vec![0f32; 8];
        for word in text.split_whitespace() {
            let mut h: u32 = 2166136261;
            for b in word.bytes() {
                h ^= b as u32;
                h = h.wrapping_mul(16777619);
            }
            v[(h % 8) as usize] += 1.0;
        }
        v
    }

    impl Embedder for WordHashEmbedder {
        fn model_name(&self) -> String {
            "test-minilm".into()
        }

        fn embed_sync(&self, text: &str) -> Vec<f32> {
            if text.trim().is_empty() {
                Vec::new()
            } else {
                word_vector(text)
            }
        }

        fn embed_async(&self, chunks: Vec<EmbeddingChunk>, sink: EmbeddingSink) {
            let results = chunks
                .into_iter()
                .map(|c| EmbeddingResult {
                    folder_id: c.folder_id,
                    chunk_id: c.chunk_id,
                    embedding: word_vector(&c.text),
                })
                .collect();
            sink.complete(results);
        }
    }

    /// Accepts batches but never completes them.
    struct SilentEmbedder;

    impl Embedder for SilentEmbedder {
        fn model_name(&self) -> String {
            "silent".into()
        }

        fn embed_sync(&self, _text: &str) -> Vec<f32> {
            Vec::new()
        }

        fn embed_async(&self, _chunks: Vec<EmbeddingChunk>, _sink: EmbeddingSink) {}
    }

    /// Reports no available model.
    struct NoModelEmbedder;

    impl Embedder for NoModelEmbedder {
        fn model_name(&self) -> String {
            String::new()
        }

        fn embed_sync(&self, _text: &str) -> Vec<f32> {
            Vec::new()
        }

        fn embed_async(&self, _chunks: Vec<EmbeddingChunk>, _sink: EmbeddingSink) {}
    }

    /// Fails every batch with a per-folder error.
    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> String {
            "failing".into()
        }

        fn embed_sync(&self, _text: &str) -> Vec<f32> {
            Vec::new()
        }

        fn embed_async(&self, chunks: Vec<EmbeddingChunk>, sink: EmbeddingSink) {
            if let Some(first) = chunks.first() {
                sink.fail(first.folder_id, "embedding backend unavailable".into());
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakePdfLibrary {
        docs: HashMap<PathBuf, FakePdf>,
    }

    impl FakePdfLibrary {
        fn insert(&mut self, path: &Path, pdf: FakePdf) {
            let canonical = std::fs::canonicalize(path).unwrap();
            self.docs.insert(canonical, pdf);
        }
    }

    impl PdfExtractor for FakePdfLibrary {
        fn load(&self, path: &Path) -> Result<Box<dyn PdfPages>> {
            self.docs
                .get(path)
                .cloned()
                .map(|pdf| Box::new(pdf) as Box<dyn PdfPages>)
                .ok_or_else(|| anyhow::anyhow!("cannot parse pdf {}", path.display()))
        }
    }

    #[derive(Clone, Default)]
    struct FakePdf {
        pages: Vec<String>,
        title: String,
    }

    impl PdfPages for FakePdf {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn page_text(&self, page_index: usize) -> Result<String> {
            self.pages
                .get(page_index)
                .cloned()
                .with_context(|| format!("pdf has no page {page_index}"))
        }

        fn title(&self) -> String {
            self.title.clone()
        }

        fn author(&self) -> String {
            String::new()
        }

        fn subject(&self) -> String {
            String::new()
        }

        fn keywords(&self) -> String {
            String::new()
        }
    }

    fn new_engine(
        root: &Path,
        embedder: Box<dyn Embedder>,
        pdfs: FakePdfLibrary,
        chunk_size: usize,
        tick_budget_ms: u64,
    ) -> (Engine, Receiver<Message>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::channel();
        let index_dir = root.join("index");
        let mut settings = EngineSettings::new(&index_dir);
        settings.chunk_size = chunk_size;
        settings.tick_budget_ms = tick_budget_ms;
        settings.watch_folders = false;
        let vector = Box::new(FlatIndex::at_dir(&index_dir, DB_VERSION));
        let mut engine =
            Engine::new(settings, embedder, vector, Box::new(pdfs), tx, None).unwrap();
        engine.start().unwrap();
        (engine, rx)
    }

    fn drain(engine: &mut Engine, rx: &Receiver<Message>) {
        while let Ok(message) = rx.try_recv() {
            match message {
                Message::EmbeddingsReady { results } => engine.handle_embeddings(results),
                Message::EmbeddingFailed { folder_id, error } => {
                    engine.handle_embedding_error(folder_id, &error)
                }
                Message::DirectoryChanged { path } => engine.directory_changed(&path),
                _ => {}
            }
        }
    }

    fn run_until_idle(engine: &mut Engine, rx: &Receiver<Message>) {
        for _ in 0..1000 {
            engine.scan_tick().unwrap();
            drain(engine, rx);
            if !engine.has_pending_work() {
                return;
            }
        }
        panic!("engine did not drain its scan queues");
    }

    fn canonical_str(path: &Path) -> String {
        std::fs::canonicalize(path)
            .unwrap()
            .to_string_lossy()
            .to_string()
    }

    fn docs_dir(root: &Path) -> PathBuf {
        let docs = root.join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        docs
    }

    #[test]
    fn indexes_text_file_into_chunks_with_fts_mirror() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .expect("folder row");
        let documents = engine.store().documents_for_folder(folder_id).unwrap();
        assert_eq!(documents.len(), 1);

        let chunks = engine.store().chunks_for_document(documents[0]).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["alpha beta", "gamma delta"]);
        assert!(chunks.iter().all(|c| c.file == "a.txt"));
        assert!(chunks.iter().all(|c| c.page == -1 && c.line_from == -1));

        // Every chunk has an identically-keyed FTS row.
        let fts = engine.store().fts_chunks_for_document(documents[0]).unwrap();
        let expected: Vec<(i64, String)> = chunks
            .iter()
            .map(|c| (c.chunk_id, c.text.clone()))
            .collect();
        assert_eq!(fts, expected);

        // Embeddings applied: has_embedding mirrors the vector index keys.
        let chunks = engine.store().chunks_for_document(documents[0]).unwrap();
        assert!(chunks.iter().all(|c| c.has_embedding));
        let mut ids: Vec<i64> = chunks.iter().map(|c| c.chunk_id).collect();
        ids.sort_unstable();
        assert_eq!(engine.vector_index().keys(), ids);

        let item = engine.collection_item(folder_id).unwrap();
        assert!(!item.indexing);
        assert!(item.installed);
        assert_eq!(item.total_words, 4);
        assert_eq!(item.total_docs, 1);
    }

    #[test]
    fn modified_file_replaces_chunks_everywhere() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        let file = docs.join("a.txt");
        std::fs::write(&file, "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        let document_id = engine.store().documents_for_folder(folder_id).unwrap()[0];
        let old_ids = engine.store().chunk_ids_for_document(document_id).unwrap();
        assert_eq!(old_ids.len(), 2);

        // Rewrite with a later mtime, then deliver the directory event.
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::write(&file, "alpha beta").unwrap();
        engine.directory_changed(Path::new(&canonical_str(&docs)));
        run_until_idle(&mut engine, &rx);

        let chunks = engine.store().chunks_for_document(document_id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "alpha beta");
        assert!(!old_ids.contains(&chunks[0].chunk_id));

        let fts = engine.store().fts_chunks_for_document(document_id).unwrap();
        assert_eq!(fts.len(), 1);

        // The stale embeddings left the vector index with the rows.
        let keys = engine.vector_index().keys();
        assert!(old_ids.iter().all(|id| !keys.contains(id)));
        assert_eq!(keys, vec![chunks[0].chunk_id]);
    }

    #[test]
    fn shared_folder_survives_until_last_collection_detaches() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C1", &docs).unwrap();
        engine.add_folder("C2", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        assert_eq!(engine.store().count_chunks(folder_id).unwrap(), 2);

        // Detaching one of two collections only drops the association.
        engine.remove_folder("C1", &docs).unwrap();
        assert_eq!(engine.store().count_chunks(folder_id).unwrap(), 2);
        assert_eq!(
            engine.store().collections_for_folder(folder_id).unwrap(),
            vec!["C2"]
        );

        // Detaching the last collection cascades through everything.
        engine.remove_folder("C2", &docs).unwrap();
        assert!(engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .is_none());
        assert!(engine.store().all_documents().unwrap().is_empty());
        assert!(engine.store().all_collections(DB_VERSION).unwrap().is_empty());
        assert!(engine.vector_index().keys().is_empty());
        assert!(engine.collection_item(folder_id).is_none());
    }

    #[test]
    fn pdf_spans_multiple_ticks_resuming_at_front() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        let pdf_path = docs.join("report.pdf");
        std::fs::write(&pdf_path, b"%PDF-1.4 stand-in bytes").unwrap();

        let mut pdfs = FakePdfLibrary::default();
        pdfs.insert(
            &pdf_path,
            FakePdf {
                pages: vec![
                    "alpha words on page one".into(),
                    "beta words on page two".into(),
                    "gamma words on page three".into(),
                ],
                title: "Quarterly Report".into(),
            },
        );

        // Zero budget: exactly one document visit per tick.
        let (mut engine, rx) = new_engine(dir.path(), Box::new(WordHashEmbedder), pdfs, 100, 0);
        engine.add_folder("C", &docs).unwrap();
        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();

        engine.scan_tick().unwrap();
        let documents = engine.store().documents_for_folder(folder_id).unwrap();
        assert_eq!(documents.len(), 1);
        let after_first: Vec<i64> = engine
            .store()
            .chunks_for_document(documents[0])
            .unwrap()
            .iter()
            .map(|c| c.page)
            .collect();
        assert_eq!(after_first, vec![1]);
        assert_eq!(engine.queued_documents(folder_id), 1);

        engine.scan_tick().unwrap();
        assert_eq!(engine.queued_documents(folder_id), 1);

        engine.scan_tick().unwrap();
        assert_eq!(engine.queued_documents(folder_id), 0);
        assert!(!engine.has_pending_work());

        drain(&mut engine, &rx);
        let chunks = engine.store().chunks_for_document(documents[0]).unwrap();
        let pages: Vec<i64> = chunks.iter().map(|c| c.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        assert!(chunks.iter().all(|c| c.title == "Quarterly Report"));
        assert!(chunks.iter().all(|c| c.has_embedding));
    }

    #[test]
    fn legacy_database_migrates_with_forced_reindex() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("p");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("p.txt"), "alpha beta gamma delta").unwrap();
        let folder_canonical = canonical_str(&folder);

        let index_dir = dir.path().join("index");
        std::fs::create_dir_all(&index_dir).unwrap();
        {
            let conn = Connection::open(crate::db::db_path(&index_dir, 1)).unwrap();
            conn.execute_batch(
                "create table chunks(document_id integer, chunk_id integer primary key);
                 create table folders(id integer primary key, folder_path text unique);
                 create table collections(collection_name text, folder_id integer);",
            )
            .unwrap();
            conn.execute(
                "insert into folders(folder_path) values(?)",
                [&folder_canonical],
            )
            .unwrap();
            conn.execute(
                "insert into collections(collection_name, folder_id) values('Old', 1)",
                [],
            )
            .unwrap();
        }

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        assert!(engine.is_valid());

        // The collection came over force-flagged, with no content and no
        // scheduled scan.
        let items = engine.store().all_collections(DB_VERSION).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].collection, "Old");
        assert!(items[0].force_indexing);
        assert!(engine.store().all_documents().unwrap().is_empty());
        assert!(!engine.has_pending_work());

        let folder_id = engine
            .store()
            .folder_id_for_path(&folder_canonical)
            .unwrap()
            .unwrap();
        assert!(engine.collection_item(folder_id).unwrap().force_indexing);

        // The user re-triggers indexing; content appears.
        engine.force_indexing("Old").unwrap();
        run_until_idle(&mut engine, &rx);

        let items = engine.store().all_collections(DB_VERSION).unwrap();
        assert!(!items[0].force_indexing);
        assert_eq!(engine.store().count_chunks(folder_id).unwrap(), 2);
    }

    #[test]
    fn rescanning_unchanged_folder_is_a_no_op() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        let document_id = engine.store().documents_for_folder(folder_id).unwrap()[0];
        let before = engine.store().chunk_ids_for_document(document_id).unwrap();

        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let after = engine.store().chunk_ids_for_document(document_id).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn refuses_folder_without_embedding_model() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta").unwrap();

        let (mut engine, _rx) =
            new_engine(dir.path(), Box::new(NoModelEmbedder), Default::default(), 10, 100);
        let err = engine.add_folder("C", &docs).unwrap_err();
        assert!(err.to_string().contains("no embedding model"));
        assert!(engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .is_none());
    }

    #[test]
    fn failed_document_rolls_back_the_whole_tick() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        // On disk but unknown to the extractor, so loading fails.
        std::fs::write(docs.join("bad.pdf"), b"%PDF-1.4 broken").unwrap();

        let (mut engine, _rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        assert!(engine.has_pending_work());

        engine.scan_tick().unwrap();

        // Nothing from the tick landed, including the document row.
        assert!(engine.store().all_documents().unwrap().is_empty());
        assert!(!engine.has_pending_work());
    }

    #[test]
    fn embedding_failure_surfaces_as_folder_error() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(FailingEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        let item = engine.collection_item(folder_id).unwrap();
        assert_eq!(item.error, "embedding backend unavailable");

        // Chunks stay retryable.
        let document_id = engine.store().documents_for_folder(folder_id).unwrap()[0];
        let chunks = engine.store().chunks_for_document(document_id).unwrap();
        assert!(chunks.iter().all(|c| !c.has_embedding));
        assert!(engine.vector_index().keys().is_empty());
    }

    #[test]
    fn restart_redispatches_uncompleted_embeddings() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        // First run: embeddings never complete.
        {
            let (mut engine, rx) =
                new_engine(dir.path(), Box::new(SilentEmbedder), Default::default(), 10, 100);
            engine.add_folder("C", &docs).unwrap();
            run_until_idle(&mut engine, &rx);

            let folder_id = engine
                .store()
                .folder_id_for_path(&canonical_str(&docs))
                .unwrap()
                .unwrap();
            assert_eq!(engine.store().uncompleted_chunks(folder_id).unwrap().len(), 2);
        }

        // Second run re-dispatches the pending chunks on startup.
        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        assert!(engine.store().uncompleted_chunks(folder_id).unwrap().is_empty());
        assert_eq!(engine.vector_index().keys().len(), 2);
    }

    #[test]
    fn startup_drops_orphaned_vector_entries() {
        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("index");
        std::fs::create_dir_all(&index_dir).unwrap();
        {
            let mut index = FlatIndex::at_dir(&index_dir, DB_VERSION);
            index.add(&[1.0, 0.0], 9999);
            index.save().unwrap();
        }

        let (engine, _rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        assert!(engine.vector_index().keys().is_empty());
    }

    #[test]
    fn change_chunk_size_rechunks_everything() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        assert_eq!(engine.store().count_chunks(folder_id).unwrap(), 2);

        engine.change_chunk_size(100).unwrap();
        run_until_idle(&mut engine, &rx);

        assert_eq!(engine.chunk_size(), 100);
        let document_id = engine.store().documents_for_folder(folder_id).unwrap()[0];
        let chunks = engine.store().chunks_for_document(document_id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "alpha beta gamma delta");
        assert_eq!(engine.vector_index().keys(), vec![chunks[0].chunk_id]);
    }

    #[test]
    fn zero_page_pdf_inserts_no_chunks() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        let pdf_path = docs.join("empty.pdf");
        std::fs::write(&pdf_path, b"%PDF-1.4 empty").unwrap();

        let mut pdfs = FakePdfLibrary::default();
        pdfs.insert(&pdf_path, FakePdf::default());

        let (mut engine, rx) = new_engine(dir.path(), Box::new(WordHashEmbedder), pdfs, 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let documents = engine.store().all_documents().unwrap();
        assert_eq!(documents.len(), 1);
        assert!(engine
            .store()
            .chunk_ids_for_document(documents[0].id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn cleanup_removes_vanished_documents() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();
        std::fs::write(docs.join("b.txt"), "epsilon zeta eta theta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);

        let folder_id = engine
            .store()
            .folder_id_for_path(&canonical_str(&docs))
            .unwrap()
            .unwrap();
        assert_eq!(engine.store().documents_for_folder(folder_id).unwrap().len(), 2);
        assert_eq!(engine.vector_index().keys().len(), 4);

        std::fs::remove_file(docs.join("b.txt")).unwrap();
        engine.directory_changed(Path::new(&canonical_str(&docs)));
        run_until_idle(&mut engine, &rx);

        let documents = engine.store().all_documents().unwrap();
        assert_eq!(documents.len(), 1);
        assert!(documents[0].path.ends_with("a.txt"));
        assert_eq!(engine.vector_index().keys().len(), 2);

        let item = engine.collection_item(folder_id).unwrap();
        assert_eq!(item.total_docs, 1);
        assert_eq!(item.total_words, 4);
    }

    #[test]
    fn dense_retrieval_finds_exact_chunk() {
        let dir = tempdir().unwrap();
        let docs = docs_dir(dir.path());
        std::fs::write(docs.join("a.txt"), "alpha beta gamma delta").unwrap();

        let (mut engine, rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.add_folder("C", &docs).unwrap();
        run_until_idle(&mut engine, &rx);
        assert!(engine.vector_index().is_loaded());

        let results = engine
            .retrieve(&["C".to_string()], "alpha beta", 5)
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].text, "alpha beta");
        assert_eq!(results[0].file, "a.txt");

        // Empty queries short-circuit to nothing.
        assert!(engine.retrieve(&["C".to_string()], "", 5).unwrap().is_empty());
    }

    #[test]
    fn directory_event_for_unknown_folder_is_ignored() {
        let dir = tempdir().unwrap();
        let (mut engine, _rx) =
            new_engine(dir.path(), Box::new(WordHashEmbedder), Default::default(), 10, 100);
        engine.directory_changed(Path::new("/nowhere/special"));
        assert!(engine.store().all_documents().unwrap().is_empty());
    }
}
