use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{Chunk, CollectionItem, Document, EmbeddingChunk, Folder, FolderStatistics};

/// Current on-disk schema version. The database file is named
/// `localdocs_v{N}.db`; older versions down to [`DB_MIN_VERSION`] are probed
/// on startup and their collections carried over with `force_indexing` set.
pub const DB_VERSION: i32 = 2;
pub const DB_MIN_VERSION: i32 = 1;

const FOLDERS_SQL: &str = "
    create table folders(id integer primary key, folder_path text unique);
";

const DOCUMENTS_SQL: &str = "
    create table documents(id integer primary key, folder_id integer,
        document_time integer, document_path text unique);
";

const CHUNKS_SQL: &str = "
    create table chunks(document_id integer, chunk_id integer primary key autoincrement,
        chunk_text text, file text, title text, author text, subject text, keywords text,
        page integer, line_from integer, line_to integer,
        words integer default 0, tokens integer default 0, has_embedding integer default 0);
";

const CHUNKS_FTS_SQL: &str = "
    create virtual table chunks_fts using fts5(document_id unindexed, chunk_id unindexed,
        chunk_text, file unindexed, title unindexed, author unindexed, subject unindexed,
        keywords unindexed, page unindexed, line_from unindexed, line_to unindexed,
        tokenize=\"trigram\");
";

const COLLECTIONS_SQL: &str = "
    create table collections(collection_name text, folder_id integer,
        last_update_time integer, embedding_model text, force_indexing integer,
        unique(collection_name, folder_id));
";

const SELECT_COLLECTIONS_SQL_V1: &str = "
    select c.collection_name, f.folder_path, f.id
    from collections c
    join folders f on c.folder_id = f.id
    order by c.collection_name asc, f.folder_path asc;
";

const SELECT_COLLECTIONS_SQL_V2: &str = "
    select c.collection_name, f.folder_path, f.id, c.last_update_time,
        c.embedding_model, c.force_indexing
    from collections c
    join folders f on c.folder_id = f.id
    order by c.collection_name asc, f.folder_path asc;
";

/// Column values for one new chunk row (and its FTS mirror).
#[derive(Debug, Clone)]
pub struct NewChunk<'a> {
    pub document_id: i64,
    pub text: &'a str,
    pub file: &'a str,
    pub title: &'a str,
    pub author: &'a str,
    pub subject: &'a str,
    pub keywords: &'a str,
    pub page: i64,
    pub line_from: i64,
    pub line_to: i64,
    pub words: i64,
}

/// Typed, parameterized operations over the relational tables. The connection
/// is owned by the worker thread; batch mutations run inside an explicit
/// [`Store::begin`] / [`Store::commit`] pair.
pub struct Store {
    conn: Connection,
}

pub fn db_path(index_dir: &Path, version: i32) -> PathBuf {
    index_dir.join(format!("localdocs_v{version}.db"))
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self { conn })
    }

    /// Probe `localdocs_v{N}.db` from the current version down. The first file
    /// with a `chunks` table is the active database; if its version is older
    /// than current, its collections are read out (marked `force_indexing`), a
    /// fresh current-version database is created, and the caller re-inserts
    /// them. Content is never migrated.
    pub fn open_latest(index_dir: &Path) -> Result<(Self, Vec<CollectionItem>)> {
        let mut legacy = Vec::new();
        for version in (DB_MIN_VERSION..=DB_VERSION).rev() {
            let path = db_path(index_dir, version);
            if !path.exists() {
                continue;
            }
            let store = Self::open(&path)?;
            if !store.has_content()? {
                continue;
            }
            if version == DB_VERSION {
                return Ok((store, legacy));
            }
            log::info!("found localdocs v{version} database, upgrading to v{DB_VERSION}");
            legacy = store.all_collections(version)?;
            for item in &mut legacy {
                item.force_indexing = true;
            }
            break;
        }

        let store = Self::open(&db_path(index_dir, DB_VERSION))?;
        if !store.has_content()? {
            store.create_schema()?;
        }
        Ok((store, legacy))
    }

    pub fn has_content(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "select count(*) from sqlite_master where type in ('table', 'view') \
             and name = 'chunks'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_schema(&self) -> Result<()> {
        self.begin()?;
        let created = self
            .conn
            .execute_batch(CHUNKS_SQL)
            .and_then(|()| self.conn.execute_batch(CHUNKS_FTS_SQL))
            .and_then(|()| self.conn.execute_batch(COLLECTIONS_SQL))
            .and_then(|()| self.conn.execute_batch(FOLDERS_SQL))
            .and_then(|()| self.conn.execute_batch(DOCUMENTS_SQL));
        if let Err(e) = created {
            self.rollback()?;
            return Err(e).context("failed to create schema");
        }
        self.commit()?;
        log::info!("database schema created at version {DB_VERSION}");
        Ok(())
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN;")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    // folders

    pub fn add_folder(&self, folder_path: &str) -> Result<i64> {
        self.conn
            .prepare_cached("insert into folders(folder_path) values(?)")?
            .execute(params![folder_path])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn remove_folder(&self, folder_id: i64) -> Result<()> {
        self.conn
            .prepare_cached("delete from folders where id = ?")?
            .execute(params![folder_id])?;
        Ok(())
    }

    pub fn folder_id_for_path(&self, folder_path: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .prepare_cached("select id from folders where folder_path = ?")?
            .query_row(params![folder_path], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    // documents

    pub fn add_document(&self, folder_id: i64, mtime_ms: i64, document_path: &str) -> Result<i64> {
        self.conn
            .prepare_cached(
                "insert into documents(folder_id, document_time, document_path) values(?, ?, ?)",
            )?
            .execute(params![folder_id, mtime_ms, document_path])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_document_time(&self, document_id: i64, mtime_ms: i64) -> Result<()> {
        self.conn
            .prepare_cached("update documents set document_time = ? where id = ?")?
            .execute(params![mtime_ms, document_id])?;
        Ok(())
    }

    pub fn remove_document(&self, document_id: i64) -> Result<()> {
        self.conn
            .prepare_cached("delete from documents where id = ?")?
            .execute(params![document_id])?;
        Ok(())
    }

    /// Returns `(document_id, mtime_ms)` for a canonical path, if scanned before.
    pub fn document_for_path(&self, document_path: &str) -> Result<Option<(i64, i64)>> {
        let row = self
            .conn
            .prepare_cached("select id, document_time from documents where document_path = ?")?
            .query_row(params![document_path], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        Ok(row)
    }

    pub fn documents_for_folder(&self, folder_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("select id from documents where folder_id = ?")?;
        let ids = stmt
            .query_map(params![folder_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn all_documents(&self) -> Result<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare_cached("select id, folder_id, document_time, document_path from documents")?;
        let docs = stmt
            .query_map([], |row| {
                Ok(Document {
                    id: row.get(0)?,
                    folder_id: row.get(1)?,
                    mtime_ms: row.get(2)?,
                    path: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    // chunks

    /// Inserts the chunk row and its FTS mirror; returns the new chunk id.
    pub fn add_chunk(&self, chunk: &NewChunk) -> Result<i64> {
        self.conn
            .prepare_cached(
                "insert into chunks(document_id, chunk_text, file, title, author, subject, \
                 keywords, page, line_from, line_to, words) \
                 values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                chunk.document_id,
                chunk.text,
                chunk.file,
                chunk.title,
                chunk.author,
                chunk.subject,
                chunk.keywords,
                chunk.page,
                chunk.line_from,
                chunk.line_to,
                chunk.words,
            ])?;
        let chunk_id = self.conn.last_insert_rowid();
        self.conn
            .prepare_cached(
                "insert into chunks_fts(document_id, chunk_id, chunk_text, file, title, author, \
                 subject, keywords, page, line_from, line_to) \
                 values(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                chunk.document_id,
                chunk_id,
                chunk.text,
                chunk.file,
                chunk.title,
                chunk.author,
                chunk.subject,
                chunk.keywords,
                chunk.page,
                chunk.line_from,
                chunk.line_to,
            ])?;
        Ok(chunk_id)
    }

    /// Deletes chunk rows and their FTS mirrors for one document.
    pub fn remove_chunks_by_document(&self, document_id: i64) -> Result<()> {
        self.conn
            .prepare_cached("delete from chunks where document_id = ?")?
            .execute(params![document_id])?;
        self.conn
            .prepare_cached("delete from chunks_fts where document_id = ?")?
            .execute(params![document_id])?;
        Ok(())
    }

    pub fn chunk_ids_for_document(&self, document_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("select chunk_id from chunks where document_id = ?")?;
        let ids = stmt
            .query_map(params![document_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn chunks_for_document(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare_cached(
            "select chunk_id, document_id, chunk_text, file, title, author, subject, keywords, \
             page, line_from, line_to, words, tokens, has_embedding \
             from chunks where document_id = ? order by chunk_id",
        )?;
        let chunks = stmt
            .query_map(params![document_id], |row| {
                Ok(Chunk {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    text: row.get(2)?,
                    file: row.get(3)?,
                    title: row.get(4)?,
                    author: row.get(5)?,
                    subject: row.get(6)?,
                    keywords: row.get(7)?,
                    page: row.get(8)?,
                    line_from: row.get(9)?,
                    line_to: row.get(10)?,
                    words: row.get(11)?,
                    tokens: row.get(12)?,
                    has_embedding: row.get::<_, i64>(13)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// FTS mirror rows for one document, as `(chunk_id, chunk_text)`.
    pub fn fts_chunks_for_document(&self, document_id: i64) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "select chunk_id, chunk_text from chunks_fts where document_id = ? order by chunk_id",
        )?;
        let rows = stmt
            .query_map(params![document_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Chunks of a folder that still lack an embedding.
    pub fn uncompleted_chunks(&self, folder_id: i64) -> Result<Vec<EmbeddingChunk>> {
        let mut stmt = self.conn.prepare_cached(
            "select c.chunk_id, c.chunk_text, d.folder_id \
             from chunks c \
             join documents d on c.document_id = d.id \
             where c.has_embedding != 1 and d.folder_id = ?",
        )?;
        let chunks = stmt
            .query_map(params![folder_id], |row| {
                Ok(EmbeddingChunk {
                    chunk_id: row.get(0)?,
                    text: row.get(1)?,
                    folder_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    pub fn count_chunks(&self, folder_id: i64) -> Result<i64> {
        let count = self
            .conn
            .prepare_cached(
                "select count(c.chunk_id) from chunks c \
                 join documents d on c.document_id = d.id \
                 where d.folder_id = ?",
            )?
            .query_row(params![folder_id], |row| row.get(0))?;
        Ok(count)
    }

    pub fn set_chunk_embedded(&self, chunk_id: i64) -> Result<()> {
        self.conn
            .prepare_cached("update chunks set has_embedding = 1 where chunk_id = ?")?
            .execute(params![chunk_id])?;
        Ok(())
    }

    /// All chunk ids with a recorded embedding, for vector-index reconciliation.
    pub fn completed_chunk_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("select chunk_id from chunks where has_embedding = 1")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn file_for_chunk(&self, chunk_id: i64) -> Result<Option<String>> {
        let file = self
            .conn
            .prepare_cached("select file from chunks where chunk_id = ?")?
            .query_row(params![chunk_id], |row| row.get(0))
            .optional()?;
        Ok(file)
    }

    // collections

    pub fn add_collection(
        &self,
        collection_name: &str,
        folder_id: i64,
        last_update: Option<i64>,
        embedding_model: &str,
        force_indexing: bool,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "insert into collections(collection_name, folder_id, last_update_time, \
                 embedding_model, force_indexing) values(?, ?, ?, ?, ?)",
            )?
            .execute(params![
                collection_name,
                folder_id,
                last_update,
                embedding_model,
                force_indexing as i64,
            ])?;
        Ok(())
    }

    pub fn remove_collection(&self, collection_name: &str, folder_id: i64) -> Result<()> {
        self.conn
            .prepare_cached("delete from collections where collection_name = ? and folder_id = ?")?
            .execute(params![collection_name, folder_id])?;
        Ok(())
    }

    pub fn folders_for_collection(&self, collection_name: &str) -> Result<Vec<Folder>> {
        let mut stmt = self.conn.prepare_cached(
            "select f.id, f.folder_path from collections c \
             join folders f on c.folder_id = f.id \
             where collection_name = ?",
        )?;
        let folders = stmt
            .query_map(params![collection_name], |row| {
                Ok(Folder {
                    id: row.get(0)?,
                    path: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    pub fn collections_for_folder(&self, folder_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("select collection_name from collections where folder_id = ?")?;
        let names = stmt
            .query_map(params![folder_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Version-aware select over the collections table, used both at runtime
    /// and when reading a legacy database during migration.
    pub fn all_collections(&self, version: i32) -> Result<Vec<CollectionItem>> {
        let sql = match version {
            1 => SELECT_COLLECTIONS_SQL_V1,
            2 => SELECT_COLLECTIONS_SQL_V2,
            _ => anyhow::bail!("unsupported collections schema version {version}"),
        };
        let mut stmt = self.conn.prepare(sql)?;
        let items = stmt
            .query_map([], |row| {
                let mut item = CollectionItem::new(
                    &row.get::<_, String>(0)?,
                    &row.get::<_, String>(1)?,
                    row.get(2)?,
                );
                item.installed = true;
                if version > 1 {
                    item.last_update = row.get(3)?;
                    item.embedding_model = row.get(4)?;
                    item.force_indexing = row.get::<_, i64>(5)? != 0;
                }
                Ok(item)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn clear_force_indexing(&self, collection_name: &str) -> Result<()> {
        self.conn
            .prepare_cached("update collections set force_indexing = 0 where collection_name = ?")?
            .execute(params![collection_name])?;
        Ok(())
    }

    // statistics

    pub fn statistics(&self, folder_id: i64) -> Result<FolderStatistics> {
        let stats = self
            .conn
            .prepare_cached(
                "select count(distinct d.id), sum(c.words), sum(c.tokens) \
                 from documents d \
                 left join chunks c on d.id = c.document_id \
                 where d.folder_id = ?",
            )?
            .query_row(params![folder_id], |row| {
                Ok(FolderStatistics {
                    total_docs: row.get(0)?,
                    total_words: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    total_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            })?;
        Ok(stats)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}
