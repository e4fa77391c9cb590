use std::collections::HashMap;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Row};

use crate::db::Store;
use crate::embedder::Embedder;
use crate::models::ResultInfo;
use crate::vector_index::VectorIndex;

/// Hybrid retrieval: dense vector search when the index has answers for the
/// query, otherwise an n-gram full-text fallback over the trigram FTS table.
/// Results are scoped to the supplied collection names.
pub fn retrieve(
    store: &Store,
    vector: &dyn VectorIndex,
    embedder: &dyn Embedder,
    collections: &[String],
    text: &str,
    k: usize,
) -> Result<Vec<ResultInfo>> {
    if collections.is_empty() || text.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    if vector.is_loaded() {
        let query = embedder.embed_sync(text);
        if query.is_empty() {
            log::warn!("query embedding came back empty, falling back to full-text search");
        } else {
            let ids = vector.search(&query, k);
            if !ids.is_empty() {
                return select_chunks_by_ids(store, collections, &ids);
            }
            log::debug!("vector index returned no hits, falling back to full-text search");
        }
    }

    ngram_search(store, collections, text, k)
}

/// Dense-mode select: chunk rows by id, filtered to the collection scope,
/// returned in the order the vector index ranked them.
fn select_chunks_by_ids(
    store: &Store,
    collections: &[String],
    chunk_ids: &[i64],
) -> Result<Vec<ResultInfo>> {
    let id_list = chunk_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let name_params = placeholders(collections.len());
    let sql = format!(
        "select chunks.chunk_id, documents.document_time, chunks.chunk_text, chunks.file, \
         chunks.title, chunks.author, chunks.page, chunks.line_from, chunks.line_to \
         from chunks \
         join documents on chunks.document_id = documents.id \
         join folders on documents.folder_id = folders.id \
         join collections on folders.id = collections.folder_id \
         where chunks.chunk_id in ({id_list}) and collections.collection_name in ({name_params})"
    );

    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt
        .query_map(
            params_from_iter(collections.iter().map(|n| Value::from(n.clone()))),
            result_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // Re-impose the index ranking; the IN clause has no inherent order.
    let mut by_id: HashMap<i64, ResultInfo> = rows.into_iter().collect();
    Ok(chunk_ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

/// Sparse fallback over the FTS table: descending-N NEAR phrase ladder, BM25
/// order, first N with any hit wins.
fn ngram_search(
    store: &Store,
    collections: &[String],
    text: &str,
    k: usize,
) -> Result<Vec<ResultInfo>> {
    let words = clean_words(text);
    if words.is_empty() {
        return Ok(Vec::new());
    }

    let max_n = words.len();
    let min_n = max_n.min(3);
    for n in (min_n..=max_n).rev() {
        let grams = generate_grams(&words, n);
        if grams.is_empty() {
            continue;
        }
        let match_expr = grams.join(" OR ");
        let results = fts_query(store, collections, &match_expr, k)?;
        if !results.is_empty() {
            log::debug!("full-text hit at n={n} for query: {text}");
            return Ok(results);
        }
    }

    Ok(Vec::new())
}

fn fts_query(
    store: &Store,
    collections: &[String],
    match_expr: &str,
    k: usize,
) -> Result<Vec<ResultInfo>> {
    let name_params = placeholders(collections.len());
    let sql = format!(
        "select chunks_fts.chunk_id, documents.document_time, chunks_fts.chunk_text, \
         chunks_fts.file, chunks_fts.title, chunks_fts.author, chunks_fts.page, \
         chunks_fts.line_from, chunks_fts.line_to \
         from chunks_fts \
         join documents on chunks_fts.document_id = documents.id \
         join folders on documents.folder_id = folders.id \
         join collections on folders.id = collections.folder_id \
         where chunks_fts match ? and collections.collection_name in ({name_params}) \
         order by bm25(chunks_fts) \
         limit ?"
    );

    let mut values: Vec<Value> = Vec::with_capacity(collections.len() + 2);
    values.push(Value::from(match_expr.to_string()));
    values.extend(collections.iter().map(|n| Value::from(n.clone())));
    values.push(Value::from(k as i64));

    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), result_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().map(|(_, info)| info).collect())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn result_row(row: &Row) -> rusqlite::Result<(i64, ResultInfo)> {
    let chunk_id: i64 = row.get(0)?;
    let mtime_ms: i64 = row.get(1)?;
    let date = Utc
        .timestamp_millis_opt(mtime_ms)
        .single()
        .map(|dt| dt.format("%Y, %B %d").to_string())
        .unwrap_or_default();
    Ok((
        chunk_id,
        ResultInfo {
            text: row.get(2)?,
            file: row.get(3)?,
            title: row.get(4)?,
            author: row.get(5)?,
            date,
            page: int_column(row, 6)?,
            line_from: int_column(row, 7)?,
            line_to: int_column(row, 8)?,
        },
    ))
}

/// FTS columns come back with whatever affinity they were stored under, so
/// numeric metadata is coerced defensively.
fn int_column(row: &Row, idx: usize) -> rusqlite::Result<i64> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(i) => i,
        ValueRef::Real(f) => f as i64,
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-1),
        _ => -1,
    })
}

/// Strips common punctuation and splits on whitespace.
fn clean_words(input: &str) -> Vec<String> {
    const PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '"', '(', ')', '-'];
    input
        .replace(PUNCTUATION, "")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// All overlapping n-grams rendered as FTS5 NEAR phrases.
///
/// The trigram tokenizer emits one token per character position, which puts
/// adjacent words roughly three tokens apart; the NEAR window is scaled by
/// that factor or adjacent words would never satisfy it.
fn generate_grams(words: &[String], n: usize) -> Vec<String> {
    let n = n.min(words.len());
    if n == 0 {
        return Vec::new();
    }
    let slop = 3 * n;
    words
        .windows(n)
        .map(|window| {
            let quoted = window
                .iter()
                .map(|w| format!("\"{w}\""))
                .collect::<Vec<_>>()
                .join(" ");
            if n == 1 {
                quoted
            } else {
                format!("NEAR({quoted}, {slop})")
            }
        })
        .collect()
}
