//! Knowledge base store: markdown documents chunked into an SQLite FTS5 index.
//!
//! Retrieval is keyword BM25 over chunk text. Documents are deduplicated by
//! SHA-256 content hash so rebuilding from the same directory is a no-op.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use text_splitter::{ChunkConfig, MarkdownSplitter};
use tracing::{debug, info, warn};

use crate::error::AppError;

const DB_FILENAME: &str = "chunks.db";
const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// File name or other origin tag.
    pub source: String,
    pub content: String,
    pub content_hash: String,
    pub created_at: String,
}

impl Document {
    /// New document; id, hash and timestamp are filled in on insert.
    pub fn new(title: impl Into<String>, source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            source: source.into(),
            content: content.into(),
            content_hash: String::new(),
            created_at: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    pub doc_id: String,
    pub title: String,
    pub source: String,
    pub content_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub text: String,
    /// Byte offset of the chunk within the document.
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    /// Negated BM25: higher is more relevant.
    pub score: f32,
    pub doc: DocMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub documents_added: usize,
    pub documents_skipped: usize,
    /// Stored documents that had no chunks and were indexed again.
    pub documents_reindexed: usize,
    pub chunks_indexed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    db_path: PathBuf,
}

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> AppError + '_ {
    move |e| AppError::Knowledge(format!("{context}: {e}"))
}

impl KnowledgeStore {
    /// Open (creating if needed) `store_dir/chunks.db`.
    pub fn open(store_dir: &Path) -> Result<Self, AppError> {
        fs::create_dir_all(store_dir).map_err(|e| {
            AppError::Knowledge(format!("cannot create {}: {e}", store_dir.display()))
        })?;
        let store = Self { db_path: store_dir.join(DB_FILENAME) };
        store.init_db()?;
        Ok(store)
    }

    /// Insert `doc` unless a document with identical content exists.
    /// Returns the id of the stored (or pre-existing) document.
    pub fn add_document(&self, mut doc: Document) -> Result<String, AppError> {
        if doc.content_hash.is_empty() {
            doc.content_hash = sha256_hex(&doc.content);
        }
        let conn = self.open_conn()?;
        if let Some(existing) = find_doc_id_by_hash(&conn, &doc.content_hash)? {
            debug!(doc_id = %existing, source = %doc.source, "document already stored");
            return Ok(existing);
        }
        if doc.id.is_empty() {
            doc.id = uuid::Uuid::now_v7().to_string();
        }
        if doc.created_at.is_empty() {
            doc.created_at = now_iso8601();
        }
        conn.execute(
            "INSERT INTO documents (doc_id, title, source, content, content_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![doc.id, doc.title, doc.source, doc.content, doc.content_hash, doc.created_at],
        )
        .map_err(db_err("insert document"))?;
        Ok(doc.id)
    }

    pub fn get_document(&self, doc_id: &str) -> Result<Document, AppError> {
        let conn = self.open_conn()?;
        conn.query_row(
            "SELECT title, source, content, content_hash, created_at FROM documents WHERE doc_id = ?1",
            params![doc_id],
            |row| {
                Ok(Document {
                    id: doc_id.to_string(),
                    title: row.get(0)?,
                    source: row.get(1)?,
                    content: row.get(2)?,
                    content_hash: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .map_err(|e| AppError::Knowledge(format!("get document {doc_id}: {e}")))
    }

    pub fn list_documents(&self) -> Result<Vec<DocMetadata>, AppError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare("SELECT doc_id, title, source, content_hash, created_at FROM documents ORDER BY source")
            .map_err(db_err("prepare list_documents"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DocMetadata {
                    doc_id: row.get(0)?,
                    title: row.get(1)?,
                    source: row.get(2)?,
                    content_hash: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(db_err("query list_documents"))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err("map list_documents row"))
    }

    pub fn delete_document(&self, doc_id: &str) -> Result<(), AppError> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction().map_err(db_err("begin delete tx"))?;
        tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])
            .map_err(db_err("delete chunks"))?;
        tx.execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])
            .map_err(db_err("delete document"))?;
        tx.commit().map_err(db_err("commit delete tx"))
    }

    /// Split a stored document along markdown structure into chunks of at
    /// most `chunk_size` characters, consecutive chunks sharing up to
    /// `overlap` characters.
    pub fn chunk_document(&self, doc_id: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>, AppError> {
        if chunk_size == 0 {
            return Err(AppError::Knowledge("chunk_size must be > 0".into()));
        }
        if overlap >= chunk_size {
            return Err(AppError::Knowledge(format!(
                "chunk overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        let config = ChunkConfig::new(chunk_size)
            .with_overlap(overlap)
            .map_err(|e| AppError::Knowledge(format!("invalid chunk overlap: {e}")))?;
        let doc = self.get_document(doc_id)?;
        let splitter = MarkdownSplitter::new(config);
        Ok(splitter
            .chunk_indices(&doc.content)
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(position, text)| Chunk {
                id: uuid::Uuid::now_v7().to_string(),
                doc_id: doc_id.to_string(),
                text: text.to_string(),
                position,
            })
            .collect())
    }

    /// Index `chunks`, replacing any chunks already stored for the same documents.
    pub fn index_chunks(&self, chunks: &[Chunk]) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut conn = self.open_conn()?;
        let tx = conn.transaction().map_err(db_err("begin index tx"))?;

        let doc_ids: HashSet<&str> = chunks.iter().map(|c| c.doc_id.as_str()).collect();
        for doc_id in doc_ids {
            tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])
                .map_err(db_err("clear chunks before reindex"))?;
        }
        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (id, doc_id, text, position) VALUES (?1, ?2, ?3, ?4)",
                params![chunk.id, chunk.doc_id, chunk.text, chunk.position as i64],
            )
            .map_err(db_err("insert chunk"))?;
        }
        tx.commit().map_err(db_err("commit index tx"))
    }

    /// Top `k` chunks for `query`, best first. Any query term may match.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>, AppError> {
        let match_expr = fts5_any_terms(query);
        if match_expr.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(k).unwrap_or(i64::MAX);
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT chunks.id, chunks.doc_id, chunks.text, chunks.position, bm25(chunks) AS rank,
                        documents.title, documents.source, documents.content_hash, documents.created_at
                 FROM chunks
                 JOIN documents ON documents.doc_id = chunks.doc_id
                 WHERE chunks MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )
            .map_err(db_err("prepare search"))?;
        let rows = stmt
            .query_map(params![match_expr, limit], |row| {
                let doc_id: String = row.get(1)?;
                let bm25: f64 = row.get(4)?;
                Ok(SearchResult {
                    chunk: Chunk {
                        id: row.get(0)?,
                        doc_id: doc_id.clone(),
                        text: row.get(2)?,
                        position: row.get::<_, i64>(3)? as usize,
                    },
                    score: (-bm25) as f32,
                    doc: DocMetadata {
                        doc_id,
                        title: row.get(5)?,
                        source: row.get(6)?,
                        content_hash: row.get(7)?,
                        created_at: row.get(8)?,
                    },
                })
            })
            .map_err(db_err("execute search"))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err("map search row"))
    }

    /// Import every `*.md` file directly under `dir`, then chunk and index
    /// the ones not already stored.
    pub fn build_from_dir(&self, dir: &Path, chunk_size: usize, overlap: usize) -> Result<BuildReport, AppError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            AppError::Knowledge(format!("cannot read knowledge base {}: {e}", dir.display()))
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();

        let mut report = BuildReport::default();
        for path in paths {
            let content = fs::read_to_string(&path)?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let hash = sha256_hex(&content);
            if let Some(doc_id) = find_doc_id_by_hash(&self.open_conn()?, &hash)? {
                if self.chunk_count(&doc_id)? > 0 {
                    report.documents_skipped += 1;
                    continue;
                }
                let indexed = self.index_document(&doc_id, chunk_size, overlap)?;
                warn!(%source, chunks = indexed, "stored document had no chunks, reindexed");
                report.documents_reindexed += 1;
                report.chunks_indexed += indexed;
                continue;
            }
            let title = markdown_title(&content).unwrap_or_else(|| {
                path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
            });
            let doc_id = self.add_document(Document { content_hash: hash, ..Document::new(title, &source, content) })?;
            let indexed = match self.index_document(&doc_id, chunk_size, overlap) {
                Ok(n) => n,
                Err(e) => {
                    // Roll back the document row.
                    if let Err(cleanup) = self.delete_document(&doc_id) {
                        warn!(%source, error = %cleanup, "could not remove unindexed document");
                    }
                    return Err(e);
                }
            };
            debug!(%source, chunks = indexed, "knowledge document indexed");
            report.documents_added += 1;
            report.chunks_indexed += indexed;
        }
        info!(
            added = report.documents_added,
            skipped = report.documents_skipped,
            reindexed = report.documents_reindexed,
            chunks = report.chunks_indexed,
            dir = %dir.display(),
            "knowledge base built"
        );
        Ok(report)
    }

    fn index_document(&self, doc_id: &str, chunk_size: usize, overlap: usize) -> Result<usize, AppError> {
        let chunks = self.chunk_document(doc_id, chunk_size, overlap)?;
        self.index_chunks(&chunks)?;
        Ok(chunks.len())
    }

    fn chunk_count(&self, doc_id: &str) -> Result<usize, AppError> {
        self.open_conn()?
            .query_row("SELECT COUNT(*) FROM chunks WHERE doc_id = ?1", params![doc_id], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(db_err("count document chunks"))
    }

    pub fn stats(&self) -> Result<StoreStats, AppError> {
        let conn = self.open_conn()?;
        let count = |sql: &str| -> Result<usize, AppError> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(db_err("count rows"))
        };
        Ok(StoreStats {
            documents: count("SELECT COUNT(*) FROM documents")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
        })
    }

    fn init_db(&self) -> Result<(), AppError> {
        let conn = self.open_conn()?;
        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .map_err(db_err("read schema version"))?;

        if version == 0 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS documents (
                    doc_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    source TEXT NOT NULL,
                    content TEXT NOT NULL,
                    content_hash TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE VIRTUAL TABLE IF NOT EXISTS chunks USING fts5(
                    id UNINDEXED,
                    doc_id UNINDEXED,
                    text,
                    position UNINDEXED
                );

                PRAGMA user_version = 1;
                ",
            )
            .map_err(db_err("initialize schema"))?;
            return Ok(());
        }
        if version != SCHEMA_VERSION {
            return Err(AppError::Knowledge(format!(
                "unsupported schema version {version}, expected {SCHEMA_VERSION}"
            )));
        }
        Ok(())
    }

    fn open_conn(&self) -> Result<Connection, AppError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| AppError::Knowledge(format!("open {}: {e}", self.db_path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err("set journal_mode WAL"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(db_err("set busy_timeout"))?;
        Ok(conn)
    }
}

fn find_doc_id_by_hash(conn: &Connection, content_hash: &str) -> Result<Option<String>, AppError> {
    conn.query_row(
        "SELECT doc_id FROM documents WHERE content_hash = ?1",
        params![content_hash],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err("find by hash"))
}

/// Build an FTS5 `MATCH` expression that matches any of the query's words.
/// Each word is quoted so punctuation and FTS operators are taken literally.
pub(crate) fn fts5_any_terms(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|tok| !tok.is_empty())
        .map(|tok| format!("\"{}\"", tok.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Text of the first `#` heading, if any.
fn markdown_title(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.trim_start().strip_prefix('#'))
        .map(|rest| rest.trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
}

fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
