//! Persistent document/chunk store backed by SQLite
//!
//! Holds the four tables of the system of record: docs, chunks, indices and
//! jobs. Rows are soft-deleted (`deleted_at`), never physically removed.
//! Connections come from a bounded pool with WAL mode and a 30s busy timeout;
//! every logical operation runs inside one IMMEDIATE transaction.

use crate::types::{ChunkRecord, Document, IndexMeta, Job, JobStatus, JobType, QueueStats};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

const POOL_SIZE: u32 = 8;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS docs (
    doc_id              TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    namespace           TEXT NOT NULL,
    source              TEXT,
    doc_hash            TEXT NOT NULL,
    meta_json           TEXT,
    policy_id           TEXT,
    embedding_model_id  TEXT NOT NULL,
    embedding_version   TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    deleted_at          TEXT
);
CREATE INDEX IF NOT EXISTS idx_docs_tenant_namespace ON docs(tenant_id, namespace);
CREATE INDEX IF NOT EXISTS idx_docs_tenant_namespace_deleted ON docs(tenant_id, namespace, deleted_at);
CREATE INDEX IF NOT EXISTS idx_docs_hash ON docs(doc_hash);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id            TEXT PRIMARY KEY,
    doc_id              TEXT NOT NULL REFERENCES docs(doc_id),
    tenant_id           TEXT NOT NULL,
    namespace           TEXT NOT NULL,
    chunk_hash          TEXT NOT NULL,
    text                TEXT NOT NULL,
    embed_text          TEXT,
    offset_start        INTEGER,
    offset_end          INTEGER,
    meta_json           TEXT,
    policy_id           TEXT,
    embedding_model_id  TEXT NOT NULL,
    embedding_version   TEXT NOT NULL,
    faiss_id            INTEGER,
    created_at          TEXT NOT NULL,
    deleted_at          TEXT
);
CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id);
CREATE INDEX IF NOT EXISTS idx_chunks_tenant_namespace ON chunks(tenant_id, namespace);
CREATE INDEX IF NOT EXISTS idx_chunks_tenant_namespace_deleted ON chunks(tenant_id, namespace, deleted_at);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(chunk_hash);
CREATE INDEX IF NOT EXISTS idx_chunks_faiss_id ON chunks(faiss_id);

CREATE TABLE IF NOT EXISTS indices (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id           TEXT NOT NULL,
    namespace           TEXT NOT NULL,
    embedding_version   TEXT NOT NULL,
    faiss_path          TEXT NOT NULL,
    ntotal              INTEGER NOT NULL DEFAULT 0,
    dimension           INTEGER NOT NULL,
    dirty               INTEGER NOT NULL DEFAULT 0,
    updated_at          TEXT NOT NULL,
    UNIQUE(tenant_id, namespace, embedding_version)
);
CREATE INDEX IF NOT EXISTS idx_indices_dirty ON indices(dirty);

CREATE TABLE IF NOT EXISTS jobs (
    job_id              TEXT PRIMARY KEY,
    type                TEXT NOT NULL,
    payload_json        TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'pending',
    progress            INTEGER NOT NULL DEFAULT 0,
    error               TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_type_status ON jobs(type, status);
";

fn parse_ts(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.map(parse_ts)
}

fn parse_json(value: Option<String>) -> Value {
    value
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn json_to_sql(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        serde_json::to_string(value).ok()
    }
}

fn doc_from_row(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        doc_id: row.get("doc_id")?,
        tenant_id: row.get("tenant_id")?,
        namespace: row.get("namespace")?,
        source: row.get("source")?,
        doc_hash: row.get("doc_hash")?,
        metadata: parse_json(row.get("meta_json")?),
        policy_id: row.get("policy_id")?,
        embedding_model_id: row.get("embedding_model_id")?,
        embedding_version: row.get("embedding_version")?,
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
        deleted_at: opt_ts(row.get("deleted_at")?),
    })
}

fn chunk_from_row(row: &Row) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        chunk_id: row.get("chunk_id")?,
        doc_id: row.get("doc_id")?,
        tenant_id: row.get("tenant_id")?,
        namespace: row.get("namespace")?,
        chunk_hash: row.get("chunk_hash")?,
        text: row.get("text")?,
        embed_text: row.get("embed_text")?,
        offset_start: row.get("offset_start")?,
        offset_end: row.get("offset_end")?,
        metadata: parse_json(row.get("meta_json")?),
        policy_id: row.get("policy_id")?,
        embedding_model_id: row.get("embedding_model_id")?,
        embedding_version: row.get("embedding_version")?,
        faiss_id: row.get("faiss_id")?,
        created_at: parse_ts(row.get("created_at")?),
        deleted_at: opt_ts(row.get("deleted_at")?),
    })
}

fn meta_from_row(row: &Row) -> rusqlite::Result<IndexMeta> {
    Ok(IndexMeta {
        tenant_id: row.get("tenant_id")?,
        namespace: row.get("namespace")?,
        embedding_version: row.get("embedding_version")?,
        faiss_path: row.get("faiss_path")?,
        ntotal: row.get("ntotal")?,
        dimension: row.get("dimension")?,
        dirty: row.get::<_, i64>("dirty")? != 0,
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let type_str: String = row.get("type")?;
    let status_str: String = row.get("status")?;
    Ok(Job {
        job_id: row.get("job_id")?,
        job_type: type_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        payload: parse_json(row.get("payload_json")?),
        status: status_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        progress: row.get("progress")?,
        error: row.get("error")?,
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
        started_at: opt_ts(row.get("started_at")?),
        completed_at: opt_ts(row.get("completed_at")?),
    })
}

/// SQLite-backed store with a bounded connection pool
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (and migrate) the store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            // journal_mode returns a row, so it cannot go through execute_batch
            let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            conn.execute_batch("PRAGMA foreign_keys=ON;")?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .context("failed to build connection pool")?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA).context("failed to create schema")?;
        drop(conn);

        debug!(path = %path.display(), "opened store");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("connection pool exhausted")
    }

    /// Run a closure inside a single IMMEDIATE transaction
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin transaction")?;
        let result = f(&tx)?;
        tx.commit().context("failed to commit transaction")?;
        Ok(result)
    }

    /// Cheap connectivity check for the health endpoint
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    pub fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let conn = self.conn()?;
        Self::get_document_conn(&conn, doc_id)
    }

    pub fn get_document_conn(conn: &Connection, doc_id: &str) -> Result<Option<Document>> {
        let doc = conn
            .query_row("SELECT * FROM docs WHERE doc_id = ?1", params![doc_id], doc_from_row)
            .optional()?;
        Ok(doc)
    }

    /// Insert or fully replace a document row (used by the upsert pipeline)
    pub fn put_document(tx: &Transaction, doc: &Document) -> Result<()> {
        tx.execute(
            "INSERT INTO docs (doc_id, tenant_id, namespace, source, doc_hash, meta_json,
                               policy_id, embedding_model_id, embedding_version,
                               created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(doc_id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                namespace = excluded.namespace,
                source = excluded.source,
                doc_hash = excluded.doc_hash,
                meta_json = excluded.meta_json,
                policy_id = excluded.policy_id,
                embedding_model_id = excluded.embedding_model_id,
                embedding_version = excluded.embedding_version,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at",
            params![
                doc.doc_id,
                doc.tenant_id,
                doc.namespace,
                doc.source,
                doc.doc_hash,
                json_to_sql(&doc.metadata),
                doc.policy_id,
                doc.embedding_model_id,
                doc.embedding_version,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
                doc.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Soft-delete a document and all its chunks. Returns the number of
    /// chunks marked deleted, or None when the document is unknown/deleted.
    pub fn mark_document_deleted(&self, doc_id: &str) -> Result<Option<usize>> {
        self.transaction(|tx| {
            let doc = Self::get_document_conn(tx, doc_id)?;
            let doc = match doc {
                Some(d) if d.is_live() => d,
                _ => return Ok(None),
            };
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE docs SET deleted_at = ?1, updated_at = ?1 WHERE doc_id = ?2",
                params![now, doc_id],
            )?;
            let chunks = Self::mark_chunks_deleted(tx, doc_id)?;
            Self::set_dirty(tx, &doc.tenant_id, &doc.namespace, &doc.embedding_version, true)?;
            Ok(Some(chunks))
        })
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    pub fn insert_chunks(tx: &Transaction, chunks: &[ChunkRecord]) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO chunks (chunk_id, doc_id, tenant_id, namespace, chunk_hash, text,
                                 embed_text, offset_start, offset_end, meta_json, policy_id,
                                 embedding_model_id, embedding_version, faiss_id,
                                 created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        for chunk in chunks {
            stmt.execute(params![
                chunk.chunk_id,
                chunk.doc_id,
                chunk.tenant_id,
                chunk.namespace,
                chunk.chunk_hash,
                chunk.text,
                chunk.embed_text,
                chunk.offset_start,
                chunk.offset_end,
                json_to_sql(&chunk.metadata),
                chunk.policy_id,
                chunk.embedding_model_id,
                chunk.embedding_version,
                chunk.faiss_id,
                chunk.created_at.to_rfc3339(),
                chunk.deleted_at.map(|t| t.to_rfc3339()),
            ])?;
        }
        Ok(())
    }

    /// Soft-delete all live chunks of a document. Returns the count.
    pub fn mark_chunks_deleted(tx: &Transaction, doc_id: &str) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let count = tx.execute(
            "UPDATE chunks SET deleted_at = ?1 WHERE doc_id = ?2 AND deleted_at IS NULL",
            params![now, doc_id],
        )?;
        Ok(count)
    }

    /// All live chunks for a (tenant, namespace, version) key, oldest first
    pub fn live_chunks(
        &self,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
    ) -> Result<Vec<ChunkRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM chunks
             WHERE tenant_id = ?1 AND namespace = ?2 AND embedding_version = ?3
               AND deleted_at IS NULL
             ORDER BY created_at, chunk_id",
        )?;
        let chunks = stmt
            .query_map(params![tenant_id, namespace, embedding_version], chunk_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    pub fn set_faiss_id(tx: &Transaction, chunk_id: &str, faiss_id: i64) -> Result<()> {
        tx.execute(
            "UPDATE chunks SET faiss_id = ?1 WHERE chunk_id = ?2",
            params![faiss_id, chunk_id],
        )?;
        Ok(())
    }

    /// Stamp a chunk with a new embedding version and model (re-embed path)
    pub fn set_chunk_version(
        tx: &Transaction,
        chunk_id: &str,
        embedding_version: &str,
        embedding_model_id: &str,
    ) -> Result<()> {
        tx.execute(
            "UPDATE chunks SET embedding_version = ?1, embedding_model_id = ?2 WHERE chunk_id = ?3",
            params![embedding_version, embedding_model_id, chunk_id],
        )?;
        Ok(())
    }

    /// Resolve a vector index position to its live chunk, if any
    pub fn find_chunk_by_faiss_id(
        &self,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
        faiss_id: i64,
    ) -> Result<Option<ChunkRecord>> {
        let conn = self.conn()?;
        let chunk = conn
            .query_row(
                "SELECT * FROM chunks
                 WHERE tenant_id = ?1 AND namespace = ?2 AND embedding_version = ?3
                   AND faiss_id = ?4 AND deleted_at IS NULL",
                params![tenant_id, namespace, embedding_version, faiss_id],
                chunk_from_row,
            )
            .optional()?;
        Ok(chunk)
    }

    /// Fetch a single live chunk by id
    pub fn get_chunk_live(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let conn = self.conn()?;
        let chunk = conn
            .query_row(
                "SELECT * FROM chunks WHERE chunk_id = ?1 AND deleted_at IS NULL",
                params![chunk_id],
                chunk_from_row,
            )
            .optional()?;
        Ok(chunk)
    }

    // ========================================================================
    // Index metadata
    // ========================================================================

    /// Fetch the metadata row for a key, creating it when missing
    pub fn get_or_create_index_meta(
        tx: &Transaction,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
        default_path: &str,
        default_dim: i64,
    ) -> Result<IndexMeta> {
        if let Some(meta) = Self::get_index_meta_conn(tx, tenant_id, namespace, embedding_version)? {
            return Ok(meta);
        }
        let now = Utc::now();
        tx.execute(
            "INSERT INTO indices (tenant_id, namespace, embedding_version, faiss_path,
                                  ntotal, dimension, dirty, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, 0, ?6)",
            params![tenant_id, namespace, embedding_version, default_path, default_dim, now.to_rfc3339()],
        )?;
        Ok(IndexMeta {
            tenant_id: tenant_id.to_string(),
            namespace: namespace.to_string(),
            embedding_version: embedding_version.to_string(),
            faiss_path: default_path.to_string(),
            ntotal: 0,
            dimension: default_dim,
            dirty: false,
            updated_at: now,
        })
    }

    pub fn get_index_meta(
        &self,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
    ) -> Result<Option<IndexMeta>> {
        let conn = self.conn()?;
        Self::get_index_meta_conn(&conn, tenant_id, namespace, embedding_version)
    }

    pub fn get_index_meta_conn(
        conn: &Connection,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
    ) -> Result<Option<IndexMeta>> {
        let meta = conn
            .query_row(
                "SELECT * FROM indices
                 WHERE tenant_id = ?1 AND namespace = ?2 AND embedding_version = ?3",
                params![tenant_id, namespace, embedding_version],
                meta_from_row,
            )
            .optional()?;
        Ok(meta)
    }

    /// Update ntotal and the dirty flag after a save or rebuild
    pub fn update_index_meta(
        tx: &Transaction,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
        ntotal: i64,
        dirty: bool,
    ) -> Result<()> {
        tx.execute(
            "UPDATE indices SET ntotal = ?1, dirty = ?2, updated_at = ?3
             WHERE tenant_id = ?4 AND namespace = ?5 AND embedding_version = ?6",
            params![
                ntotal,
                dirty as i64,
                Utc::now().to_rfc3339(),
                tenant_id,
                namespace,
                embedding_version
            ],
        )?;
        Ok(())
    }

    /// Transaction-scoped dirty flag update
    pub fn mark_index_dirty_tx(
        tx: &Transaction,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
    ) -> Result<()> {
        Self::set_dirty(tx, tenant_id, namespace, embedding_version, true)
    }

    fn set_dirty(
        tx: &Transaction,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
        dirty: bool,
    ) -> Result<()> {
        tx.execute(
            "UPDATE indices SET dirty = ?1, updated_at = ?2
             WHERE tenant_id = ?3 AND namespace = ?4 AND embedding_version = ?5",
            params![
                dirty as i64,
                Utc::now().to_rfc3339(),
                tenant_id,
                namespace,
                embedding_version
            ],
        )?;
        Ok(())
    }

    /// Flag an index as needing rebuild
    pub fn mark_index_dirty(
        &self,
        tenant_id: &str,
        namespace: &str,
        embedding_version: &str,
    ) -> Result<()> {
        self.transaction(|tx| Self::set_dirty(tx, tenant_id, namespace, embedding_version, true))
    }

    pub fn list_index_meta(&self) -> Result<Vec<IndexMeta>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM indices ORDER BY tenant_id, namespace, embedding_version")?;
        let metas = stmt
            .query_map([], meta_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metas)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn create_job(&self, job_id: &str, job_type: JobType, payload: &Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO jobs (job_id, type, payload_json, status, progress, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
                params![job_id, job_type.to_string(), serde_json::to_string(payload)?, now],
            )?;
            Ok(())
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let job = conn
            .query_row("SELECT * FROM jobs WHERE job_id = ?1", params![job_id], job_from_row)
            .optional()?;
        Ok(job)
    }

    pub fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        self.transaction(|tx| {
            let now = Utc::now().to_rfc3339();
            let progress = progress.map(|p| p.clamp(0, 100));
            tx.execute(
                "UPDATE jobs SET
                    status = ?1,
                    progress = COALESCE(?2, CASE WHEN ?1 = 'completed' THEN 100 ELSE progress END),
                    error = COALESCE(?3, error),
                    started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL THEN ?4 ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?4 ELSE completed_at END,
                    updated_at = ?4
                 WHERE job_id = ?5",
                params![status.to_string(), progress, error, now, job_id],
            )?;
            Ok(())
        })
    }

    /// Atomically claim the oldest pending job: select it and flip it to
    /// running inside one transaction so concurrent workers cannot double-claim.
    pub fn claim_next_pending(&self) -> Result<Option<Job>> {
        self.transaction(|tx| {
            let job_id: Option<String> = tx
                .query_row(
                    "SELECT job_id FROM jobs WHERE status = 'pending'
                     ORDER BY created_at, job_id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let job_id = match job_id {
                Some(id) => id,
                None => return Ok(None),
            };
            let now = Utc::now().to_rfc3339();
            let updated = tx.execute(
                "UPDATE jobs SET status = 'running', started_at = ?1, updated_at = ?1
                 WHERE job_id = ?2 AND status = 'pending'",
                params![now, job_id],
            )?;
            if updated == 0 {
                // Lost the race inside an even stricter setup; caller retries
                return Ok(None);
            }
            let job = tx.query_row("SELECT * FROM jobs WHERE job_id = ?1", params![job_id], job_from_row)?;
            Ok(Some(job))
        })
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match status.as_str() {
                "pending" => stats.pending = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::chunk_id_for;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn sample_doc(doc_id: &str) -> Document {
        let now = Utc::now();
        Document {
            doc_id: doc_id.to_string(),
            tenant_id: "t1".to_string(),
            namespace: "ns1".to_string(),
            source: Some("unit-test".to_string()),
            doc_hash: "hash-abc".to_string(),
            metadata: json!({"filename": "a.txt"}),
            policy_id: None,
            embedding_model_id: "model-x".to_string(),
            embedding_version: "v1".to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn sample_chunk(doc_id: &str, ordinal: usize) -> ChunkRecord {
        ChunkRecord {
            chunk_id: chunk_id_for(doc_id, ordinal),
            doc_id: doc_id.to_string(),
            tenant_id: "t1".to_string(),
            namespace: "ns1".to_string(),
            chunk_hash: format!("chunk-hash-{}", ordinal),
            text: format!("chunk text {}", ordinal),
            embed_text: None,
            offset_start: None,
            offset_end: None,
            metadata: Value::Null,
            policy_id: None,
            embedding_model_id: "model-x".to_string(),
            embedding_version: "v1".to_string(),
            faiss_id: Some(ordinal as i64),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_document_roundtrip() {
        let (_dir, store) = test_store();
        let doc = sample_doc("d1");
        store.transaction(|tx| Store::put_document(tx, &doc)).unwrap();

        let loaded = store.get_document("d1").unwrap().unwrap();
        assert_eq!(loaded.doc_id, "d1");
        assert_eq!(loaded.doc_hash, "hash-abc");
        assert_eq!(loaded.metadata["filename"], "a.txt");
        assert!(loaded.is_live());

        assert!(store.get_document("missing").unwrap().is_none());
    }

    #[test]
    fn test_chunk_insert_and_live_query() {
        let (_dir, store) = test_store();
        let doc = sample_doc("d1");
        let chunks: Vec<ChunkRecord> = (0..3).map(|i| sample_chunk("d1", i)).collect();
        store
            .transaction(|tx| {
                Store::put_document(tx, &doc)?;
                Store::insert_chunks(tx, &chunks)
            })
            .unwrap();

        let live = store.live_chunks("t1", "ns1", "v1").unwrap();
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].chunk_id, "d1#c0000");

        // Wrong key sees nothing
        assert!(store.live_chunks("t2", "ns1", "v1").unwrap().is_empty());
        assert!(store.live_chunks("t1", "ns1", "v2").unwrap().is_empty());
    }

    #[test]
    fn test_soft_delete_hides_chunks() {
        let (_dir, store) = test_store();
        let doc = sample_doc("d1");
        let chunks: Vec<ChunkRecord> = (0..2).map(|i| sample_chunk("d1", i)).collect();
        store
            .transaction(|tx| {
                Store::put_document(tx, &doc)?;
                Store::get_or_create_index_meta(tx, "t1", "ns1", "v1", "/tmp/x.faiss", 4)?;
                Store::insert_chunks(tx, &chunks)
            })
            .unwrap();

        let deleted = store.mark_document_deleted("d1").unwrap();
        assert_eq!(deleted, Some(2));

        assert!(store.live_chunks("t1", "ns1", "v1").unwrap().is_empty());
        let doc = store.get_document("d1").unwrap().unwrap();
        assert!(!doc.is_live());

        // Deleting again reports not-found semantics
        assert_eq!(store.mark_document_deleted("d1").unwrap(), None);

        // Deletion marked the index dirty
        let meta = store.get_index_meta("t1", "ns1", "v1").unwrap().unwrap();
        assert!(meta.dirty);
    }

    #[test]
    fn test_find_chunk_by_faiss_id_filters_deleted() {
        let (_dir, store) = test_store();
        let doc = sample_doc("d1");
        let chunks: Vec<ChunkRecord> = (0..2).map(|i| sample_chunk("d1", i)).collect();
        store
            .transaction(|tx| {
                Store::put_document(tx, &doc)?;
                Store::insert_chunks(tx, &chunks)
            })
            .unwrap();

        let found = store.find_chunk_by_faiss_id("t1", "ns1", "v1", 1).unwrap();
        assert_eq!(found.unwrap().chunk_id, "d1#c0001");

        store.mark_document_deleted("d1").unwrap();
        assert!(store.find_chunk_by_faiss_id("t1", "ns1", "v1", 1).unwrap().is_none());
    }

    #[test]
    fn test_index_meta_lifecycle() {
        let (_dir, store) = test_store();
        let meta = store
            .transaction(|tx| Store::get_or_create_index_meta(tx, "t1", "ns1", "v1", "/tmp/i.faiss", 384))
            .unwrap();
        assert_eq!(meta.ntotal, 0);
        assert!(!meta.dirty);

        store
            .transaction(|tx| Store::update_index_meta(tx, "t1", "ns1", "v1", 42, false))
            .unwrap();
        let meta = store.get_index_meta("t1", "ns1", "v1").unwrap().unwrap();
        assert_eq!(meta.ntotal, 42);

        store.mark_index_dirty("t1", "ns1", "v1").unwrap();
        let meta = store.get_index_meta("t1", "ns1", "v1").unwrap().unwrap();
        assert!(meta.dirty);

        // Re-create returns the existing row
        let again = store
            .transaction(|tx| Store::get_or_create_index_meta(tx, "t1", "ns1", "v1", "/other", 999))
            .unwrap();
        assert_eq!(again.ntotal, 42);
        assert_eq!(again.dimension, 384);
    }

    #[test]
    fn test_job_lifecycle() {
        let (_dir, store) = test_store();
        store
            .create_job("job-1", JobType::RebuildIndex, &json!({"tenant_id": "t1"}))
            .unwrap();

        let job = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.payload["tenant_id"], "t1");

        let claimed = store.claim_next_pending().unwrap().unwrap();
        assert_eq!(claimed.job_id, "job-1");
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        // Nothing else pending
        assert!(store.claim_next_pending().unwrap().is_none());

        store
            .update_job_status("job-1", JobStatus::Completed, None, None)
            .unwrap();
        let done = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_claim_is_fifo() {
        let (_dir, store) = test_store();
        store.create_job("job-a", JobType::IngestDocs, &json!({})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create_job("job-b", JobType::IngestDocs, &json!({})).unwrap();

        assert_eq!(store.claim_next_pending().unwrap().unwrap().job_id, "job-a");
        assert_eq!(store.claim_next_pending().unwrap().unwrap().job_id, "job-b");
    }

    #[test]
    fn test_job_failure_records_error() {
        let (_dir, store) = test_store();
        store.create_job("job-1", JobType::IngestDocs, &json!({})).unwrap();
        store.claim_next_pending().unwrap();
        store
            .update_job_status("job-1", JobStatus::Failed, None, Some("boom"))
            .unwrap();

        let job = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_queue_stats() {
        let (_dir, store) = test_store();
        for i in 0..3 {
            store
                .create_job(&format!("job-{}", i), JobType::IngestDocs, &json!({}))
                .unwrap();
        }
        store.claim_next_pending().unwrap();
        store
            .update_job_status("job-0", JobStatus::Completed, None, None)
            .unwrap();

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 1);
    }
}
