use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_core::constants::MAX_EMBEDDINGS_PER_DOC;
use parley_core::error::ParleyError;

use crate::blob::{decode_embeddings, encode_embeddings};

/// A docstore row: a named collection of documents sharing one embedding
/// model and vector size. `model` and `vector_size` are immutable; changing
/// either means delete and recreate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Docstore {
    pub id: String,
    pub name: String,
    pub timestamp: i64,
    pub model: String,
    pub vector_size: usize,
    pub options: String,
}

/// A stored document with its embedding vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub docstore_id: String,
    pub timestamp: i64,
    pub created_at: i64,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub data: String,
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
}

/// SQLite-backed document store. Single writer, concurrent readers (WAL).
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct DocStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

fn storage_err(e: rusqlite::Error) -> ParleyError {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ParleyError::UniquenessViolation(e.to_string())
        }
        _ => ParleyError::Storage(e.to_string()),
    }
}

impl DocStore {
    /// Open (or create) the docstore database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ParleyError> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Fully in-memory store for tests.
    pub fn open_in_memory() -> Result<Self, ParleyError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ParleyError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").map_err(storage_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS docstores (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                timestamp   INTEGER NOT NULL,
                model       TEXT NOT NULL,
                vector_size INTEGER NOT NULL,
                options     TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS docs (
                aid         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL,
                docstore_id TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                created_at  INTEGER NOT NULL,
                type        TEXT NOT NULL DEFAULT '',
                data        TEXT NOT NULL DEFAULT '',
                embeddings  BLOB NOT NULL,
                include     TEXT,
                UNIQUE(docstore_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_docs_docstore  ON docs(docstore_id);
            CREATE INDEX IF NOT EXISTS idx_docs_timestamp ON docs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_docs_type      ON docs(type);",
        )
        .map_err(storage_err)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // ── Docstores ────────────────────────────────────────────────────────────

    /// Create a docstore, or return the existing id when `name` is taken.
    pub fn create_docstore(
        &self,
        name: &str,
        model: &str,
        vector_size: usize,
        options: &str,
    ) -> Result<String, ParleyError> {
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        if let Some(existing) = conn
            .query_row("SELECT id FROM docstores WHERE name = ?1", params![name], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(storage_err)?
        {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_unix();
        conn.execute(
            "INSERT INTO docstores (id, name, timestamp, model, vector_size, options)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, name, now, model, vector_size as i64, options],
        )
        .map_err(storage_err)?;
        Ok(id)
    }

    pub fn get_docstore(&self, id: &str) -> Result<Option<Docstore>, ParleyError> {
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        conn.query_row(
            "SELECT id, name, timestamp, model, vector_size, options
             FROM docstores WHERE id = ?1",
            params![id],
            row_to_docstore,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn get_docstore_by_name(&self, name: &str) -> Result<Option<Docstore>, ParleyError> {
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        conn.query_row(
            "SELECT id, name, timestamp, model, vector_size, options
             FROM docstores WHERE name = ?1",
            params![name],
            row_to_docstore,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn list_docstores(&self) -> Result<Vec<Docstore>, ParleyError> {
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, name, timestamp, model, vector_size, options
                 FROM docstores ORDER BY name",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], row_to_docstore)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        Ok(rows)
    }

    /// Delete a docstore and all of its documents in one transaction.
    pub fn delete_docstore(&self, id: &str) -> Result<(), ParleyError> {
        let mut conn = self.conn.lock().expect("docstore mutex poisoned");
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute("DELETE FROM docs WHERE docstore_id = ?1", params![id])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM docstores WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)
    }

    // ── Documents ────────────────────────────────────────────────────────────

    /// Insert or replace on `(docstore_id, id)`. A replaced document gets a
    /// fresh `aid`, so live subscription cursors see the update.
    pub fn upsert(&self, doc: &Document) -> Result<(), ParleyError> {
        let docstore = self
            .get_docstore(&doc.docstore_id)?
            .ok_or_else(|| ParleyError::UnknownReference(doc.docstore_id.clone()))?;

        if doc.embeddings.len() >= MAX_EMBEDDINGS_PER_DOC {
            return Err(ParleyError::TooManyEmbeddings { got: doc.embeddings.len() });
        }
        for vector in &doc.embeddings {
            if vector.len() != docstore.vector_size {
                return Err(ParleyError::VectorSizeMismatch {
                    expected: docstore.vector_size,
                    got: vector.len(),
                });
            }
        }
        let blob = encode_embeddings(&doc.embeddings)?;

        let conn = self.conn.lock().expect("docstore mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO docs
                 (id, docstore_id, timestamp, created_at, type, data, embeddings, include)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                doc.id,
                doc.docstore_id,
                doc.timestamp,
                doc.created_at,
                doc.doc_type,
                doc.data,
                blob,
                doc.include
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get(&self, docstore_id: &str, doc_id: &str) -> Result<Option<Document>, ParleyError> {
        let vector_size = match self.get_docstore(docstore_id)? {
            Some(ds) => ds.vector_size,
            None => return Ok(None),
        };
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        let row = conn
            .query_row(
                "SELECT id, docstore_id, timestamp, created_at, type, data, embeddings, include
                 FROM docs WHERE docstore_id = ?1 AND id = ?2",
                params![docstore_id, doc_id],
                row_to_raw_doc,
            )
            .optional()
            .map_err(storage_err)?;
        row.map(|raw| raw.into_document(vector_size)).transpose()
    }

    pub fn delete(&self, docstore_id: &str, doc_id: &str) -> Result<bool, ParleyError> {
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        let n = conn
            .execute(
                "DELETE FROM docs WHERE docstore_id = ?1 AND id = ?2",
                params![docstore_id, doc_id],
            )
            .map_err(storage_err)?;
        Ok(n > 0)
    }

    pub fn count(&self, docstore_id: &str) -> Result<usize, ParleyError> {
        let conn = self.conn.lock().expect("docstore mutex poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM docs WHERE docstore_id = ?1",
            params![docstore_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(storage_err)
    }

    /// Cursor batch: documents with `aid > after_aid`, ascending, at most
    /// `limit`, optionally narrowed by type and timestamp bounds.
    pub(crate) fn fetch_batch(
        &self,
        docstore_id: &str,
        doc_type: Option<&str>,
        since: Option<i64>,
        until: Option<i64>,
        after_aid: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Document)>, ParleyError> {
        let vector_size = self
            .get_docstore(docstore_id)?
            .ok_or_else(|| ParleyError::UnknownReference(docstore_id.to_string()))?
            .vector_size;

        let mut sql = String::from(
            "SELECT aid, id, docstore_id, timestamp, created_at, type, data, embeddings, include
             FROM docs WHERE docstore_id = ?1 AND aid > ?2",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(docstore_id.to_string()), Box::new(after_aid)];
        if let Some(t) = doc_type {
            args.push(Box::new(t.to_string()));
            sql.push_str(&format!(" AND type = ?{}", args.len()));
        }
        if let Some(since) = since {
            args.push(Box::new(since));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(until) = until {
            args.push(Box::new(until));
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY aid ASC LIMIT ?{}", args.len()));

        let conn = self.conn.lock().expect("docstore mutex poisoned");
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|b| b.as_ref())), |row| {
                let aid: i64 = row.get(0)?;
                let raw = RawDoc {
                    id: row.get(1)?,
                    docstore_id: row.get(2)?,
                    timestamp: row.get(3)?,
                    created_at: row.get(4)?,
                    doc_type: row.get(5)?,
                    data: row.get(6)?,
                    blob: row.get(7)?,
                    include: row.get(8)?,
                };
                Ok((aid, raw))
            })
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        rows.into_iter()
            .map(|(aid, raw)| raw.into_document(vector_size).map(|doc| (aid, doc)))
            .collect()
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct RawDoc {
    id: String,
    docstore_id: String,
    timestamp: i64,
    created_at: i64,
    doc_type: String,
    data: String,
    blob: Vec<u8>,
    include: Option<String>,
}

impl RawDoc {
    fn into_document(self, vector_size: usize) -> Result<Document, ParleyError> {
        Ok(Document {
            id: self.id,
            docstore_id: self.docstore_id,
            timestamp: self.timestamp,
            created_at: self.created_at,
            doc_type: self.doc_type,
            data: self.data,
            embeddings: decode_embeddings(&self.blob, vector_size)?,
            include: self.include,
        })
    }
}

fn row_to_docstore(row: &rusqlite::Row<'_>) -> rusqlite::Result<Docstore> {
    Ok(Docstore {
        id: row.get(0)?,
        name: row.get(1)?,
        timestamp: row.get(2)?,
        model: row.get(3)?,
        vector_size: row.get::<_, i64>(4)? as usize,
        options: row.get(5)?,
    })
}

fn row_to_raw_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDoc> {
    Ok(RawDoc {
        id: row.get(0)?,
        docstore_id: row.get(1)?,
        timestamp: row.get(2)?,
        created_at: row.get(3)?,
        doc_type: row.get(4)?,
        data: row.get(5)?,
        blob: row.get(6)?,
        include: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_doc(docstore_id: &str, id: &str, embeddings: Vec<Vec<f32>>) -> Document {
        Document {
            id: id.to_string(),
            docstore_id: docstore_id.to_string(),
            timestamp: 1_700_000_000,
            created_at: 1_700_000_000,
            doc_type: "note".into(),
            data: format!("document {id}"),
            embeddings,
            include: None,
        }
    }

    #[test]
    fn create_docstore_is_idempotent_on_name() {
        let store = DocStore::open_in_memory().unwrap();
        let a = store.create_docstore("kb", "test-model", 3, "").unwrap();
        let b = store.create_docstore("kb", "other-model", 5, "").unwrap();
        assert_eq!(a, b);
        // The original model/vector_size stand; immutable by recreation only.
        let ds = store.get_docstore(&a).unwrap().unwrap();
        assert_eq!(ds.model, "test-model");
        assert_eq!(ds.vector_size, 3);
    }

    #[test]
    fn upsert_get_round_trip() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 3, "").unwrap();
        let doc = sample_doc(&ds, "d1", vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        store.upsert(&doc).unwrap();

        let got = store.get(&ds, "d1").unwrap().unwrap();
        assert_eq!(got.embeddings, doc.embeddings);
        assert_eq!(got.data, doc.data);
        assert_eq!(store.count(&ds).unwrap(), 1);
    }

    #[test]
    fn upsert_replaces_on_same_id() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 2, "").unwrap();
        store.upsert(&sample_doc(&ds, "d1", vec![vec![1.0, 2.0]])).unwrap();
        let mut updated = sample_doc(&ds, "d1", vec![vec![9.0, 9.0]]);
        updated.data = "updated".into();
        store.upsert(&updated).unwrap();

        assert_eq!(store.count(&ds).unwrap(), 1);
        let got = store.get(&ds, "d1").unwrap().unwrap();
        assert_eq!(got.data, "updated");
        assert_eq!(got.embeddings, vec![vec![9.0, 9.0]]);
    }

    #[test]
    fn vector_size_mismatch_is_rejected() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 3, "").unwrap();
        let err = store
            .upsert(&sample_doc(&ds, "d1", vec![vec![1.0, 2.0]]))
            .unwrap_err();
        assert_eq!(err.code(), "vector-size-mismatch");
    }

    #[test]
    fn delete_docstore_removes_docs_too() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 2, "").unwrap();
        store.upsert(&sample_doc(&ds, "d1", vec![vec![1.0, 2.0]])).unwrap();
        store.delete_docstore(&ds).unwrap();
        assert!(store.get_docstore(&ds).unwrap().is_none());
        assert_eq!(store.count(&ds).unwrap(), 0);
    }

    #[test]
    fn fetch_batch_orders_by_aid_and_respects_filters() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 1, "").unwrap();
        for i in 0..5 {
            let mut doc = sample_doc(&ds, &format!("d{i}"), vec![vec![i as f32]]);
            if i % 2 == 0 {
                doc.doc_type = "even".into();
            }
            store.upsert(&doc).unwrap();
        }

        let all = store.fetch_batch(&ds, None, None, None, 0, 100).unwrap();
        assert_eq!(all.len(), 5);
        let aids: Vec<i64> = all.iter().map(|(aid, _)| *aid).collect();
        let mut sorted = aids.clone();
        sorted.sort_unstable();
        assert_eq!(aids, sorted);

        let evens = store.fetch_batch(&ds, Some("even"), None, None, 0, 100).unwrap();
        assert_eq!(evens.len(), 3);

        let after = store.fetch_batch(&ds, None, None, None, aids[2], 100).unwrap();
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docstore.db");
        let ds_id;
        {
            let store = DocStore::open(&path).unwrap();
            ds_id = store.create_docstore("kb", "m", 2, "").unwrap();
            store.upsert(&sample_doc(&ds_id, "d1", vec![vec![0.5, -0.5]])).unwrap();
        }
        let store = DocStore::open(&path).unwrap();
        let got = store.get(&ds_id, "d1").unwrap().unwrap();
        assert_eq!(got.embeddings, vec![vec![0.5, -0.5]]);
    }
}
