//! SQLite vector store
//!
//! Embeddings live in their own database file (separate connection, WAL
//! mode) so vector writes never contend with the graph store. Vectors
//! are L2-normalized on insert; kNN scans compute cosine similarity as a
//! dot product over the normalized vectors. The collection records the
//! embedding model id; vectors from a different model never mix.

use super::traits::{ModelCheck, StoreError, StoreResult, VectorFilter, VectorRecord, VectorStore};
use crate::model::PaperId;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed vector store with a fixed dimension.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    dimension: usize,
}

impl SqliteVectorStore {
    /// Open a persistent vector store at the given path.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, dimension)
    }

    /// Open an in-memory vector store (tests).
    pub fn open_in_memory(dimension: usize) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS vectors (
                paper_id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                category TEXT,
                year INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_vectors_category ON vectors(category);
            CREATE INDEX IF NOT EXISTS idx_vectors_year ON vectors(year);

            CREATE TABLE IF NOT EXISTS collection_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            dimension,
        };

        // A collection created with another dimension cannot be reused.
        if let Some(stored) = store.meta_get("dimension")? {
            let stored: usize = stored
                .parse()
                .map_err(|_| StoreError::SchemaMismatch("unreadable dimension".into()))?;
            if stored != dimension {
                return Err(StoreError::SchemaMismatch(format!(
                    "collection dimension {} does not match configured {}",
                    stored, dimension
                )));
            }
        } else {
            store.meta_set("dimension", &dimension.to_string())?;
        }

        Ok(store)
    }

    fn meta_get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM collection_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn meta_set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO collection_meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> StoreResult<()> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

/// L2-normalize a vector in place.
fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn vector_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl VectorStore for SqliteVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn ensure_model(&self, model_id: &str) -> StoreResult<ModelCheck> {
        match self.meta_get("embedding_model")? {
            Some(stored) if stored == model_id => Ok(ModelCheck::Match),
            Some(stored) => Ok(ModelCheck::Mismatch { stored }),
            None => {
                self.meta_set("embedding_model", model_id)?;
                Ok(ModelCheck::Initialized)
            }
        }
    }

    fn reset_collection(&self, model_id: &str) -> StoreResult<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM vectors", [])?;
        }
        self.meta_set("embedding_model", model_id)
    }

    fn upsert(&self, record: &VectorRecord) -> StoreResult<()> {
        self.check_dimension(&record.embedding)?;
        let mut normalized = record.embedding.clone();
        l2_normalize(&mut normalized);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO vectors (paper_id, embedding, category, year) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(paper_id) DO UPDATE SET \
                 embedding = excluded.embedding, \
                 category  = excluded.category, \
                 year      = excluded.year",
            params![
                record.id.as_str(),
                vector_to_blob(&normalized),
                record.category,
                record.year,
            ],
        )?;
        Ok(())
    }

    fn has(&self, id: &PaperId) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vectors WHERE paper_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn ids(&self) -> StoreResult<Vec<PaperId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT paper_id FROM vectors")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PaperId::new)
            .collect();
        Ok(ids)
    }

    fn knn(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> StoreResult<Vec<(PaperId, f32)>> {
        self.check_dimension(query)?;
        let mut normalized_query = query.to_vec();
        l2_normalize(&mut normalized_query);

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT paper_id, embedding, category, year FROM vectors",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let category: Option<String> = row.get(2)?;
                let year: Option<i32> = row.get(3)?;
                Ok((id, blob, category, year))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut scored: Vec<(PaperId, f32)> = rows
            .into_iter()
            .filter(|(_, _, category, year)| match filter {
                Some(f) => {
                    let category_ok = f
                        .category
                        .as_ref()
                        .map(|want| category.as_deref() == Some(want.as_str()))
                        .unwrap_or(true);
                    let year_ok = f.year.map(|want| *year == Some(want)).unwrap_or(true);
                    category_ok && year_ok
                }
                None => true,
            })
            .map(|(id, blob, _, _)| {
                let stored = blob_to_vector(&blob);
                let score: f32 = normalized_query
                    .iter()
                    .zip(stored.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                (PaperId::new(id), score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    fn knn_by_id(&self, id: &PaperId, k: usize) -> StoreResult<Option<Vec<(PaperId, f32)>>> {
        let stored: Option<Vec<u8>> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT embedding FROM vectors WHERE paper_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?
        };
        match stored {
            Some(blob) => Ok(Some(self.knn(&blob_to_vector(&blob), k, None)?)),
            None => Ok(None),
        }
    }

    fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
