//! SQLite graph store
//!
//! Single database file with tables for papers, citation edges,
//! concepts, and mention edges. Thread-safe via an internal mutex on the
//! connection; WAL mode keeps reads concurrent with the write pipeline.
//!
//! Merge policy: upserts never let a `NULL` (or empty-list) incoming
//! value overwrite a stored one, so replaying a write with identical
//! inputs is a no-op and partial records refine instead of erase.

use super::traits::{GraphOp, GraphStats, GraphStore, StoreError, StoreResult};
use crate::model::{
    CitationAttrs, CitationEdge, CitationIntent, CitationPosition, Concept, ConceptKind,
    ConceptMention, Paper, PaperId,
};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// Schema generation understood by this build. A database created by a
/// newer build refuses to open rather than corrupt.
const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed graph store.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory store (tests).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch(format!(
                "database schema version {} is newer than supported {}",
                version, SCHEMA_VERSION
            )));
        }

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS papers (
                id TEXT PRIMARY KEY,
                title TEXT,
                abstract TEXT,
                authors_json TEXT NOT NULL DEFAULT '[]',
                categories_json TEXT NOT NULL DEFAULT '[]',
                primary_category TEXT,
                published_date TEXT,
                citation_count INTEGER,
                tl_dr TEXT,
                summary TEXT,
                summary_model TEXT,
                embedding_model TEXT,
                embedding_pending INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_papers_category
                ON papers(primary_category);
            CREATE INDEX IF NOT EXISTS idx_papers_pending
                ON papers(embedding_pending);

            CREATE TABLE IF NOT EXISTS citations (
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                intent TEXT NOT NULL DEFAULT 'unknown',
                position TEXT NOT NULL DEFAULT 'other',
                context TEXT,
                PRIMARY KEY (src, dst)
            );
            CREATE INDEX IF NOT EXISTS idx_citations_dst ON citations(dst);

            CREATE TABLE IF NOT EXISTS concepts (
                normalized_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                display_name TEXT NOT NULL,
                embedding_json TEXT,
                PRIMARY KEY (normalized_name, kind)
            );

            CREATE TABLE IF NOT EXISTS mentions (
                paper_id TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                confidence REAL,
                PRIMARY KEY (paper_id, normalized_name, kind)
            );
            "#,
        )?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert_paper_inner(conn: &Connection, paper: &Paper) -> StoreResult<()> {
        let authors_json = serde_json::to_string(&paper.authors)?;
        let categories_json = serde_json::to_string(&paper.categories)?;
        conn.execute(
            r#"
            INSERT INTO papers (
                id, title, abstract, authors_json, categories_json,
                primary_category, published_date, citation_count,
                tl_dr, summary, summary_model, embedding_model
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                title            = COALESCE(excluded.title, title),
                abstract         = COALESCE(excluded.abstract, abstract),
                authors_json     = CASE WHEN excluded.authors_json = '[]'
                                        THEN authors_json ELSE excluded.authors_json END,
                categories_json  = CASE WHEN excluded.categories_json = '[]'
                                        THEN categories_json ELSE excluded.categories_json END,
                primary_category = COALESCE(excluded.primary_category, primary_category),
                published_date   = COALESCE(excluded.published_date, published_date),
                citation_count   = COALESCE(excluded.citation_count, citation_count),
                tl_dr            = COALESCE(excluded.tl_dr, tl_dr),
                summary          = COALESCE(excluded.summary, summary),
                summary_model    = COALESCE(excluded.summary_model, summary_model),
                embedding_model  = COALESCE(excluded.embedding_model, embedding_model)
            "#,
            params![
                paper.id.as_str(),
                paper.title,
                paper.abstract_text,
                authors_json,
                categories_json,
                paper.primary_category(),
                paper.published_date.map(|d| d.to_string()),
                paper.citation_count.map(|c| c as i64),
                paper.tl_dr,
                paper.summary,
                paper.summary_model,
                paper.embedding_model,
            ],
        )?;
        Ok(())
    }

    fn ensure_stub_inner(conn: &Connection, id: &PaperId) -> StoreResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO papers (id) VALUES (?1)",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn upsert_citation_inner(
        conn: &Connection,
        src: &PaperId,
        dst: &PaperId,
        attrs: &CitationAttrs,
    ) -> StoreResult<()> {
        Self::ensure_stub_inner(conn, src)?;
        Self::ensure_stub_inner(conn, dst)?;
        conn.execute(
            r#"
            INSERT INTO citations (src, dst, intent, position, context)
            VALUES (?1, ?2, COALESCE(?3, 'unknown'), COALESCE(?4, 'other'), ?5)
            ON CONFLICT(src, dst) DO UPDATE SET
                intent   = COALESCE(?3, intent),
                position = COALESCE(?4, position),
                context  = COALESCE(?5, context)
            "#,
            params![
                src.as_str(),
                dst.as_str(),
                attrs.intent.map(|i| i.as_str()),
                attrs.position.map(|p| p.as_str()),
                attrs.context,
            ],
        )?;
        Ok(())
    }

    fn upsert_mention_inner(
        conn: &Connection,
        paper: &PaperId,
        mention: &ConceptMention,
    ) -> StoreResult<()> {
        let concept = &mention.concept;
        let embedding_json = match &concept.embedding {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        conn.execute(
            r#"
            INSERT INTO concepts (normalized_name, kind, display_name, embedding_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(normalized_name, kind) DO UPDATE SET
                embedding_json = COALESCE(excluded.embedding_json, embedding_json)
            "#,
            params![
                concept.normalized_name(),
                concept.kind.as_str(),
                concept.name,
                embedding_json,
            ],
        )?;
        conn.execute(
            r#"
            INSERT INTO mentions (paper_id, normalized_name, kind, confidence)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(paper_id, normalized_name, kind) DO UPDATE SET
                confidence = COALESCE(excluded.confidence, confidence)
            "#,
            params![
                paper.as_str(),
                concept.normalized_name(),
                concept.kind.as_str(),
                mention.confidence.map(|c| c as f64),
            ],
        )?;
        Ok(())
    }

    fn apply_op(conn: &Connection, op: &GraphOp) -> StoreResult<()> {
        match op {
            GraphOp::UpsertPaper(paper) => Self::upsert_paper_inner(conn, paper),
            GraphOp::EnsureStub(id) => Self::ensure_stub_inner(conn, id),
            GraphOp::UpsertCitation { src, dst, attrs } => {
                Self::upsert_citation_inner(conn, src, dst, attrs)
            }
            GraphOp::UpsertMention { paper, mention } => {
                Self::upsert_mention_inner(conn, paper, mention)
            }
        }
    }

    fn row_to_paper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Paper> {
        let id: String = row.get("id")?;
        let authors_json: String = row.get("authors_json")?;
        let categories_json: String = row.get("categories_json")?;
        let published: Option<String> = row.get("published_date")?;
        let citation_count: Option<i64> = row.get("citation_count")?;
        let mut paper = Paper::stub(PaperId::new(id));
        paper.title = row.get("title")?;
        paper.abstract_text = row.get("abstract")?;
        paper.authors = serde_json::from_str(&authors_json).unwrap_or_default();
        paper.categories = serde_json::from_str(&categories_json).unwrap_or_default();
        paper.published_date = published.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok());
        paper.citation_count = citation_count.map(|c| c.max(0) as u64);
        paper.tl_dr = row.get("tl_dr")?;
        paper.summary = row.get("summary")?;
        paper.summary_model = row.get("summary_model")?;
        paper.embedding_model = row.get("embedding_model")?;
        Ok(paper)
    }

    fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<CitationEdge> {
        let src: String = row.get("src")?;
        let dst: String = row.get("dst")?;
        let intent: String = row.get("intent")?;
        let position: String = row.get("position")?;
        Ok(CitationEdge {
            src: PaperId::new(src),
            dst: PaperId::new(dst),
            intent: CitationIntent::parse(&intent),
            position: CitationPosition::parse(&position),
            context: row.get("context")?,
        })
    }

    const PAPER_COLUMNS: &'static str =
        "id, title, abstract, authors_json, categories_json, primary_category, \
         published_date, citation_count, tl_dr, summary, summary_model, embedding_model";

    fn edges_where(&self, clause: &str, id: &PaperId) -> StoreResult<Vec<CitationEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT src, dst, intent, position, context FROM citations WHERE {}",
            clause
        ))?;
        let edges = stmt
            .query_map(params![id.as_str()], Self::row_to_edge)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }
}

impl GraphStore for SqliteGraphStore {
    fn upsert_paper(&self, paper: &Paper) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_paper_inner(&conn, paper)
    }

    fn ensure_stub(&self, id: &PaperId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_stub_inner(&conn, id)
    }

    fn upsert_citation(
        &self,
        src: &PaperId,
        dst: &PaperId,
        attrs: &CitationAttrs,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_citation_inner(&conn, src, dst, attrs)
    }

    fn upsert_mention(&self, paper: &PaperId, mention: &ConceptMention) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_mention_inner(&conn, paper, mention)
    }

    fn apply_batch(&self, ops: &[GraphOp]) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for op in ops {
            Self::apply_op(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_paper(&self, id: &PaperId) -> StoreResult<Option<Paper>> {
        let conn = self.conn.lock().unwrap();
        let paper = conn
            .query_row(
                &format!("SELECT {} FROM papers WHERE id = ?1", Self::PAPER_COLUMNS),
                params![id.as_str()],
                Self::row_to_paper,
            )
            .optional()?;
        Ok(paper)
    }

    fn paper_ids(&self) -> StoreResult<Vec<PaperId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM papers")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PaperId::new)
            .collect();
        Ok(ids)
    }

    fn paper_count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn list_papers(
        &self,
        page: usize,
        page_size: usize,
        category: Option<&str>,
    ) -> StoreResult<Vec<Paper>> {
        let offset = page.saturating_sub(1) * page_size;
        let conn = self.conn.lock().unwrap();
        let papers = match category {
            Some(cat) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM papers WHERE primary_category = ?1 \
                     ORDER BY id LIMIT ?2 OFFSET ?3",
                    Self::PAPER_COLUMNS
                ))?;
                let rows = stmt.query_map(params![cat, page_size as i64, offset as i64], Self::row_to_paper)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM papers ORDER BY id LIMIT ?1 OFFSET ?2",
                    Self::PAPER_COLUMNS
                ))?;
                let rows = stmt.query_map(params![page_size as i64, offset as i64], Self::row_to_paper)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(papers)
    }

    fn citations_from(&self, id: &PaperId) -> StoreResult<Vec<CitationEdge>> {
        self.edges_where("src = ?1", id)
    }

    fn citations_to(&self, id: &PaperId) -> StoreResult<Vec<CitationEdge>> {
        self.edges_where("dst = ?1", id)
    }

    fn neighborhood(
        &self,
        id: &PaperId,
        depth: usize,
    ) -> StoreResult<(Vec<Paper>, Vec<CitationEdge>)> {
        let origin = match self.get_paper(id)? {
            Some(p) => p,
            None => return Ok((Vec::new(), Vec::new())),
        };

        let mut visited: HashSet<PaperId> = HashSet::new();
        visited.insert(id.clone());
        let mut papers = vec![origin];
        let mut edges = Vec::new();
        let mut seen_edges: HashSet<(PaperId, PaperId)> = HashSet::new();
        let mut frontier = vec![id.clone()];

        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for node in &frontier {
                let mut adjacent = self.edges_where("src = ?1", node)?;
                adjacent.extend(self.edges_where("dst = ?1", node)?);
                for edge in adjacent {
                    let key = (edge.src.clone(), edge.dst.clone());
                    if !seen_edges.insert(key) {
                        continue;
                    }
                    let neighbor = if &edge.src == node {
                        edge.dst.clone()
                    } else {
                        edge.src.clone()
                    };
                    if visited.insert(neighbor.clone()) {
                        if let Some(paper) = self.get_paper(&neighbor)? {
                            papers.push(paper);
                            next.push(neighbor);
                        }
                    }
                    edges.push(edge);
                }
            }
            frontier = next;
        }
        Ok((papers, edges))
    }

    fn concepts_of(&self, id: &PaperId) -> StoreResult<Vec<Concept>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.display_name, c.kind, c.embedding_json \
             FROM mentions m JOIN concepts c \
               ON m.normalized_name = c.normalized_name AND m.kind = c.kind \
             WHERE m.paper_id = ?1",
        )?;
        let concepts = stmt
            .query_map(params![id.as_str()], |row| {
                let name: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let embedding_json: Option<String> = row.get(2)?;
                Ok((name, kind, embedding_json))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(name, kind, embedding_json)| {
                let mut concept = Concept::new(name, ConceptKind::parse(&kind));
                concept.embedding =
                    embedding_json.and_then(|j| serde_json::from_str(&j).ok());
                concept
            })
            .collect();
        Ok(concepts)
    }

    fn citation_adjacency(&self) -> StoreResult<Vec<(PaperId, PaperId)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT src, dst FROM citations")?;
        let pairs = stmt
            .query_map([], |row| {
                let src: String = row.get(0)?;
                let dst: String = row.get(1)?;
                Ok((PaperId::new(src), PaperId::new(dst)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    fn mark_embedding_pending(&self, id: &PaperId, pending: bool) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE papers SET embedding_pending = ?2 WHERE id = ?1",
            params![id.as_str(), pending as i64],
        )?;
        Ok(())
    }

    fn embedding_pending(&self) -> StoreResult<Vec<PaperId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM papers WHERE embedding_pending = 1")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PaperId::new)
            .collect();
        Ok(ids)
    }

    fn stats(&self) -> StoreResult<GraphStats> {
        let conn = self.conn.lock().unwrap();
        let papers: i64 = conn.query_row("SELECT COUNT(*) FROM papers", [], |r| r.get(0))?;
        let stubs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM papers WHERE title IS NULL AND abstract IS NULL",
            [],
            |r| r.get(0),
        )?;
        let citations: i64 = conn.query_row("SELECT COUNT(*) FROM citations", [], |r| r.get(0))?;
        let concepts: i64 = conn.query_row("SELECT COUNT(*) FROM concepts", [], |r| r.get(0))?;
        let mentions: i64 = conn.query_row("SELECT COUNT(*) FROM mentions", [], |r| r.get(0))?;
        Ok(GraphStats {
            papers: papers as usize,
            stubs: stubs as usize,
            citations: citations as usize,
            concepts: concepts as usize,
            mentions: mentions as usize,
        })
    }
}
