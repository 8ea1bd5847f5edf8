//! Persistent vector collections for paper text and figure embeddings.
//!
//! Backed by an embedded SurrealDB (RocksDB) database living in one directory.
//! Each collection is a table of rows keyed by the caller's id; `upsert`
//! overwrites rows in place and `query` ranks rows by cosine distance.

use std::cmp::Ordering;
use std::path::Path;

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use surrealdb::engine::local::{ Db, RocksDb };
use surrealdb::Surreal;
use tracing::{ debug, info };

use crate::error::{ RagError, RagResult };
use crate::models::{ EmbeddingVector, Metadata, QueryResult };

const META_TABLE: &str = "collections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Text,
    Image,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 2] = [CollectionKind::Text, CollectionKind::Image];

    pub fn name(self) -> &'static str {
        match self {
            CollectionKind::Text => "medical_papers",
            CollectionKind::Image => "medical_images",
        }
    }

    fn description(self) -> &'static str {
        match self {
            CollectionKind::Text => "Paper abstracts",
            CollectionKind::Image => "Paper figures",
        }
    }
}

/// One row to write: id, vector, optional document text, metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub id: String,
    pub vector: EmbeddingVector,
    pub document: Option<String>,
    pub metadata: Metadata,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or overwrites every entry by id.
    async fn upsert(&self, kind: CollectionKind, entries: Vec<StoreEntry>) -> RagResult<()>;

    /// Nearest neighbours of `vector`, closest first, at most `top_k` of them.
    async fn query(
        &self,
        kind: CollectionKind,
        vector: &[f32],
        top_k: usize,
        include_documents: bool
    ) -> RagResult<Vec<QueryResult>>;

    async fn count(&self, kind: CollectionKind) -> RagResult<usize>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct StoredRow {
    key: String,
    embedding: Vec<f32>,
    document: Option<String>,
    metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct CollectionMeta {
    name: String,
    description: String,
    dimension: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: usize,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| x * y)
        .sum();
    let magnitude_a: f32 = a
        .iter()
        .map(|x| x * x)
        .sum::<f32>()
        .sqrt();
    let magnitude_b: f32 = b
        .iter()
        .map(|x| x * x)
        .sum::<f32>()
        .sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Cosine distance: 0 for identical direction, 2 for opposite.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Db>,
}

impl SurrealStore {
    /// Opens (or creates) the store directory and both collections.
    pub async fn open(dir: impl AsRef<Path>) -> RagResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Surreal::new::<RocksDb>(dir.to_string_lossy().into_owned()).await?;
        db.use_ns("medlit").use_db("vectors").await?;

        let store = Self { db };
        for kind in CollectionKind::ALL {
            store.get_or_create_collection(kind).await?;
        }
        info!("Opened vector store at {}", dir.display());
        Ok(store)
    }

    async fn get_or_create_collection(&self, kind: CollectionKind) -> RagResult<CollectionMeta> {
        if let Some(meta) = self.collection_meta(kind).await? {
            return Ok(meta);
        }

        self.db.query(
            format!(
                "DEFINE TABLE {table} SCHEMALESS;
                DEFINE FIELD key ON {table} TYPE string;
                DEFINE FIELD embedding ON {table} TYPE array<float>;
                DEFINE INDEX idx_key ON {table} FIELDS key UNIQUE;",
                table = kind.name()
            )
        ).await?;

        let meta = CollectionMeta {
            name: kind.name().to_string(),
            description: kind.description().to_string(),
            dimension: None,
        };
        let _: Option<CollectionMeta> = self.db
            .create((META_TABLE, kind.name()))
            .content(meta.clone()).await?;
        debug!("Created collection {}", kind.name());
        Ok(meta)
    }

    async fn collection_meta(&self, kind: CollectionKind) -> RagResult<Option<CollectionMeta>> {
        let meta: Option<CollectionMeta> = self.db.select((META_TABLE, kind.name())).await?;
        Ok(meta)
    }

    /// Dimension fixed by the first write, if any.
    pub async fn dimension(&self, kind: CollectionKind) -> RagResult<Option<usize>> {
        Ok(self.collection_meta(kind).await?.and_then(|meta| meta.dimension))
    }

    async fn check_dimension(&self, kind: CollectionKind, entries: &[StoreEntry]) -> RagResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let batch_dimension = first.vector.len();

        let mut meta = self.get_or_create_collection(kind).await?;
        let expected = meta.dimension.unwrap_or(batch_dimension);
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
            return Err(RagError::DimensionMismatch {
                collection: kind.name(),
                expected,
                actual: bad.vector.len(),
            });
        }

        if meta.dimension.is_none() {
            meta.dimension = Some(expected);
            let _: Option<CollectionMeta> = self.db
                .update((META_TABLE, kind.name()))
                .content(meta).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SurrealStore {
    async fn upsert(&self, kind: CollectionKind, entries: Vec<StoreEntry>) -> RagResult<()> {
        self.check_dimension(kind, &entries).await?;

        let written = entries.len();
        for entry in entries {
            let row = StoredRow {
                key: entry.id.clone(),
                embedding: entry.vector,
                document: entry.document,
                metadata: entry.metadata,
            };
            let _: Option<StoredRow> = self.db
                .update((kind.name(), entry.id.as_str()))
                .content(row).await?;
        }
        debug!("Upserted {} rows into {}", written, kind.name());
        Ok(())
    }

    async fn query(
        &self,
        kind: CollectionKind,
        vector: &[f32],
        top_k: usize,
        include_documents: bool
    ) -> RagResult<Vec<QueryResult>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<StoredRow> = self.db.select(kind.name()).await?;
        let mut results: Vec<QueryResult> = rows
            .into_iter()
            .map(|row| QueryResult {
                distance: cosine_distance(&row.embedding, vector),
                id: row.key,
                text: if include_documents { row.document } else { None },
                metadata: row.metadata,
            })
            .collect();

        results.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    async fn count(&self, kind: CollectionKind) -> RagResult<usize> {
        let count: Option<CountRow> = self.db
            .query(format!("SELECT count() AS count FROM {} GROUP ALL", kind.name())).await?
            .take(0)?;
        Ok(count.map_or(0, |c| c.count))
    }
}

impl std::fmt::Debug for SurrealStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealStore").finish_non_exhaustive()
    }
}
