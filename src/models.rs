use std::collections::BTreeMap;

use serde::{ Deserialize, Serialize };

/// Flat string metadata attached to every stored vector.
pub type Metadata = BTreeMap<String, String>;

pub type EmbeddingVector = Vec<f32>;

pub const SOURCE_KEY: &str = "source";
pub const PATH_KEY: &str = "path";
pub const SOURCE_PAPER_KEY: &str = "source_paper";
pub const INDEXED_AT_KEY: &str = "indexed_at";

/// A paper's abstract/methods excerpt, keyed by its accession id (e.g. `PMC123`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PaperRecord {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl PaperRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let mut metadata = Metadata::new();
        metadata.insert(SOURCE_KEY.to_string(), id.clone());
        Self {
            id,
            text: text.into(),
            metadata,
        }
    }
}

/// An extracted figure image, keyed by its storage path.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FigureRecord {
    pub id: String,
    pub metadata: Metadata,
}

impl FigureRecord {
    pub fn new(path: impl Into<String>, source_paper: impl Into<String>) -> Self {
        let path = path.into();
        let mut metadata = Metadata::new();
        metadata.insert(PATH_KEY.to_string(), path.clone());
        metadata.insert(SOURCE_PAPER_KEY.to_string(), source_paper.into());
        Self { id: path, metadata }
    }
}

/// One nearest-neighbour hit. `text` is `None` for figure hits.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QueryResult {
    pub id: String,
    pub text: Option<String>,
    pub metadata: Metadata,
    pub distance: f32,
}

impl QueryResult {
    /// Paper id this hit refers to, preferring the `source` metadata entry.
    pub fn source(&self) -> &str {
        self.metadata.get(SOURCE_KEY).map(String::as_str).unwrap_or(&self.id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RetrievalResults {
    pub text_results: Vec<QueryResult>,
    pub image_results: Vec<QueryResult>,
}

impl RetrievalResults {
    pub fn is_empty(&self) -> bool {
        self.text_results.is_empty() && self.image_results.is_empty()
    }
}

/// An item a batch operation gave up on, and why.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            item: item.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct IndexReport {
    pub papers_indexed: Vec<String>,
    pub papers_skipped: Vec<ItemFailure>,
    pub figures_indexed: Vec<String>,
    pub figures_skipped: Vec<ItemFailure>,
}

impl IndexReport {
    pub fn is_empty(&self) -> bool {
        self.papers_indexed.is_empty() &&
            self.papers_skipped.is_empty() &&
            self.figures_indexed.is_empty() &&
            self.figures_skipped.is_empty()
    }
}
