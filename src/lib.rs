//! Multimodal retrieval-augmented question answering over biomedical papers.
//!
//! - **acquire**: PubMed search, PMC open-access PDF download
//! - **extract**: abstract/methods slicing and figure extraction from PDFs
//! - **embedding**: text and image embedding adapters (fastembed)
//! - **store**: persistent text and image vector collections (SurrealDB)
//! - **indexer**: rebuilds both collections from local papers and figures
//! - **retrieval**: text and/or image nearest-neighbour queries
//! - **synthesis**: answer generation from retrieved context
//! - **evaluate**: precision/recall of retrieval against expected papers

pub mod acquire;
pub mod config;
pub mod embedding;
pub mod error;
pub mod evaluate;
pub mod extract;
pub mod indexer;
pub mod models;
pub mod retrieval;
pub mod store;
pub mod synthesis;

pub use config::Settings;
pub use error::{ RagError, RagResult };
pub use models::{ FigureRecord, IndexReport, ItemFailure, PaperRecord, QueryResult, RetrievalResults };
