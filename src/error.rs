use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("PDF extraction error: {0}")]
    PdfExtraction(String),
    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Malformed response: {0}")]
    Parse(String),
    #[error("Collection {collection} holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        collection: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Answer synthesis error: {0}")]
    Synthesis(String),
}

pub type RagResult<T> = Result<T, RagError>;
