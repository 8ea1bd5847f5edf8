//! Runtime settings, read from the environment (and an optional `.env`).

use std::path::PathBuf;

use crate::error::{ RagError, RagResult };

pub const DEFAULT_TOP_K_TEXT: usize = 5;
pub const DEFAULT_TOP_K_IMAGES: usize = 5;
pub const DEFAULT_LLM_MODEL: &str = "gpt-4";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TEXT_MODEL: &str = "all-minilm-l6-v2";

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub papers_dir: PathBuf,
    pub figures_dir: PathBuf,
    pub store_dir: PathBuf,
    pub pubmed_email: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub llm_model: String,
    pub text_model: String,
    pub model_cache_dir: PathBuf,
    pub top_k_text: usize,
    pub top_k_images: usize,
}

impl Settings {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> RagResult<Self> {
        // A missing .env file is the normal case.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RagResult<Self> where F: Fn(&str) -> Option<String> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("MEDLIT_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data"));
        let store_dir = get("VECTOR_STORE_DIR")
            .or_else(|| get("CHROMA_PERSIST_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("vector_store"));
        let model_cache_dir = get("MODEL_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::cache_dir().map(|d| d.join("medlit-rag").join("models")))
            .unwrap_or_else(|| data_dir.join("models"));

        let text_model = get("TEXT_EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string());
        crate::embedding::text_model_from_name(&text_model)?;

        Ok(Self {
            papers_dir: data_dir.join("papers"),
            figures_dir: data_dir.join("figures"),
            store_dir,
            pubmed_email: get("PUBMED_EMAIL"),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or_else(||
                DEFAULT_OPENAI_BASE_URL.to_string()
            ),
            llm_model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            text_model,
            model_cache_dir,
            top_k_text: parse_usize(get("TOP_K_TEXT"), "TOP_K_TEXT", DEFAULT_TOP_K_TEXT)?,
            top_k_images: parse_usize(get("TOP_K_IMAGES"), "TOP_K_IMAGES", DEFAULT_TOP_K_IMAGES)?,
            data_dir,
        })
    }
}

fn parse_usize(value: Option<String>, key: &str, default: usize) -> RagResult<usize> {
    match value {
        None => Ok(default),
        Some(raw) =>
            raw
                .trim()
                .parse()
                .map_err(|_| RagError::Config(format!("{key} must be a non-negative integer, got {raw:?}"))),
    }
}
