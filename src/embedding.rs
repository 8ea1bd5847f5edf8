//! Text and image embedding adapters.
//!
//! Both adapters are plain objects owned by whoever embeds: the underlying
//! fastembed model is loaded on first use and kept for the adapter's lifetime.
//! Text and image vectors live in separate spaces and are never compared.

use std::io::Cursor;
use std::path::PathBuf;

use async_trait::async_trait;
use fastembed::{
    EmbeddingModel,
    ImageEmbedding,
    ImageEmbeddingModel,
    ImageInitOptions,
    InitOptions,
    TextEmbedding,
};
use image::{ DynamicImage, ImageFormat };
use tokio::sync::{ Mutex, OnceCell };
use tracing::info;

use crate::error::{ RagError, RagResult };
use crate::models::EmbeddingVector;

#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embeds a batch; output order matches input order.
    async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<EmbeddingVector>>;

    async fn embed_text(&self, text: &str) -> RagResult<EmbeddingVector> {
        self.embed_texts(&[text.to_string()]).await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Embedding("no embedding generated".to_string()))
    }

    fn model_name(&self) -> &str;
}

#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    /// Loads the underlying model ahead of a batch so that load failures
    /// surface once instead of per image.
    async fn load(&self) -> RagResult<()> {
        Ok(())
    }

    async fn embed_image(&self, image: ImageInput) -> RagResult<EmbeddingVector>;

    fn model_name(&self) -> &str;
}

/// The accepted shapes of an image to embed.
#[derive(Debug, Clone)]
pub enum ImageInput {
    Decoded(DynamicImage),
    Encoded(Vec<u8>),
    Path(PathBuf),
}

impl ImageInput {
    /// Decodes whatever was given into the canonical 8-bit RGB image.
    pub fn into_rgb(self) -> RagResult<DynamicImage> {
        let image = match self {
            ImageInput::Decoded(image) => image,
            ImageInput::Encoded(bytes) => image::load_from_memory(&bytes)?,
            ImageInput::Path(path) => image::open(&path)?,
        };
        Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Decoded(image)
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Encoded(bytes)
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

/// Maps a configured model name onto a fastembed text model.
pub fn text_model_from_name(name: &str) -> RagResult<EmbeddingModel> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        other => Err(RagError::Config(format!("unknown text embedding model: {other}"))),
    }
}

pub struct FastEmbedText {
    model_kind: EmbeddingModel,
    model_name: String,
    cache_dir: PathBuf,
    model: OnceCell<Mutex<TextEmbedding>>,
}

impl FastEmbedText {
    pub fn new(model_name: &str, cache_dir: impl Into<PathBuf>) -> RagResult<Self> {
        Ok(Self {
            model_kind: text_model_from_name(model_name)?,
            model_name: model_name.to_string(),
            cache_dir: cache_dir.into(),
            model: OnceCell::new(),
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> RagResult<&Mutex<TextEmbedding>> {
        self.model.get_or_try_init(|| async {
            info!("Loading text embedding model {}", self.model_name);
            let options = InitOptions::new(self.model_kind.clone())
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(true);
            TextEmbedding::try_new(options)
                .map(Mutex::new)
                .map_err(|e| RagError::Embedding(format!("failed to load {}: {e}", self.model_name)))
        }).await
    }
}

#[async_trait]
impl TextEmbedder for FastEmbedText {
    async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<EmbeddingVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self.model().await?.lock().await;
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| RagError::Embedding(e.to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl std::fmt::Debug for FastEmbedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedText")
            .field("model_name", &self.model_name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

pub struct FastEmbedImage {
    cache_dir: PathBuf,
    model: OnceCell<Mutex<ImageEmbedding>>,
}

impl FastEmbedImage {
    pub const MODEL_NAME: &'static str = "clip-vit-b-32";

    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            model: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> RagResult<&Mutex<ImageEmbedding>> {
        self.model.get_or_try_init(|| async {
            info!("Loading image embedding model {}", Self::MODEL_NAME);
            let options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(true);
            ImageEmbedding::try_new(options)
                .map(Mutex::new)
                .map_err(|e| RagError::Embedding(format!("failed to load {}: {e}", Self::MODEL_NAME)))
        }).await
    }
}

#[async_trait]
impl ImageEmbedder for FastEmbedImage {
    async fn load(&self) -> RagResult<()> {
        self.model().await.map(|_| ())
    }

    async fn embed_image(&self, image: ImageInput) -> RagResult<EmbeddingVector> {
        let rgb = image.into_rgb()?;
        let mut png = Cursor::new(Vec::new());
        rgb.write_to(&mut png, ImageFormat::Png)?;
        let png = png.into_inner();

        let mut model = self.model().await?.lock().await;
        model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| RagError::Embedding(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::Embedding("no embedding generated".to_string()))
    }

    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }
}

impl std::fmt::Debug for FastEmbedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedImage").field("loaded", &self.is_loaded()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ Rgb, RgbImage, RgbaImage };
    use tempfile::TempDir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 20, 30])));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_all_image_inputs_normalize_to_rgb() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("figure.png");
        std::fs::write(&path, png_bytes(4, 3)).unwrap();

        let rgba = DynamicImage::ImageRgba8(RgbaImage::new(4, 3));
        let inputs = [
            ImageInput::from(rgba),
            ImageInput::from(png_bytes(4, 3)),
            ImageInput::from(path),
        ];
        for input in inputs {
            let rgb = input.into_rgb().unwrap();
            assert!(matches!(rgb, DynamicImage::ImageRgb8(_)));
            assert_eq!((rgb.width(), rgb.height()), (4, 3));
        }
    }

    #[test]
    fn test_corrupt_image_is_an_error() {
        let result = ImageInput::Encoded(b"definitely not a png".to_vec()).into_rgb();
        assert!(matches!(result, Err(RagError::Image(_))));

        let missing = ImageInput::Path(PathBuf::from("/nonexistent/figure.png")).into_rgb();
        assert!(missing.is_err());
    }

    #[test]
    fn test_text_model_names() {
        assert!(matches!(text_model_from_name("all-MiniLM-L6-v2"), Ok(EmbeddingModel::AllMiniLML6V2)));
        assert!(matches!(text_model_from_name("bge-small-en-v1.5"), Ok(EmbeddingModel::BGESmallENV15)));
        assert!(matches!(text_model_from_name("allenai/specter"), Err(RagError::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_does_not_load_model() {
        let temp_dir = TempDir::new().unwrap();
        let embedder = FastEmbedText::new("all-minilm-l6-v2", temp_dir.path()).unwrap();
        let vectors = embedder.embed_texts(&[]).await.unwrap();
        assert!(vectors.is_empty());
        assert!(!embedder.is_loaded());
    }

    #[test]
    fn test_image_adapter_starts_unloaded() {
        let embedder = FastEmbedImage::new("/tmp/unused");
        assert!(!embedder.is_loaded());
        assert_eq!(embedder.model_name(), "clip-vit-b-32");
    }
}
