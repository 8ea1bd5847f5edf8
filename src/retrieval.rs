use tracing::{ debug, info };

use crate::embedding::{ ImageEmbedder, ImageInput, TextEmbedder };
use crate::error::RagResult;
use crate::models::{ QueryResult, RetrievalResults };
use crate::store::{ CollectionKind, VectorStore };

/// Dual text/image retrieval over the two collections.
pub struct Retriever<T, I, S> {
    text_embedder: T,
    image_embedder: I,
    store: S,
}

impl<T, I, S> Retriever<T, I, S> where T: TextEmbedder, I: ImageEmbedder, S: VectorStore {
    pub fn new(text_embedder: T, image_embedder: I, store: S) -> Self {
        Self {
            text_embedder,
            image_embedder,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs whichever retrievals have input. A blank text query counts as
    /// no text query; with neither input nothing is embedded or queried.
    pub async fn process_query(
        &self,
        query: Option<&str>,
        query_image: Option<ImageInput>,
        top_k_text: usize,
        top_k_images: usize
    ) -> RagResult<RetrievalResults> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        if query.is_none() && query_image.is_none() {
            info!("No text or image query given");
            return Ok(RetrievalResults::default());
        }

        let (text_results, image_results) = tokio::join!(
            self.search_text(query, top_k_text),
            self.search_images(query_image, top_k_images)
        );

        Ok(RetrievalResults {
            text_results: text_results?,
            image_results: image_results?,
        })
    }

    async fn search_text(&self, query: Option<&str>, top_k: usize) -> RagResult<Vec<QueryResult>> {
        let Some(query) = query else {
            return Ok(Vec::new());
        };
        let vector = self.text_embedder.embed_text(query).await?;
        let results = self.store.query(CollectionKind::Text, &vector, top_k, true).await?;
        debug!("Text query {:?} matched {} papers", query, results.len());
        Ok(results)
    }

    async fn search_images(
        &self,
        image: Option<ImageInput>,
        top_k: usize
    ) -> RagResult<Vec<QueryResult>> {
        let Some(image) = image else {
            return Ok(Vec::new());
        };
        let vector = self.image_embedder.embed_image(image).await?;
        let results = self.store.query(CollectionKind::Image, &vector, top_k, false).await?;
        debug!("Image query matched {} figures", results.len());
        Ok(results)
    }
}

#[cfg(test)]
pub(crate) mod mocks {
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::sync::{ Arc, Mutex };

    use async_trait::async_trait;

    use crate::embedding::{ ImageEmbedder, ImageInput, TextEmbedder };
    use crate::error::{ RagError, RagResult };
    use crate::models::{ EmbeddingVector, QueryResult };
    use crate::store::{ CollectionKind, StoreEntry, VectorStore };

    /// Embeds text by keyword: one dimension per keyword, 1.0 when present.
    #[derive(Clone, Default)]
    pub(crate) struct MockTextEmbedder {
        pub calls: Arc<AtomicUsize>,
    }

    pub(crate) const KEYWORDS: [&str; 4] = ["theta", "seizure", "fmri", "sleep"];

    pub(crate) fn keyword_vector(text: &str) -> EmbeddingVector {
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = KEYWORDS.iter()
            .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
            .collect();
        // Keeps every vector non-zero.
        vector.push(0.1);
        vector
    }

    #[async_trait]
    impl TextEmbedder for MockTextEmbedder {
        async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<EmbeddingVector>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(
                texts
                    .iter()
                    .map(|t| keyword_vector(t))
                    .collect()
            )
        }

        fn model_name(&self) -> &str {
            "mock-text"
        }
    }

    /// Embeds an image as its mean RGB colour; undecodable images fail.
    #[derive(Clone, Default)]
    pub(crate) struct MockImageEmbedder {
        pub calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ImageEmbedder for MockImageEmbedder {
        async fn embed_image(&self, image: ImageInput) -> RagResult<EmbeddingVector> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rgb = image.into_rgb()?.to_rgb8();
            let pixels = (rgb.width() * rgb.height()).max(1) as f32;
            let mut sums = [0.0f32; 3];
            for pixel in rgb.pixels() {
                for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                    *sum += f32::from(channel);
                }
            }
            Ok(
                sums
                    .iter()
                    .map(|s| s / pixels / 255.0 + 0.01)
                    .collect()
            )
        }

        fn model_name(&self) -> &str {
            "mock-image"
        }
    }

    /// Records every call; answers queries with nothing.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingStore {
        pub queries: Arc<AtomicUsize>,
        pub upserts: Arc<Mutex<Vec<(CollectionKind, Vec<StoreEntry>)>>>,
    }

    #[async_trait]
    impl VectorStore for RecordingStore {
        async fn upsert(&self, kind: CollectionKind, entries: Vec<StoreEntry>) -> RagResult<()> {
            self.upserts
                .lock()
                .map_err(|_| RagError::Config("poisoned".to_string()))?
                .push((kind, entries));
            Ok(())
        }

        async fn query(
            &self,
            _kind: CollectionKind,
            _vector: &[f32],
            _top_k: usize,
            _include_documents: bool
        ) -> RagResult<Vec<QueryResult>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn count(&self, _kind: CollectionKind) -> RagResult<usize> {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::mocks::*;
    use super::*;
    use crate::models::Metadata;
    use crate::store::{ StoreEntry, SurrealStore };
    use image::{ DynamicImage, Rgb, RgbImage };
    use tempfile::TempDir;

    fn paper(id: &str, text: &str) -> StoreEntry {
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), id.to_string());
        StoreEntry {
            id: id.to_string(),
            vector: keyword_vector(text),
            document: Some(text.to_string()),
            metadata,
        }
    }

    fn solid(r: u8, g: u8, b: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([r, g, b])))
    }

    async fn seeded_retriever() -> (Retriever<MockTextEmbedder, MockImageEmbedder, SurrealStore>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = SurrealStore::open(temp_dir.path().join("store")).await.expect("open store");
        store
            .upsert(
                CollectionKind::Text,
                vec![
                    paper("PMC123", "EEG theta waves during REM sleep"),
                    paper("PMC200", "Seizure detection from scalp EEG"),
                    paper("PMC300", "fMRI connectivity at rest"),
                    paper("PMC400", "Sleep spindles and memory")
                ]
            ).await
            .expect("seed text");

        let figure = |path: &str, color: DynamicImage, source: &str| {
            let vector = mean_colour(&color);
            let mut metadata = Metadata::new();
            metadata.insert("path".to_string(), path.to_string());
            metadata.insert("source_paper".to_string(), source.to_string());
            StoreEntry { id: path.to_string(), vector, document: None, metadata }
        };
        store
            .upsert(
                CollectionKind::Image,
                vec![
                    figure("figs/PMC123/red.png", solid(250, 0, 0), "PMC123"),
                    figure("figs/PMC200/blue.png", solid(0, 0, 250), "PMC200")
                ]
            ).await
            .expect("seed images");

        let retriever = Retriever::new(
            MockTextEmbedder::default(),
            MockImageEmbedder::default(),
            store
        );
        (retriever, temp_dir)
    }

    fn mean_colour(image: &DynamicImage) -> Vec<f32> {
        let rgb = image.to_rgb8();
        let pixel = rgb.get_pixel(0, 0).0;
        pixel
            .iter()
            .map(|c| f32::from(*c) / 255.0 + 0.01)
            .collect()
    }

    #[tokio::test]
    async fn test_no_query_makes_no_calls() -> RagResult<()> {
        let text = MockTextEmbedder::default();
        let image = MockImageEmbedder::default();
        let store = RecordingStore::default();
        let retriever = Retriever::new(text.clone(), image.clone(), store.clone());

        for query in [None, Some(""), Some("   \n\t")] {
            let results = retriever.process_query(query, None, 5, 5).await?;
            assert_eq!(results, RetrievalResults::default());
        }

        assert_eq!(text.calls.load(Ordering::SeqCst), 0);
        assert_eq!(image.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.queries.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_text_query_finds_closest_paper() -> RagResult<()> {
        let (retriever, _temp_dir) = seeded_retriever().await;

        let results = retriever.process_query(Some("EEG theta waves"), None, 5, 5).await?;
        assert!(results.image_results.is_empty());
        assert!(results.text_results.len() <= 5);
        assert_eq!(results.text_results[0].id, "PMC123");
        assert_eq!(results.text_results[0].source(), "PMC123");
        assert_eq!(
            results.text_results[0].text.as_deref(),
            Some("EEG theta waves during REM sleep")
        );
        assert!(results.text_results.windows(2).all(|w| w[0].distance <= w[1].distance));
        Ok(())
    }

    #[tokio::test]
    async fn test_text_results_respect_top_k() -> RagResult<()> {
        let (retriever, _temp_dir) = seeded_retriever().await;
        for top_k in [0, 1, 2, 10] {
            let results = retriever.process_query(Some("sleep"), None, top_k, 5).await?;
            assert!(results.text_results.len() <= top_k);
            assert!(results.text_results.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_image_query_returns_figures_without_text() -> RagResult<()> {
        let (retriever, _temp_dir) = seeded_retriever().await;

        let results = retriever.process_query(None, Some(ImageInput::from(solid(240, 10, 10))), 5, 1).await?;
        assert!(results.text_results.is_empty());
        assert_eq!(results.image_results.len(), 1);
        let hit = &results.image_results[0];
        assert_eq!(hit.id, "figs/PMC123/red.png");
        assert_eq!(hit.text, None);
        assert_eq!(hit.metadata.get("source_paper").map(String::as_str), Some("PMC123"));
        Ok(())
    }

    #[tokio::test]
    async fn test_combined_query_runs_both_branches() -> RagResult<()> {
        let (retriever, _temp_dir) = seeded_retriever().await;
        let results = retriever.process_query(
            Some("seizure"),
            Some(ImageInput::from(solid(0, 0, 255))),
            2,
            2
        ).await?;
        assert_eq!(results.text_results[0].id, "PMC200");
        assert_eq!(results.image_results[0].id, "figs/PMC200/blue.png");
        Ok(())
    }

    #[tokio::test]
    async fn test_undecodable_query_image_is_an_error() {
        let retriever = Retriever::new(
            MockTextEmbedder::default(),
            MockImageEmbedder::default(),
            RecordingStore::default()
        );
        let result = retriever.process_query(None, Some(ImageInput::Encoded(vec![1, 2, 3])), 5, 5).await;
        assert!(result.is_err());
    }
}
