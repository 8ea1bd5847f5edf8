//! Offline (re)build of both vector collections from local storage.
//!
//! Papers come from `<papers>/<id>_abstract.txt` or, failing that, from
//! `<papers>/<id>.pdf`; figures from `<figures>/<id>/*.{png,jpg,jpeg}`.
//! Re-running is safe: every write is an upsert by id.

use std::collections::HashSet;
use std::fs;
use std::path::{ Path, PathBuf };

use chrono::Utc;
use tracing::{ info, warn };
use walkdir::WalkDir;

use crate::embedding::{ ImageEmbedder, ImageInput, TextEmbedder };
use crate::error::{ RagError, RagResult };
use crate::extract::extract_abstract_and_methods;
use crate::models::{ FigureRecord, IndexReport, ItemFailure, PaperRecord, INDEXED_AT_KEY };
use crate::store::{ CollectionKind, StoreEntry, VectorStore };

const ABSTRACT_SUFFIX: &str = "_abstract.txt";
const FIGURE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct Indexer<T, I, S> {
    text_embedder: T,
    image_embedder: I,
    store: S,
}

impl<T, I, S> Indexer<T, I, S> where T: TextEmbedder, I: ImageEmbedder, S: VectorStore {
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

    pub async fn run(&self, papers_dir: &Path, figures_dir: &Path) -> RagResult<IndexReport> {
        let mut report = IndexReport::default();
        self.index_papers(papers_dir, &mut report).await?;
        self.index_figures(figures_dir, &mut report).await?;
        info!(
            "Indexing finished: {} papers ({} skipped), {} figures ({} skipped)",
            report.papers_indexed.len(),
            report.papers_skipped.len(),
            report.figures_indexed.len(),
            report.figures_skipped.len()
        );
        Ok(report)
    }

    async fn index_papers(&self, papers_dir: &Path, report: &mut IndexReport) -> RagResult<()> {
        let (papers, skipped) = collect_papers(papers_dir)?;
        for failure in &skipped {
            warn!("Skip paper {}: {}", failure.item, failure.reason);
        }
        report.papers_skipped.extend(skipped);

        if papers.is_empty() {
            info!("No papers found under {}", papers_dir.display());
            return Ok(());
        }

        info!("Embedding {} papers...", papers.len());
        let texts: Vec<String> = papers
            .iter()
            .map(|p| p.text.clone())
            .collect();
        let vectors = self.text_embedder.embed_texts(&texts).await?;
        if vectors.len() != papers.len() {
            return Err(
                RagError::Embedding(
                    format!("expected {} embeddings, got {}", papers.len(), vectors.len())
                )
            );
        }

        let indexed_at = Utc::now().to_rfc3339();
        let entries: Vec<StoreEntry> = papers
            .into_iter()
            .zip(vectors)
            .map(|(paper, vector)| {
                let mut metadata = paper.metadata;
                metadata.insert(INDEXED_AT_KEY.to_string(), indexed_at.clone());
                StoreEntry {
                    id: paper.id,
                    vector,
                    document: Some(paper.text),
                    metadata,
                }
            })
            .collect();
        let ids: Vec<String> = entries
            .iter()
            .map(|e| e.id.clone())
            .collect();

        self.store.upsert(CollectionKind::Text, entries).await?;
        info!("Text index done.");
        report.papers_indexed.extend(ids);
        Ok(())
    }

    async fn index_figures(&self, figures_dir: &Path, report: &mut IndexReport) -> RagResult<()> {
        if !figures_dir.is_dir() {
            info!("No figures found under {}", figures_dir.display());
            return Ok(());
        }

        let figures = figure_files(figures_dir)?;
        if figures.is_empty() {
            info!("No figures found under {}", figures_dir.display());
            return Ok(());
        }
        // Model load failures abort the phase; everything after is per figure.
        self.image_embedder.load().await?;

        let indexed_at = Utc::now().to_rfc3339();
        let mut entries = Vec::new();
        for (source_paper, path) in figures {
            let id = path.to_string_lossy().into_owned();
            let embedded = match ImageInput::Path(path.clone()).into_rgb() {
                Ok(decoded) => self.image_embedder.embed_image(ImageInput::Decoded(decoded)).await,
                Err(e) => Err(e),
            };
            let vector = match embedded {
                Ok(vector) => vector,
                Err(e) => {
                    warn!("Skip {}: {}", path.display(), e);
                    report.figures_skipped.push(ItemFailure::new(id, e));
                    continue;
                }
            };

            let mut record = FigureRecord::new(id, source_paper);
            record.metadata.insert(INDEXED_AT_KEY.to_string(), indexed_at.clone());
            entries.push(StoreEntry {
                id: record.id,
                vector,
                document: None,
                metadata: record.metadata,
            });
        }

        if entries.is_empty() {
            info!("No figures under {} could be embedded", figures_dir.display());
            return Ok(());
        }

        info!("Embedded {} figures", entries.len());
        let ids: Vec<String> = entries
            .iter()
            .map(|e| e.id.clone())
            .collect();
        self.store.upsert(CollectionKind::Image, entries).await?;
        info!("Image index done.");
        report.figures_indexed.extend(ids);
        Ok(())
    }
}

fn top_level_files(dir: &Path) -> RagResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn has_extension(path: &Path, wanted: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| wanted.iter().any(|w| ext.eq_ignore_ascii_case(w)))
}

/// Papers with non-blank text, plus the ones that had none.
///
/// An abstract file wins over the PDF of the same id, even when it is blank.
pub fn collect_papers(papers_dir: &Path) -> RagResult<(Vec<PaperRecord>, Vec<ItemFailure>)> {
    let mut papers = Vec::new();
    let mut skipped = Vec::new();
    if !papers_dir.is_dir() {
        return Ok((papers, skipped));
    }

    let files = top_level_files(papers_dir)?;
    let mut seen = HashSet::new();

    for path in &files {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let Some(id) = name.strip_suffix(ABSTRACT_SUFFIX) else {
            continue;
        };
        seen.insert(id.to_string());
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                skipped.push(ItemFailure::new(id, e));
                continue;
            }
        };
        if text.trim().is_empty() {
            skipped.push(ItemFailure::new(id, "abstract file is empty"));
        } else {
            papers.push(PaperRecord::new(id, text));
        }
    }

    for path in files.iter().filter(|p| has_extension(p, &["pdf"])) {
        let Some(id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let text = extract_abstract_and_methods(path).combined();
        if text.trim().is_empty() {
            skipped.push(ItemFailure::new(id, "no abstract or methods section found"));
        } else {
            papers.push(PaperRecord::new(id, text));
        }
    }

    Ok((papers, skipped))
}

/// `(source paper, figure path)` for every image file one level below `figures_dir`.
pub fn figure_files(figures_dir: &Path) -> RagResult<Vec<(String, PathBuf)>> {
    let mut figures = Vec::new();
    for entry in WalkDir::new(figures_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let source_paper = entry.file_name().to_string_lossy().into_owned();
        for path in top_level_files(entry.path())? {
            let is_image = mime_guess
                ::from_path(&path)
                .first()
                .is_some_and(|mime| mime.type_() == mime_guess::mime::IMAGE);
            if is_image && has_extension(&path, FIGURE_EXTENSIONS) {
                figures.push((source_paper.clone(), path));
            }
        }
    }
    Ok(figures)
}
