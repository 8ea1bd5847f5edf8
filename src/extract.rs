//! Best-effort text and figure extraction from downloaded paper PDFs.
//!
//! Section slicing is heading based:
//! - headings are matched ASCII case-insensitively anywhere in the text;
//! - start markers are tried in listed order and the first marker present wins,
//!   even if a later-listed marker occurs earlier in the document;
//! - only the first occurrence of the winning marker is used;
//! - the section ends at the earliest end marker found at least
//!   `MIN_SECTION_LEN` bytes after the start, or at the end of the text.

use std::fs;
use std::io::Cursor;
use std::panic;
use std::path::{ Path, PathBuf };

use image::{ DynamicImage, GrayImage, ImageFormat, RgbImage };
use lopdf::Document;
use serde::{ Deserialize, Serialize };
use tracing::{ debug, warn };

use crate::error::{ RagError, RagResult };

pub const MIN_SECTION_LEN: usize = 20;
pub const DEFAULT_MIN_IMAGE_WIDTH: u32 = 100;
pub const DEFAULT_MIN_IMAGE_HEIGHT: u32 = 100;

const ABSTRACT_MARKERS: &[&str] = &["abstract", "summary"];
const METHODS_MARKERS: &[&str] = &[
    "methods",
    "methodology",
    "materials and methods",
    "materials & methods",
];
const END_MARKERS: &[&str] = &[
    "introduction",
    "background",
    "results",
    "discussion",
    "references",
    "acknowledgment",
    "conflict of interest",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Abstract,
    Methods,
}

impl Section {
    fn start_markers(self) -> &'static [&'static str] {
        match self {
            Section::Abstract => ABSTRACT_MARKERS,
            Section::Methods => METHODS_MARKERS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub abstract_text: Option<String>,
    pub methods: Option<String>,
}

impl ExtractedText {
    /// Abstract and methods joined by a newline; missing parts become empty.
    pub fn combined(&self) -> String {
        format!(
            "{}\n{}",
            self.abstract_text.as_deref().unwrap_or(""),
            self.methods.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedImage {
    pub bytes: Vec<u8>,
    /// 1-based page number.
    pub page: u32,
    /// Position of the image among the page's image objects.
    pub index: usize,
    pub extension: &'static str,
    pub path: Option<PathBuf>,
    pub source_paper: String,
}

/// Slices one section out of `text`.
pub fn extract_section(text: &str, section: Section) -> Option<String> {
    // ASCII lowering keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();

    let start = section
        .start_markers()
        .iter()
        .find_map(|marker| lower.find(marker))?;

    let rest = &lower[start..];
    let end = END_MARKERS.iter()
        .filter_map(|marker| {
            rest.match_indices(marker)
                .map(|(pos, _)| pos)
                .find(|pos| *pos >= MIN_SECTION_LEN)
        })
        .min()
        .unwrap_or(rest.len());

    let slice = text[start..start + end].trim();
    if slice.is_empty() {
        None
    } else {
        Some(slice.to_string())
    }
}

/// Full text of a PDF, or an empty string when nothing can be read.
pub fn extract_full_text(path: &Path) -> String {
    match extract_with_pdf_extract(path) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => extract_with_lopdf(path).unwrap_or_default(),
        Err(e) => {
            debug!("pdf-extract failed on {}: {}; falling back to lopdf", path.display(), e);
            extract_with_lopdf(path).unwrap_or_else(|e| {
                warn!("No text extracted from {}: {}", path.display(), e);
                String::new()
            })
        }
    }
}

fn extract_with_pdf_extract(path: &Path) -> RagResult<String> {
    let bytes = fs::read(path)?;
    // pdf-extract panics on some malformed documents.
    panic::catch_unwind(|| pdf_extract::extract_text_from_mem(&bytes))
        .map_err(|_| RagError::PdfExtraction("pdf-extract panicked".to_string()))?
        .map_err(|e| RagError::PdfExtraction(e.to_string()))
}

fn extract_with_lopdf(path: &Path) -> RagResult<String> {
    let doc = Document::load(path).map_err(|e| RagError::PdfExtraction(e.to_string()))?;
    let mut full_text = String::new();
    for page_number in doc.get_pages().keys() {
        if let Ok(text) = doc.extract_text(&[*page_number]) {
            full_text.push_str(&text);
            full_text.push('\n');
        }
    }
    Ok(full_text)
}

/// Abstract and methods excerpts of a PDF. Never fails: anything missing is `None`.
pub fn extract_abstract_and_methods(path: impl AsRef<Path>) -> ExtractedText {
    let path = path.as_ref();
    if !path.exists() {
        return ExtractedText::default();
    }
    let full_text = extract_full_text(path);
    ExtractedText {
        abstract_text: extract_section(&full_text, Section::Abstract),
        methods: extract_section(&full_text, Section::Methods),
    }
}

/// Embedded raster images of at least `min_width`x`min_height`, optionally
/// written to `output_dir` as `<stem>_p<page>_i<index>.<ext>`.
pub fn extract_images_from_pdf(
    path: impl AsRef<Path>,
    output_dir: Option<&Path>,
    min_width: u32,
    min_height: u32
) -> RagResult<Vec<ExtractedImage>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let doc = Document::load(path).map_err(|e| RagError::PdfExtraction(e.to_string()))?;
    if let Some(dir) = output_dir {
        fs::create_dir_all(dir)?;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut results = Vec::new();
    for (page_number, page_id) in doc.get_pages() {
        let images = match doc.get_page_images(page_id) {
            Ok(images) => images,
            Err(e) => {
                debug!("Skipping images on page {} of {}: {}", page_number, path.display(), e);
                continue;
            }
        };

        for (index, image) in images.iter().enumerate() {
            if image.width < i64::from(min_width) || image.height < i64::from(min_height) {
                continue;
            }
            let raw = RawImage {
                id: image.id,
                width: image.width,
                height: image.height,
                color_space: image.color_space.as_deref(),
                bits_per_component: image.bits_per_component,
                filters: image.filters.clone().unwrap_or_default(),
                content: image.content,
            };
            let Some((bytes, extension)) = encode_image(&doc, &raw) else {
                debug!("Unsupported image encoding on page {} of {}", page_number, path.display());
                continue;
            };

            let saved = match output_dir {
                Some(dir) => {
                    let target = dir.join(format!("{stem}_p{page_number}_i{index}.{extension}"));
                    fs::write(&target, &bytes)?;
                    Some(target)
                }
                None => None,
            };

            results.push(ExtractedImage {
                bytes,
                page: page_number,
                index,
                extension,
                path: saved,
                source_paper: stem.clone(),
            });
        }
    }
    Ok(results)
}

struct RawImage<'a> {
    id: lopdf::ObjectId,
    width: i64,
    height: i64,
    color_space: Option<&'a str>,
    bits_per_component: Option<i64>,
    filters: Vec<String>,
    content: &'a [u8],
}

/// Re-packs an image XObject as a standalone file: JPEG/JPEG 2000 streams
/// verbatim, raw 8-bit RGB or gray pixels as PNG.
fn encode_image(doc: &Document, image: &RawImage<'_>) -> Option<(Vec<u8>, &'static str)> {
    let filters = &image.filters;
    match filters.last().map(String::as_str) {
        Some("DCTDecode") if filters.len() == 1 => {
            return Some((image.content.to_vec(), "jpg"));
        }
        Some("JPXDecode") if filters.len() == 1 => {
            return Some((image.content.to_vec(), "jp2"));
        }
        None | Some("FlateDecode") => {}
        Some(_) => {
            return None;
        }
    }

    if image.bits_per_component != Some(8) {
        return None;
    }
    let pixels = if filters.is_empty() {
        image.content.to_vec()
    } else {
        doc.get_object(image.id).ok()?.as_stream().ok()?.decompressed_content().ok()?
    };

    let width = u32::try_from(image.width).ok()?;
    let height = u32::try_from(image.height).ok()?;
    let decoded = match image.color_space {
        Some("DeviceRGB") => DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, pixels)?),
        Some("DeviceGray") => DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, pixels)?),
        _ => {
            return None;
        }
    };

    let mut png = Cursor::new(Vec::new());
    decoded.write_to(&mut png, ImageFormat::Png).ok()?;
    Some((png.into_inner(), "png"))
}
