//! PubMed / PubMed Central acquisition.
//!
//! Searches PubMed through the NCBI E-utilities, resolves which hits have an
//! open-access copy in PMC, downloads those PDFs and runs extraction over the
//! local papers directory.

use std::collections::{ HashMap, HashSet };
use std::path::{ Path, PathBuf };
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::USER_AGENT;
use serde::{ Deserialize, Serialize };
use tracing::{ debug, info, warn };

use crate::config::Settings;
use crate::error::{ RagError, RagResult };
use crate::extract::{
    extract_abstract_and_methods,
    extract_images_from_pdf,
    DEFAULT_MIN_IMAGE_HEIGHT,
    DEFAULT_MIN_IMAGE_WIDTH,
};
use crate::models::ItemFailure;

pub const EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
pub const CLIENT_USER_AGENT: &str = "MedicalLiteratureAssistant/1.0";
const TOOL_NAME: &str = "medlit-rag";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_QUERIES: &[&str] = &[
    "EEG theta waves",
    "seizure detection EEG",
    "brain imaging fMRI",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSummary {
    pub pmid: String,
    pub pmc_id: Option<String>,
    pub title: String,
    pub abstract_text: String,
    pub pdf_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ELinkResponse {
    #[serde(default)]
    linksets: Vec<LinkSet>,
}

#[derive(Debug, Deserialize)]
struct LinkSet {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    linksetdbs: Vec<LinkSetDb>,
}

#[derive(Debug, Deserialize)]
struct LinkSetDb {
    dbto: String,
    #[serde(default)]
    links: Vec<String>,
}

pub fn parse_esearch(body: &str) -> RagResult<Vec<String>> {
    let response: ESearchResponse = serde_json
        ::from_str(body)
        .map_err(|e| RagError::Parse(format!("esearch: {e}")))?;
    Ok(response.esearchresult.idlist)
}

/// PMID → `PMC…` id, one entry per linkset that links into PMC.
pub fn parse_elink(body: &str) -> RagResult<HashMap<String, String>> {
    let response: ELinkResponse = serde_json
        ::from_str(body)
        .map_err(|e| RagError::Parse(format!("elink: {e}")))?;

    let mut pmid_to_pmc = HashMap::new();
    for linkset in response.linksets {
        let Some(pmid) = linkset.ids.first() else {
            continue;
        };
        let link = linkset.linksetdbs
            .iter()
            .find(|db| db.dbto == "pmc")
            .and_then(|db| db.links.first());
        if let Some(link) = link {
            pmid_to_pmc.insert(pmid.clone(), normalize_pmc_id(link));
        }
    }
    Ok(pmid_to_pmc)
}

fn normalize_pmc_id(raw: &str) -> String {
    let raw = raw.trim();
    if raw.to_ascii_uppercase().starts_with("PMC") {
        raw.to_string()
    } else {
        format!("PMC{raw}")
    }
}

#[derive(Default)]
struct ArticleBuilder {
    pmid: Option<String>,
    title: String,
    abstract_parts: Vec<String>,
}

fn push_words(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

/// Parses an `efetch` PubmedArticleSet. Articles without a PMID are dropped.
pub fn parse_efetch(xml: &str) -> RagResult<Vec<PaperSummary>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut article: Option<ArticleBuilder> = None;
    let mut section = String::new();
    let mut summaries = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "PubmedArticle" {
                    article = Some(ArticleBuilder::default());
                }
                if name == "AbstractText" {
                    section.clear();
                }
                path.push(name);
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                match name.as_ref() {
                    b"AbstractText" => {
                        if let Some(article) = article.as_mut() {
                            if !section.is_empty() {
                                article.abstract_parts.push(std::mem::take(&mut section));
                            }
                        }
                    }
                    b"PubmedArticle" => {
                        if let Some(ArticleBuilder { pmid: Some(pmid), title, abstract_parts }) = article.take() {
                            summaries.push(PaperSummary {
                                pmid,
                                pmc_id: None,
                                title,
                                abstract_text: abstract_parts.join(" "),
                                pdf_url: None,
                            });
                        }
                    }
                    _ => {}
                }
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let Some(article) = article.as_mut() else {
                    continue;
                };
                let text = t.unescape().map_err(|e| RagError::Parse(format!("efetch: {e}")))?;
                let parent = path.len().checked_sub(2).and_then(|i| path.get(i));
                let current = path.last();
                if
                    current.map(String::as_str) == Some("PMID") &&
                    parent.map(String::as_str) == Some("MedlineCitation")
                {
                    article.pmid = Some(text.trim().to_string());
                } else if path.iter().any(|p| p == "ArticleTitle") {
                    push_words(&mut article.title, &text);
                } else if path.iter().any(|p| p == "AbstractText") {
                    push_words(&mut section, &text);
                }
            }
            Ok(Event::Eof) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                return Err(RagError::Parse(format!("efetch: {e}")));
            }
        }
    }
    Ok(summaries)
}

/// Open-access PDF location for a PMC id, `None` if it is not a PMC id.
pub fn pmc_pdf_url(pmc_id: &str) -> Option<String> {
    let upper = pmc_id.trim().to_ascii_uppercase();
    let number = upper.strip_prefix("PMC")?;
    if number.is_empty() {
        return None;
    }
    Some(format!("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC{number}/pdf/"))
}

#[derive(Debug, Clone)]
pub struct PubMedClient {
    http: reqwest::Client,
    base_url: String,
    email: Option<String>,
}

impl PubMedClient {
    pub fn new(email: Option<String>) -> RagResult<Self> {
        Self::with_base_url(EUTILS_BASE_URL, email)
    }

    pub fn with_base_url(base_url: impl Into<String>, email: Option<String>) -> RagResult<Self> {
        let http = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email,
        })
    }

    async fn get_text(&self, endpoint: &str, params: &[(&str, String)]) -> RagResult<String> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("tool", TOOL_NAME.to_string()));
        if let Some(email) = &self.email {
            query.push(("email", email.clone()));
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        debug!("GET {} ({} params)", url, query.len());
        let body = self.http
            .get(&url)
            .query(&query)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .send().await?
            .error_for_status()?
            .text().await?;
        Ok(body)
    }

    pub async fn search_pmids(&self, query: &str, retmax: usize) -> RagResult<Vec<String>> {
        let body = self.get_text(
            "esearch.fcgi",
            &[
                ("db", "pubmed".to_string()),
                ("term", query.to_string()),
                ("retmax", retmax.to_string()),
                ("retmode", "json".to_string()),
            ]
        ).await?;
        parse_esearch(&body)
    }

    /// Lookup failures degrade to an empty map.
    pub async fn pmids_to_pmc_ids(&self, pmids: &[String]) -> HashMap<String, String> {
        if pmids.is_empty() {
            return HashMap::new();
        }
        let mut params = vec![
            ("dbfrom", "pubmed".to_string()),
            ("db", "pmc".to_string()),
            ("linkname", "pubmed_pmc".to_string()),
            ("retmode", "json".to_string())
        ];
        params.extend(pmids.iter().map(|id| ("id", id.clone())));

        match self.get_text("elink.fcgi", &params).await.and_then(|body| parse_elink(&body)) {
            Ok(map) => map,
            Err(e) => {
                warn!("PMC link lookup failed: {}", e);
                HashMap::new()
            }
        }
    }

    pub async fn fetch_summaries(&self, pmids: &[String]) -> RagResult<Vec<PaperSummary>> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        let body = self.get_text(
            "efetch.fcgi",
            &[
                ("db", "pubmed".to_string()),
                ("id", pmids.join(",")),
                ("rettype", "abstract".to_string()),
                ("retmode", "xml".to_string()),
            ]
        ).await?;

        let mut summaries = parse_efetch(&body)?;
        let pmc_map = self.pmids_to_pmc_ids(pmids).await;
        for summary in &mut summaries {
            summary.pmc_id = pmc_map.get(&summary.pmid).cloned();
        }
        Ok(summaries)
    }

    /// Summaries annotated with their open-access PDF URL, when there is one.
    pub async fn fetch_pdf_links(&self, pmids: &[String]) -> RagResult<Vec<PaperSummary>> {
        let mut summaries = self.fetch_summaries(pmids).await?;
        for summary in &mut summaries {
            summary.pdf_url = summary.pmc_id.as_deref().and_then(pmc_pdf_url);
        }
        Ok(summaries)
    }

    pub async fn download_pdf(&self, url: &str, path: &Path) -> RagResult<()> {
        let bytes = self.http
            .get(url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .timeout(DOWNLOAD_TIMEOUT)
            .send().await?
            .error_for_status()?
            .bytes().await?;
        if !bytes.starts_with(b"%PDF") {
            return Err(RagError::Parse(format!("{url} did not return a PDF")));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CollectPlan {
    pub queries: Vec<String>,
    pub per_query: usize,
    pub max_papers: usize,
    pub search_delay: Duration,
    pub download_delay: Duration,
}

impl Default for CollectPlan {
    fn default() -> Self {
        Self {
            queries: DEFAULT_QUERIES.iter()
                .map(|q| q.to_string())
                .collect(),
            per_query: 25,
            max_papers: 75,
            search_delay: Duration::from_millis(400),
            download_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectReport {
    pub pmids_found: usize,
    pub with_pdf: usize,
    pub downloaded: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<ItemFailure>,
    pub abstracts_written: Vec<String>,
    pub figures_written: usize,
}

/// Keeps the first occurrence of each id, in order, up to `cap` ids.
pub fn dedup_capped(ids: impl IntoIterator<Item = String>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .take(cap)
        .collect()
}

/// Search, download and extract into the configured papers/figures dirs.
pub async fn collect(
    client: &PubMedClient,
    settings: &Settings,
    plan: &CollectPlan
) -> RagResult<CollectReport> {
    tokio::fs::create_dir_all(&settings.papers_dir).await?;
    tokio::fs::create_dir_all(&settings.figures_dir).await?;

    let mut report = CollectReport::default();
    let mut all_pmids = Vec::new();
    for query in &plan.queries {
        match client.search_pmids(query, plan.per_query).await {
            Ok(pmids) => all_pmids.extend(pmids),
            Err(e) => {
                warn!("Search failed for {:?}: {}", query, e);
                report.failed.push(ItemFailure::new(format!("search:{query}"), e));
            }
        }
        tokio::time::sleep(plan.search_delay).await;
    }

    let pmids = dedup_capped(all_pmids, plan.max_papers);
    report.pmids_found = pmids.len();
    info!("Found {} unique PMIDs", pmids.len());

    let summaries = client.fetch_pdf_links(&pmids).await?;
    let with_pdf: Vec<&PaperSummary> = summaries
        .iter()
        .filter(|s| s.pdf_url.is_some())
        .collect();
    report.with_pdf = with_pdf.len();
    info!("Of those, {} have PMC PDF links", with_pdf.len());

    for (i, summary) in with_pdf.iter().enumerate() {
        let (Some(pmc_id), Some(url)) = (&summary.pmc_id, &summary.pdf_url) else {
            continue;
        };
        let file_name = format!("{}.pdf", pmc_id.to_ascii_uppercase());
        let target = settings.papers_dir.join(&file_name);
        if target.exists() {
            debug!("Skip (exists): {}", file_name);
            report.already_present.push(file_name);
            continue;
        }

        info!("Downloading {}/{}: {}", i + 1, with_pdf.len(), file_name);
        match client.download_pdf(url, &target).await {
            Ok(()) => {
                report.downloaded.push(file_name);
                tokio::time::sleep(plan.download_delay).await;
            }
            Err(e) => {
                warn!("Download failed for {}: {}", url, e);
                report.failed.push(ItemFailure::new(file_name, e));
            }
        }
    }

    extract_local_papers(settings, &mut report)?;
    Ok(report)
}

fn local_pdfs(papers_dir: &Path) -> RagResult<Vec<PathBuf>> {
    let mut pdfs: Vec<PathBuf> = walkdir::WalkDir
        ::new(papers_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.is_file() &&
                path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    pdfs.sort();
    Ok(pdfs)
}

fn extract_local_papers(settings: &Settings, report: &mut CollectReport) -> RagResult<()> {
    let pdfs = local_pdfs(&settings.papers_dir)?;
    info!("Extracting text and figures from {} PDFs", pdfs.len());

    for pdf in pdfs {
        let Some(stem) = pdf.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };

        let extracted = extract_abstract_and_methods(&pdf);
        if let Some(abstract_text) = &extracted.abstract_text {
            let abstract_path = settings.papers_dir.join(format!("{stem}_abstract.txt"));
            std::fs::write(&abstract_path, abstract_text)?;
            report.abstracts_written.push(stem.clone());
        }

        let figure_dir = settings.figures_dir.join(&stem);
        match
            extract_images_from_pdf(
                &pdf,
                Some(&figure_dir),
                DEFAULT_MIN_IMAGE_WIDTH,
                DEFAULT_MIN_IMAGE_HEIGHT
            )
        {
            Ok(images) => {
                report.figures_written += images.len();
            }
            Err(e) => {
                warn!("Figure extraction failed for {}: {}", pdf.display(), e);
                report.failed.push(ItemFailure::new(format!("figures:{stem}"), e));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EFETCH: &str =
        r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">111</PMID>
      <Article PubModel="Print">
        <ArticleTitle>Theta oscillations in <i>human</i> sleep</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">Theta &amp; delta bands.</AbstractText>
          <AbstractText Label="RESULTS">Power rose.</AbstractText>
        </Abstract>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections RefType="Cites"><PMID Version="1">999</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">222</PMID>
      <Article><ArticleTitle>No abstract here</ArticleTitle></Article>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation><Article><ArticleTitle>Missing id</ArticleTitle></Article></MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_esearch() {
        let body =
            r#"{"header":{},"esearchresult":{"count":"2","idlist":["38000001","38000002"]}}"#;
        assert_eq!(parse_esearch(body).unwrap(), vec!["38000001", "38000002"]);
        assert!(parse_esearch("not json").is_err());
    }

    #[test]
    fn test_parse_elink_prefixes_pmc_ids() {
        let body =
            r#"{"linksets":[
            {"dbfrom":"pubmed","ids":["111"],"linksetdbs":[{"dbto":"pmc","linkname":"pubmed_pmc","links":["7654321"]}]},
            {"dbfrom":"pubmed","ids":["222"]},
            {"dbfrom":"pubmed","ids":["333"],"linksetdbs":[{"dbto":"pmc","linkname":"pubmed_pmc","links":["PMC42"]}]}
        ]}"#;
        let map = parse_elink(body).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["111"], "PMC7654321");
        assert_eq!(map["333"], "PMC42");
    }

    #[test]
    fn test_parse_efetch() {
        let summaries = parse_efetch(EFETCH).unwrap();
        assert_eq!(summaries.len(), 2);

        let first = &summaries[0];
        assert_eq!(first.pmid, "111");
        assert_eq!(first.title, "Theta oscillations in human sleep");
        assert_eq!(first.abstract_text, "Theta & delta bands. Power rose.");
        assert_eq!(first.pmc_id, None);

        assert_eq!(summaries[1].pmid, "222");
        assert_eq!(summaries[1].abstract_text, "");
    }

    #[test]
    fn test_pmc_pdf_url() {
        assert_eq!(
            pmc_pdf_url("PMC1234567").as_deref(),
            Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC1234567/pdf/")
        );
        assert_eq!(
            pmc_pdf_url("pmc99").as_deref(),
            Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC99/pdf/")
        );
        assert_eq!(pmc_pdf_url("1234567"), None);
        assert_eq!(pmc_pdf_url("PMC"), None);
    }

    #[test]
    fn test_dedup_capped_keeps_first_seen_order() {
        let ids = ["3", "1", "3", "2", "1", "4"].map(String::from);
        assert_eq!(dedup_capped(ids.clone(), 10), vec!["3", "1", "2", "4"]);
        assert_eq!(dedup_capped(ids, 2), vec!["3", "1"]);
    }

    #[test]
    fn test_local_pdfs_only_top_level_pdfs() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("PMC2.pdf"), b"%PDF").unwrap();
        std::fs::write(temp_dir.path().join("PMC1.PDF"), b"%PDF").unwrap();
        std::fs::write(temp_dir.path().join("PMC1_abstract.txt"), "text").unwrap();
        std::fs::create_dir(temp_dir.path().join("nested")).unwrap();
        std::fs::write(temp_dir.path().join("nested").join("PMC3.pdf"), b"%PDF").unwrap();

        let names: Vec<String> = local_pdfs(temp_dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["PMC1.PDF", "PMC2.pdf"]);
    }

    #[test]
    fn test_extract_local_papers_writes_abstracts_and_figures() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().to_string_lossy().into_owned();
        let settings = Settings::from_lookup(|key| {
            (key == "MEDLIT_DATA_DIR").then(|| data_dir.clone())
        }).unwrap();
        std::fs::create_dir_all(&settings.papers_dir).unwrap();
        std::fs::create_dir_all(&settings.figures_dir).unwrap();

        crate::extract::fixtures::write_pdf(
            &settings.papers_dir.join("PMC1.pdf"),
            "Abstract We recorded theta activity in sleeping adults. Introduction follows.",
            &[(200, 150)]
        );
        std::fs::write(settings.papers_dir.join("PMC2.pdf"), b"Not a real PDF file").unwrap();

        let mut report = CollectReport::default();
        extract_local_papers(&settings, &mut report).unwrap();

        assert_eq!(report.abstracts_written, vec!["PMC1"]);
        let abstract_text = std::fs
            ::read_to_string(settings.papers_dir.join("PMC1_abstract.txt"))
            .unwrap();
        assert!(abstract_text.to_ascii_lowercase().starts_with("abstract"));
        assert!(abstract_text.contains("theta"));
        assert!(!abstract_text.to_ascii_lowercase().contains("introduction"));
        assert!(!settings.papers_dir.join("PMC2_abstract.txt").exists());

        assert_eq!(report.figures_written, 1);
        assert!(settings.figures_dir.join("PMC1").join("PMC1_p1_i0.png").is_file());
        assert!(!settings.figures_dir.join("PMC2").exists());

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item, "figures:PMC2");
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let temp_dir = TempDir::new().unwrap();
        let client = PubMedClient::with_base_url("http://127.0.0.1:9", None).unwrap();
        let target = temp_dir.path().join("PMC1.pdf");

        let result = client.download_pdf("http://127.0.0.1:9/PMC1/pdf/", &target).await;
        assert!(result.is_err());
        assert!(!target.exists());
        assert!(client.pmids_to_pmc_ids(&["1".to_string()]).await.is_empty());
    }
}
