use std::path::{ Path, PathBuf };

use anyhow::{ Context, Result };
use clap::{ Parser, Subcommand };
use tracing_subscriber::{ fmt, prelude::*, EnvFilter };

use medlit_rag::acquire::{ collect, CollectPlan, PubMedClient };
use medlit_rag::embedding::{ FastEmbedImage, FastEmbedText, ImageInput };
use medlit_rag::evaluate::{ default_cases, load_cases, run_evaluation };
use medlit_rag::indexer::Indexer;
use medlit_rag::models::{ QueryResult, PATH_KEY, SOURCE_PAPER_KEY };
use medlit_rag::retrieval::Retriever;
use medlit_rag::store::SurrealStore;
use medlit_rag::synthesis::AnswerSynthesizer;
use medlit_rag::Settings;

const MAX_PAPERS_SHOWN: usize = 5;
const MAX_FIGURES_SHOWN: usize = 6;
const PAPER_PREVIEW_CHARS: usize = 800;

#[derive(Parser, Debug)]
#[command(
    name = "medlit-rag",
    version,
    about = "Search biomedical papers by text, by figure, or both"
)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search PubMed, download open-access PDFs and extract abstracts and figures
    Collect {
        /// Literature search query (repeatable); defaults to the built-in EEG/fMRI set
        #[arg(short, long = "query")]
        queries: Vec<String>,
        #[arg(long, default_value_t = 25)]
        per_query: usize,
        #[arg(long, default_value_t = 75)]
        max_papers: usize,
    },
    /// (Re)build the text and image collections from local papers and figures
    Index,
    /// Retrieve papers and figures and synthesize an answer
    Ask {
        /// Text question
        #[arg(short, long)]
        query: Option<String>,
        /// Reference image
        #[arg(short, long, value_name = "FILE")]
        image: Option<PathBuf>,
        #[arg(long)]
        top_k_text: Option<usize>,
        #[arg(long)]
        top_k_images: Option<usize>,
        /// Only show retrieved papers and figures
        #[arg(long)]
        no_answer: bool,
    },
    /// Run test queries and report precision/recall
    Evaluate {
        /// JSON file with [{"query": ..., "expected_papers": [...]}]
        #[arg(long, value_name = "FILE")]
        cases: Option<PathBuf>,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

fn init_logging(level: &str) {
    tracing_subscriber
        ::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

async fn open_retriever(
    settings: &Settings
) -> Result<Retriever<FastEmbedText, FastEmbedImage, SurrealStore>> {
    let store = SurrealStore::open(&settings.store_dir).await.with_context(||
        format!("Failed to open vector store at {}", settings.store_dir.display())
    )?;
    let text = FastEmbedText::new(&settings.text_model, &settings.model_cache_dir)?;
    let image = FastEmbedImage::new(&settings.model_cache_dir);
    Ok(Retriever::new(text, image, store))
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn print_papers(results: &[QueryResult]) {
    println!("\nRetrieved papers (text)");
    println!("-----------------------");
    if results.is_empty() {
        println!("No text results. Index papers first (medlit-rag index).");
        return;
    }
    for (i, result) in results.iter().take(MAX_PAPERS_SHOWN).enumerate() {
        println!("{}. {} (distance: {:.4})", i + 1, result.source(), result.distance);
        println!("   {}", preview(result.text.as_deref().unwrap_or(""), PAPER_PREVIEW_CHARS));
        println!();
    }
}

fn print_figures(results: &[QueryResult]) {
    println!("\nRelevant figures");
    println!("----------------");
    if results.is_empty() {
        println!("No image results.");
        return;
    }
    for (i, result) in results.iter().take(MAX_FIGURES_SHOWN).enumerate() {
        let path = result.metadata.get(PATH_KEY).map(String::as_str).unwrap_or(&result.id);
        let source = result.metadata.get(SOURCE_PAPER_KEY).map(String::as_str).unwrap_or("?");
        let missing = if Path::new(path).exists() { "" } else { " [file missing]" };
        println!("{}. {} (from paper: {}, distance: {:.4}){}", i + 1, path, source, result.distance, missing);
    }
}

async fn ask(
    settings: &Settings,
    query: Option<String>,
    image: Option<PathBuf>,
    top_k_text: usize,
    top_k_images: usize,
    no_answer: bool
) -> Result<()> {
    let query = query.filter(|q| !q.trim().is_empty());
    if query.is_none() && image.is_none() {
        println!("Enter a text question (--query) and/or a reference image (--image).");
        return Ok(());
    }

    let retriever = open_retriever(settings).await?;
    let results = retriever.process_query(
        query.as_deref(),
        image.map(ImageInput::Path),
        top_k_text,
        top_k_images
    ).await?;

    print_papers(&results.text_results);
    print_figures(&results.image_results);

    match &query {
        Some(question) if !no_answer && !results.is_empty() => {
            let synthesizer = AnswerSynthesizer::from_settings(settings);
            let answer = synthesizer.generate_response(
                question,
                &results.text_results,
                &results.image_results
            ).await?;
            println!("\nAnswer");
            println!("------");
            println!("{answer}");
        }
        Some(_) => {}
        None => println!("\nAdd a text question to get an LLM-synthesized answer."),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let settings = Settings::from_env().context("Failed to load settings")?;

    match cli.command {
        Command::Collect { queries, per_query, max_papers } => {
            let mut plan = CollectPlan {
                per_query,
                max_papers,
                ..CollectPlan::default()
            };
            if !queries.is_empty() {
                plan.queries = queries;
            }
            let client = PubMedClient::new(settings.pubmed_email.clone())?;
            let report = collect(&client, &settings, &plan).await?;
            println!(
                "Found {} PMIDs, {} with PDFs: {} downloaded, {} already present, {} failed",
                report.pmids_found,
                report.with_pdf,
                report.downloaded.len(),
                report.already_present.len(),
                report.failed.len()
            );
            println!(
                "Wrote {} abstracts and {} figures",
                report.abstracts_written.len(),
                report.figures_written
            );
        }
        Command::Index => {
            let store = SurrealStore::open(&settings.store_dir).await.with_context(||
                format!("Failed to open vector store at {}", settings.store_dir.display())
            )?;
            let text = FastEmbedText::new(&settings.text_model, &settings.model_cache_dir)?;
            let image = FastEmbedImage::new(&settings.model_cache_dir);
            let indexer = Indexer::new(text, image, store);
            let report = indexer.run(&settings.papers_dir, &settings.figures_dir).await?;

            if report.is_empty() {
                println!("No papers or figures found. Run `medlit-rag collect` first.");
            } else {
                println!(
                    "Indexed {} papers ({} skipped) and {} figures ({} skipped)",
                    report.papers_indexed.len(),
                    report.papers_skipped.len(),
                    report.figures_indexed.len(),
                    report.figures_skipped.len()
                );
                for skipped in report.papers_skipped.iter().chain(&report.figures_skipped) {
                    println!("  skipped {}: {}", skipped.item, skipped.reason);
                }
            }
        }
        Command::Ask { query, image, top_k_text, top_k_images, no_answer } => {
            ask(
                &settings,
                query,
                image,
                top_k_text.unwrap_or(settings.top_k_text),
                top_k_images.unwrap_or(settings.top_k_images),
                no_answer
            ).await?;
        }
        Command::Evaluate { cases, top_k } => {
            let cases = match cases {
                Some(path) => load_cases(&path)?,
                None => default_cases(),
            };
            let retriever = open_retriever(&settings).await?;
            let outcomes = run_evaluation(&retriever, &cases, top_k.unwrap_or(settings.top_k_text)).await?;
            for outcome in outcomes {
                println!("Query: {}", preview(&outcome.query, 60));
                println!("  Retrieved: {:?}", outcome.retrieved);
                if outcome.expected.is_empty() {
                    println!("  (No expected set; add expected_papers to the cases file for metrics)");
                } else {
                    println!("  Precision: {:.2}, Recall: {:.2}", outcome.precision, outcome.recall);
                }
                println!();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 800), "short");
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("θθθθ", 2), "θθ...");
        assert_eq!(preview(&"x".repeat(800), 800), "x".repeat(800));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["medlit-rag", "ask", "--query", "EEG theta waves", "--no-answer"]).unwrap();
        match cli.command {
            Command::Ask { query, image, no_answer, .. } => {
                assert_eq!(query.as_deref(), Some("EEG theta waves"));
                assert!(image.is_none());
                assert!(no_answer);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["medlit-rag", "collect", "-q", "sleep spindles", "--per-query", "5"]).unwrap();
        assert!(matches!(cli.command, Command::Collect { per_query: 5, .. }));
    }
}
