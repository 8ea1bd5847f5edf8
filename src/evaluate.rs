//! Retrieval evaluation: precision/recall of retrieved paper ids against a
//! caller-supplied expected set.

use std::collections::HashSet;
use std::path::Path;

use serde::{ Deserialize, Serialize };
use tracing::info;

use crate::embedding::{ ImageEmbedder, TextEmbedder };
use crate::error::{ RagError, RagResult };
use crate::retrieval::Retriever;
use crate::store::VectorStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    pub query: String,
    #[serde(default)]
    pub expected_papers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub query: String,
    pub retrieved: Vec<String>,
    pub expected: Vec<String>,
    pub precision: f64,
    pub recall: f64,
}

pub fn default_cases() -> Vec<EvalCase> {
    vec![
        EvalCase {
            query: "What papers discuss theta wave activity in sleep?".to_string(),
            expected_papers: Vec::new(),
        },
        EvalCase {
            query: "EEG seizure detection".to_string(),
            expected_papers: Vec::new(),
        }
    ]
}

/// Reads a JSON array of `{ "query": ..., "expected_papers": [...] }`.
pub fn load_cases(path: &Path) -> RagResult<Vec<EvalCase>> {
    let raw = std::fs::read_to_string(path)?;
    serde_json
        ::from_str(&raw)
        .map_err(|e| RagError::Config(format!("invalid evaluation cases in {}: {e}", path.display())))
}

/// Set-based precision and recall; both are 0 when either side is empty.
pub fn evaluate_retrieval<S: AsRef<str>>(retrieved: &[S], expected: &[S]) -> (f64, f64) {
    let retrieved: HashSet<&str> = retrieved
        .iter()
        .map(|s| s.as_ref())
        .collect();
    let expected: HashSet<&str> = expected
        .iter()
        .map(|s| s.as_ref())
        .collect();
    if expected.is_empty() || retrieved.is_empty() {
        return (0.0, 0.0);
    }
    let true_positives = retrieved.intersection(&expected).count() as f64;
    (true_positives / (retrieved.len() as f64), true_positives / (expected.len() as f64))
}

pub async fn run_evaluation<T, I, S>(
    retriever: &Retriever<T, I, S>,
    cases: &[EvalCase],
    top_k: usize
)
    -> RagResult<Vec<EvalOutcome>>
    where T: TextEmbedder, I: ImageEmbedder, S: VectorStore
{
    let mut outcomes = Vec::with_capacity(cases.len());
    for case in cases {
        let results = retriever.process_query(Some(&case.query), None, top_k, 0).await?;
        let retrieved: Vec<String> = results.text_results
            .iter()
            .map(|r| r.source().to_string())
            .collect();
        let (precision, recall) = evaluate_retrieval(retrieved.as_slice(), case.expected_papers.as_slice());
        info!("{:?}: precision {:.2}, recall {:.2}", case.query, precision, recall);
        outcomes.push(EvalOutcome {
            query: case.query.clone(),
            retrieved,
            expected: case.expected_papers.clone(),
            precision,
            recall,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use crate::retrieval::mocks::{ keyword_vector, MockImageEmbedder, MockTextEmbedder };
    use crate::store::{ CollectionKind, StoreEntry, SurrealStore };
    use tempfile::TempDir;

    #[test]
    fn test_empty_expected_is_zero() {
        assert_eq!(evaluate_retrieval(&["PMC1", "PMC2"], &[]), (0.0, 0.0));
        assert_eq!(evaluate_retrieval::<&str>(&[], &[]), (0.0, 0.0));
    }

    #[test]
    fn test_nothing_retrieved_is_zero() {
        assert_eq!(evaluate_retrieval(&[], &["PMC1"]), (0.0, 0.0));
    }

    #[test]
    fn test_identical_sets_are_perfect() {
        assert_eq!(evaluate_retrieval(&["PMC1", "PMC2"], &["PMC2", "PMC1"]), (1.0, 1.0));
    }

    #[test]
    fn test_partial_overlap() {
        let (precision, recall) = evaluate_retrieval(&["PMC1", "PMC2", "PMC3", "PMC1"], &["PMC1", "PMC9"]);
        assert!((precision - 1.0 / 3.0).abs() < 1e-9);
        assert!((recall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_load_cases() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cases.json");
        std::fs
            ::write(&path, r#"[{"query":"EEG theta","expected_papers":["PMC1"]},{"query":"fMRI"}]"#)
            .unwrap();
        let cases = load_cases(&path).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].expected_papers, vec!["PMC1"]);
        assert!(cases[1].expected_papers.is_empty());

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(load_cases(&path), Err(RagError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_evaluation() -> RagResult<()> {
        let temp_dir = TempDir::new()?;
        let store = SurrealStore::open(temp_dir.path()).await?;
        let entries = [
            ("PMC1", "Theta waves in sleep"),
            ("PMC2", "Seizure detection"),
        ]
            .iter()
            .map(|(id, text)| {
                let mut metadata = Metadata::new();
                metadata.insert("source".to_string(), id.to_string());
                StoreEntry {
                    id: id.to_string(),
                    vector: keyword_vector(text),
                    document: Some(text.to_string()),
                    metadata,
                }
            })
            .collect();
        store.upsert(CollectionKind::Text, entries).await?;
        let retriever = Retriever::new(MockTextEmbedder::default(), MockImageEmbedder::default(), store);

        let cases = vec![EvalCase { query: "seizure".to_string(), expected_papers: vec!["PMC2".to_string()] }];
        let outcomes = run_evaluation(&retriever, &cases, 1).await?;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].retrieved, vec!["PMC2"]);
        assert_eq!((outcomes[0].precision, outcomes[0].recall), (1.0, 1.0));
        Ok(())
    }
}
