//! Answer synthesis over retrieved papers and figures via a hosted chat model.

use serde::{ Deserialize, Serialize };
use tracing::{ debug, info };

use crate::config::Settings;
use crate::error::{ RagError, RagResult };
use crate::models::{ QueryResult, PATH_KEY, SOURCE_PAPER_KEY };

pub const NO_CREDENTIAL_MESSAGE: &str =
    "OpenAI API key not set. Set OPENAI_API_KEY in .env to enable LLM answers.";

const NO_TEXT_SOURCES: &str = "(No text sources retrieved)";
const NO_FIGURES: &str = "(No figures retrieved)";

/// Context blocks for the prompt: one block per paper, one line per figure.
pub fn build_context(text_results: &[QueryResult], image_results: &[QueryResult]) -> (String, String) {
    let text_context = text_results
        .iter()
        .map(|r| {
            format!("Paper: {}\n{}", r.source(), r.text.as_deref().unwrap_or(""))
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let image_context = image_results
        .iter()
        .map(|r| {
            let path = r.metadata.get(PATH_KEY).map(String::as_str).unwrap_or(&r.id);
            let source = r.metadata.get(SOURCE_PAPER_KEY).map(String::as_str).unwrap_or("?");
            format!("Figure: {path} (from paper: {source})")
        })
        .collect::<Vec<_>>()
        .join("\n");

    (text_context, image_context)
}

pub fn build_prompt(query: &str, text_context: &str, image_context: &str) -> String {
    let text_context = if text_context.is_empty() { NO_TEXT_SOURCES } else { text_context };
    let image_context = if image_context.is_empty() { NO_FIGURES } else { image_context };
    format!(
        "You are a medical research assistant. Answer the user's question using the following context.

TEXT SOURCES (abstracts/methods):
{text_context}

RELEVANT FIGURES:
{image_context}

User question: {query}

Provide a concise, accurate answer with citations to specific papers and figures where relevant."
    )
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub fn parse_chat_response(body: &str) -> RagResult<String> {
    let response: ChatResponse = serde_json
        ::from_str(body)
        .map_err(|e| RagError::Parse(format!("chat completion: {e}")))?;
    response.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| RagError::Synthesis("chat completion returned no content".to_string()))
}

#[derive(Debug, Clone)]
pub struct AnswerSynthesizer {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl AnswerSynthesizer {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.openai_api_key.clone(),
            settings.openai_base_url.clone(),
            settings.llm_model.clone()
        )
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    /// One non-streaming completion; without a key, the fixed fallback message.
    pub async fn generate_response(
        &self,
        query: &str,
        text_results: &[QueryResult],
        image_results: &[QueryResult]
    ) -> RagResult<String> {
        let Some(api_key) = &self.api_key else {
            info!("No model credential configured; skipping answer synthesis");
            return Ok(NO_CREDENTIAL_MESSAGE.to_string());
        };

        let (text_context, image_context) = build_context(text_results, image_results);
        let prompt = build_prompt(query, &text_context, &image_context);
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![ChatMessage { role: "user", content: &prompt }],
        };

        debug!("Requesting answer from {} ({} prompt chars)", self.model, prompt.len());
        let response = self.http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RagError::Synthesis(format!("{status}: {body}")));
        }
        parse_chat_response(&body)
    }
}
