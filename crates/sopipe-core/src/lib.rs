use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// A reply arrived but with a non-success status.
    #[error("{service} returned HTTP {status}")]
    HttpStatus { service: String, status: u16 },
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Transport-level failures (search, page fetch, chat stream).
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Search(_) | Error::Llm(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default cap on a scraped page body. Question pages are far below this.
pub const DEFAULT_PAGE_MAX_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Timeout for the whole request, body included.
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl FetchRequest {
    /// A GET for an HTML document (`Accept: text/html`), capped at [`DEFAULT_PAGE_MAX_BYTES`].
    pub fn html(url: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "text/html".to_string());
        Self {
            url: url.into(),
            timeout_ms: None,
            max_bytes: Some(DEFAULT_PAGE_MAX_BYTES),
            headers,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    /// After redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl FetchResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub timeout_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            timeout_ms: None,
        }
    }
}

/// One organic hit. Only the link is consumed downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResult {
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Backend ranking order, untouched.
    pub results: Vec<SearchResult>,
    pub provider: String,
    pub elapsed_ms: u64,
}

impl SearchResponse {
    pub fn links(&self) -> Vec<String> {
        self.results.iter().map(|r| r.link.clone()).collect()
    }
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

/// A scraped question page: title, source URL, question body and best answer body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedSource {
    pub title: String,
    pub url: String,
    pub question: String,
    pub answer: String,
}

impl ExtractedSource {
    /// Render the single text blob handed to the model.
    pub fn to_blob(&self) -> String {
        format!(
            "\n  # Question: [{}]({})\n\n{}\n\n# Best Answer\n\n{}\n  ",
            self.title, self.url, self.question, self.answer
        )
    }
}

/// Outcome of scraping one page. `NotFound` means "skip this URL", not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(ExtractedSource),
    NotFound,
}

impl Extraction {
    pub fn found(self) -> Option<ExtractedSource> {
        match self {
            Extraction::Found(s) => Some(s),
            Extraction::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextItemId {
    pub provider_title: String,
    pub item_id: String,
}

/// Citation record surfaced to the caller's UI, separate from the model input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextItem {
    pub content: String,
    pub description: String,
    pub name: String,
    pub id: ContextItemId,
}

/// Fire-and-forget receiver for [`ContextItem`]s.
pub trait ContextSink: Send + Sync {
    fn add_context_item(&self, item: ContextItem);
}

impl<F> ContextSink for F
where
    F: Fn(ContextItem) + Send + Sync,
{
    fn add_context_item(&self, item: ContextItem) {
        self(item)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Either plain text or OpenAI-style interleaved text/image parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// Drop image parts, keeping text parts joined by newlines.
pub fn strip_images(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One streamed model delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChunk {
    pub content: MessageContent,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;

    /// Keep the longest prefix of `text` that fits in `max_tokens`.
    ///
    /// Assumes `count_tokens` is monotonic over prefixes. `max_tokens == 0` yields an empty string
    /// whenever the counter charges anything for it.
    fn prune_from_bottom(&self, text: &str, max_tokens: usize) -> String {
        if self.count_tokens(text) <= max_tokens {
            return text.to_string();
        }
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let (mut lo, mut hi) = (0usize, bounds.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.count_tokens(&text[..bounds[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        text[..bounds[lo]].to_string()
    }
}

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier (also selects the tokenizer).
    fn model(&self) -> &str;
    /// Maximum tokens the model accepts.
    fn context_length(&self) -> usize;
    fn tokenizer(&self) -> Arc<dyn Tokenizer>;

    fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer().count_tokens(text)
    }

    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream>;
}
