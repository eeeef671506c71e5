use sopipe_core::{Error, FetchBackend, FetchRequest, FetchResponse, Result};
use std::time::Duration;

pub mod budget;
pub mod config;
pub mod openai_compat;
pub mod search;
pub mod slash;
pub mod stackoverflow;
pub mod tokens;

/// Trimmed env var; empty counts as unset.
pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_flag(key: &str) -> Option<bool> {
    env(key).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// One client for search, pages and the model endpoint.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("sopipe/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        // No overall timeout: chat streams can legitimately run long. Pages get one per request.
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Fetch(e.to_string()))
}

const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Plain GET fetcher for question pages.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
}

impl LocalFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self::with_client(http_client()?))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Read at most `cap` body bytes. Returns the bytes and whether anything was left unread.
async fn read_capped(resp: reqwest::Response, cap: usize) -> Result<(Vec<u8>, bool)> {
    use futures_util::StreamExt;

    let mut body = Vec::new();
    let mut chunks = resp.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
        let room = cap - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, false))
}

#[async_trait::async_trait]
impl FetchBackend for LocalFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse> {
        let url = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let t0 = std::time::Instant::now();

        let mut rb = self
            .client
            .get(url)
            .timeout(req.timeout().unwrap_or(PAGE_TIMEOUT));
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        let resp = rb.send().await.map_err(|e| Error::Fetch(e.to_string()))?;

        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cap = usize::try_from(req.max_bytes.unwrap_or(u64::MAX)).unwrap_or(usize::MAX);
        let (bytes, truncated) = read_capped(resp, cap).await?;

        tracing::debug!(
            url = %req.url,
            status,
            bytes = bytes.len(),
            truncated,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "page fetched"
        );
        Ok(FetchResponse {
            url: req.url.clone(),
            final_url,
            status,
            content_type,
            bytes,
            truncated,
        })
    }
}
