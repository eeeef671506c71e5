use std::time::Instant;
use sopipe_core::{Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};

use crate::config::ProxyInfo;

/// Appended to every query so the backend only returns Stack Overflow pages.
pub const SITE_FILTER: &str = " site:stackoverflow.com";

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000)
}

/// Search through the proxy's `/search` endpoint (Serper-style `organic` results).
#[derive(Debug, Clone)]
pub struct ProxySearchProvider {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl ProxySearchProvider {
    pub fn new(client: reqwest::Client, proxy: &ProxyInfo) -> Result<Self> {
        let endpoint = proxy
            .proxy_url
            .join("search")
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    pub fn restricted_query(query: &str) -> String {
        format!("{query}{SITE_FILTER}")
    }
}

/// Map a raw proxy response body to links, keeping backend order.
pub(crate) fn parse_organic(body: &str) -> Result<Vec<SearchResult>> {
    let v: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("search response is not json: {e}")))?;
    let organic = v
        .get("organic")
        .and_then(|o| o.as_array())
        .ok_or_else(|| {
            Error::MalformedResponse("search response has no `organic` array".to_string())
        })?;

    let mut out = Vec::with_capacity(organic.len());
    for (i, r) in organic.iter().enumerate() {
        match r.get("link").and_then(|l| l.as_str()) {
            Some(link) => out.push(SearchResult {
                link: link.to_string(),
            }),
            None => tracing::debug!(index = i, "organic result without link; skipped"),
        }
    }
    Ok(out)
}

#[async_trait::async_trait]
impl SearchProvider for ProxySearchProvider {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let t0 = Instant::now();
        let timeout_ms = timeout_ms_from_query(q);
        let body = serde_json::json!({ "q": Self::restricted_query(&q.query) });

        let resp = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                service: "search proxy".to_string(),
                status: status.as_u16(),
            });
        }

        let text = resp.text().await.map_err(|e| Error::Search(e.to_string()))?;
        let results = parse_organic(&text)?;

        let elapsed_ms = t0.elapsed().as_millis() as u64;
        tracing::info!(
            endpoint = %self.endpoint,
            results = results.len(),
            elapsed_ms,
            "search dispatched"
        );

        Ok(SearchResponse {
            results,
            provider: "proxy".to_string(),
            elapsed_ms,
        })
    }
}
