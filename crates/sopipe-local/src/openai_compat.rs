use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use sopipe_core::{
    ChatChunk, ChatMessage, ChatStream, Error, LanguageModel, MessageContent, Result, Tokenizer,
};

use crate::config::ModelSettings;
use crate::tokens::HeuristicTokenizer;

/// Streaming chat against any `/v1/chat/completions` server (OpenAI, vLLM, llama.cpp, proxies).
#[derive(Clone)]
pub struct OpenAiCompatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    context_length: usize,
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for OpenAiCompatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the api key.
        f.debug_struct("OpenAiCompatModel")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("context_length", &self.context_length)
            .finish()
    }
}

impl OpenAiCompatModel {
    pub fn from_settings(client: reqwest::Client, settings: &ModelSettings) -> Result<Self> {
        let base_url = settings.base_url.clone().ok_or_else(|| {
            Error::NotConfigured(
                "missing model base url (set SOPIPE_OPENAI_COMPAT_BASE_URL or model.base_url)"
                    .to_string(),
            )
        })?;
        let model = settings.model.clone().ok_or_else(|| {
            Error::NotConfigured(
                "missing model name (set SOPIPE_OPENAI_COMPAT_MODEL or model.model)".to_string(),
            )
        })?;
        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key.clone(),
            // Same estimate for every model; the endpoint exposes no tokenizer.
            tokenizer: Arc::new(HeuristicTokenizer),
            model,
            context_length: settings.context_length,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiCompatModel {
    fn model(&self) -> &str {
        &self.model
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        self.tokenizer.clone()
    }

    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream> {
        let req = ChatCompletionsRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Llm(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                service: "chat completions".to_string(),
                status: status.as_u16(),
            });
        }

        Ok(Box::pin(sse_chunks(Box::pin(resp.bytes_stream()))))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Chunk(ChatChunk),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:`/`id:` fields and blank separators.
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let v: serde_json::Value =
        serde_json::from_str(data).map_err(|e| Error::Llm(format!("bad stream event: {e}")))?;
    if let Some(err) = v.get("error") {
        return Err(Error::Llm(format!("stream error: {err}")));
    }
    let content = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .filter(|c| !c.is_null());
    match content {
        Some(c) => {
            let content: MessageContent = serde_json::from_value(c.clone())
                .map_err(|e| Error::Llm(format!("bad delta content: {e}")))?;
            Ok(SseEvent::Chunk(ChatChunk { content }))
        }
        // Role-only or finish_reason-only deltas.
        None => Ok(SseEvent::Skip),
    }
}

struct SseState<S> {
    inner: S,
    buf: Vec<u8>,
    pending: VecDeque<ChatChunk>,
    done: bool,
}

impl<S> SseState<S> {
    /// Parse every complete line in the buffer. Returns true once `[DONE]` is seen.
    fn drain_lines(&mut self, flush: bool) -> Result<bool> {
        loop {
            let line = match self.buf.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    let line: Vec<u8> = self.buf.drain(..=i).collect();
                    line[..line.len() - 1].to_vec()
                }
                None if flush && !self.buf.is_empty() => std::mem::take(&mut self.buf),
                None => return Ok(false),
            };
            match parse_sse_line(&String::from_utf8_lossy(&line))? {
                SseEvent::Chunk(c) => self.pending.push_back(c),
                SseEvent::Done => return Ok(true),
                SseEvent::Skip => {}
            }
        }
    }
}

/// Turn a server-sent-events byte stream into chat chunks, in arrival order.
fn sse_chunks<S, B, E>(inner: S) -> impl Stream<Item = Result<ChatChunk>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = SseState {
        inner,
        buf: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(c) = st.pending.pop_front() {
                return Some((Ok(c), st));
            }
            if st.done {
                return None;
            }
            let (bytes, flush) = match st.inner.next().await {
                Some(Ok(b)) => (Some(b), false),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(Error::Llm(e.to_string())), st));
                }
                None => (None, true),
            };
            if let Some(b) = bytes {
                st.buf.extend_from_slice(b.as_ref());
            }
            match st.drain_lines(flush) {
                Ok(done) => st.done = done || flush,
                Err(e) => {
                    st.done = true;
                    st.pending.clear();
                    return Some((Err(e), st));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sopipe_core::{strip_images, ChatRole};

    fn collect(parts: Vec<&'static str>) -> Vec<Result<ChatChunk>> {
        let inner = futures_util::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<Vec<u8>, std::io::Error>(p.as_bytes().to_vec())),
        );
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(sse_chunks(inner).collect::<Vec<_>>())
    }

    fn texts(out: Vec<Result<ChatChunk>>) -> Vec<String> {
        out.into_iter()
            .map(|r| strip_images(&r.unwrap().content))
            .collect()
    }

    #[test]
    fn parses_deltas_until_done() {
        let out = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        assert_eq!(texts(out), vec!["Hel", "lo"]);
    }

    #[test]
    fn lines_split_across_network_chunks_are_reassembled() {
        let out = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"con",
            "tent\":\"ab\"}}]}\r\n\r\n: keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"cd\"}}]}",
        ]);
        assert_eq!(texts(out), vec!["ab", "cd"]);
    }

    #[test]
    fn image_parts_survive_parsing_for_later_stripping() {
        let out = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":[{\"type\":\"text\",\"text\":\"x\"},{\"type\":\"image_url\",\"image_url\":{\"url\":\"data:\"}}]}}]}\n",
        ]);
        assert_eq!(texts(out), vec!["x"]);
    }

    #[test]
    fn error_event_ends_the_stream_with_an_error() {
        let out = collect(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"error\":{\"message\":\"overloaded\"}}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        ]);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(Error::Llm(_))));
    }

    #[test]
    fn request_body_uses_openai_message_shape() {
        let messages = vec![ChatMessage {
            role: ChatRole::User,
            content: MessageContent::Text("hi".to_string()),
        }];
        let req = ChatCompletionsRequest {
            model: "m",
            messages: &messages,
            stream: true,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })
        );
    }

    #[test]
    fn missing_base_url_is_not_configured() {
        let settings = ModelSettings {
            model: Some("m".to_string()),
            ..ModelSettings::default()
        };
        let err = OpenAiCompatModel::from_settings(reqwest::Client::new(), &settings).unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[test]
    fn every_model_gets_the_char_estimate() {
        for name in ["gpt-4o", "llama-3.1-8b-instruct"] {
            let settings = ModelSettings {
                base_url: Some("http://127.0.0.1:9".to_string()),
                model: Some(name.to_string()),
                ..ModelSettings::default()
            };
            let m = OpenAiCompatModel::from_settings(reqwest::Client::new(), &settings).unwrap();
            assert_eq!(m.tokenizer().count_tokens("abcdefgh"), 2);
            assert_eq!(m.count_tokens("abcdefghi"), 3);
        }
    }

    #[tokio::test]
    async fn rejected_chat_request_reports_the_status() {
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(|| async {
                (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down")
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = ModelSettings {
            base_url: Some(format!("http://{addr}")),
            model: Some("m".to_string()),
            ..ModelSettings::default()
        };
        let m = OpenAiCompatModel::from_settings(reqwest::Client::new(), &settings).unwrap();
        let err = match m.stream_chat(vec![ChatMessage::user("hi")]).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::HttpStatus { status: 429, .. }));
    }
}
