//! The `so` slash command: search, scrape, fit to the context window, stream the answer.

use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use sopipe_core::{
    strip_images, ChatMessage, ContextSink, Error, Extraction, FetchBackend, LanguageModel,
    Result, SearchProvider, SearchQuery,
};
use tokio::sync::mpsc;

use crate::budget::BudgetAccumulator;
use crate::config::ProxyInfo;
use crate::search::ProxySearchProvider;
use crate::stackoverflow::fetch_source;

pub const COMMAND_NAME: &str = "so";
pub const COMMAND_DESCRIPTION: &str = "Search Stack Overflow";

pub fn instruction_prompt(input: &str) -> String {
    format!(
        "The above sources are excerpts from related StackOverflow questions. Use them to help answer the below question from our user. Provide links to the sources in markdown whenever possible:\n\n{input}\n"
    )
}

/// Everything one invocation needs. Built by the caller per request; nothing is ambient.
pub struct CommandContext {
    pub llm: Arc<dyn LanguageModel>,
    pub input: String,
    pub history: Vec<ChatMessage>,
    pub fetch: Arc<dyn FetchBackend>,
    pub context: Arc<dyn ContextSink>,
}

pub trait SlashCommand: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Start the command. Must be called from within a tokio runtime.
    fn run(&self, ctx: CommandContext) -> SlashOutput;
}

/// Sending half handed to a running command.
pub struct ChunkSender {
    tx: mpsc::Sender<Result<String>>,
}

impl ChunkSender {
    /// Waits until the consumer asks for more. Fails with `Cancelled` once the consumer is gone.
    pub async fn send(&self, chunk: String) -> Result<()> {
        self.tx.send(Ok(chunk)).await.map_err(|_| Error::Cancelled)
    }
}

/// Cloneable cancellation signal for a running command.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    abort: tokio::task::AbortHandle,
}

impl CancelHandle {
    /// Abort the command, dropping any in-flight search, page or model request.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Lazy output of a slash command: text chunks in arrival order, then at most one `Err`.
///
/// Dropping the output cancels the command.
pub struct SlashOutput {
    rx: mpsc::Receiver<Result<String>>,
    abort: tokio::task::AbortHandle,
}

impl SlashOutput {
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(ChunkSender) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // Capacity 1: the producer runs at most one chunk ahead of the consumer.
        let (tx, rx) = mpsc::channel(1);
        let fut = f(ChunkSender { tx: tx.clone() });
        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => {}
                Err(Error::Cancelled) => tracing::debug!("slash command consumer went away"),
                Err(e) => {
                    tracing::warn!(error = %e, "slash command failed");
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Self {
            rx,
            abort: handle.abort_handle(),
        }
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            abort: self.abort.clone(),
        }
    }

    /// Drain the whole output into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(chunk) = self.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for SlashOutput {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for SlashOutput {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// History, then one user turn per accepted source, then the instruction turn.
pub fn build_messages(
    history: Vec<ChatMessage>,
    sources: Vec<String>,
    input: &str,
) -> Vec<ChatMessage> {
    let mut messages = history;
    messages.extend(sources.into_iter().map(ChatMessage::user));
    messages.push(ChatMessage::user(instruction_prompt(input)));
    messages
}

pub struct StackOverflowCommand {
    search: Arc<dyn SearchProvider>,
}

impl StackOverflowCommand {
    pub fn new(search: Arc<dyn SearchProvider>) -> Self {
        Self { search }
    }

    pub fn from_proxy(client: reqwest::Client, proxy: &ProxyInfo) -> Result<Self> {
        Ok(Self::new(Arc::new(ProxySearchProvider::new(client, proxy)?)))
    }
}

impl SlashCommand for StackOverflowCommand {
    fn name(&self) -> &'static str {
        COMMAND_NAME
    }

    fn description(&self) -> &'static str {
        COMMAND_DESCRIPTION
    }

    fn run(&self, ctx: CommandContext) -> SlashOutput {
        let search = self.search.clone();
        SlashOutput::spawn(move |tx| run_pipeline(search, ctx, tx))
    }
}

async fn run_pipeline(
    search: Arc<dyn SearchProvider>,
    ctx: CommandContext,
    tx: ChunkSender,
) -> Result<()> {
    let CommandContext {
        llm,
        input,
        history,
        fetch,
        context,
    } = ctx;

    let found = search.search(&SearchQuery::new(input.clone())).await?;
    let links = found.links();

    let mut budget = BudgetAccumulator::new(llm.tokenizer(), &input, llm.context_length());
    let mut skipped = 0usize;
    for link in &links {
        let Extraction::Found(source) = fetch_source(fetch.as_ref(), link).await? else {
            skipped += 1;
            continue;
        };
        let Some(admission) = budget.admit(&source) else {
            break;
        };
        context.add_context_item(admission.item);
        if admission.is_final {
            break;
        }
    }
    tracing::info!(
        links = links.len(),
        search_provider = %found.provider,
        search_ms = found.elapsed_ms,
        accepted = budget.sources().len(),
        skipped,
        total_tokens = budget.total_tokens(),
        ceiling = budget.ceiling(),
        model = llm.model(),
        "sources gathered"
    );

    let messages = build_messages(history, budget.into_blobs(), &input);
    let mut stream = llm.stream_chat(messages).await?;
    let mut chunks = 0usize;
    while let Some(chunk) = stream.next().await {
        tx.send(strip_images(&chunk?.content)).await?;
        chunks += 1;
    }
    tracing::debug!(chunks, "answer streamed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sopipe_core::{ChatRole, MessageContent};
    use std::time::Duration;

    #[test]
    fn messages_are_history_then_sources_then_instruction() {
        let history = vec![
            ChatMessage::user("earlier question"),
            ChatMessage::assistant("earlier answer"),
        ];
        let msgs = build_messages(
            history,
            vec!["blob 1".to_string(), "blob 2".to_string()],
            "how to reverse a linked list",
        );
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[1].role, ChatRole::Assistant);
        assert_eq!(msgs[2].content, MessageContent::from("blob 1"));
        assert_eq!(msgs[3].content, MessageContent::from("blob 2"));
        assert_eq!(msgs[4].role, ChatRole::User);
        let MessageContent::Text(last) = &msgs[4].content else {
            panic!("instruction turn should be text");
        };
        assert!(last.starts_with("The above sources are excerpts from related StackOverflow"));
        assert!(last.ends_with("\n\nhow to reverse a linked list\n"));
    }

    #[test]
    fn no_sources_still_sends_the_instruction() {
        let msgs = build_messages(Vec::new(), Vec::new(), "q");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, MessageContent::from(instruction_prompt("q")));
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_then_end() {
        let out = SlashOutput::spawn(|tx| async move {
            for s in ["a", "b", "c"] {
                tx.send(s.to_string()).await?;
            }
            Ok(())
        });
        assert_eq!(out.collect_text().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn fatal_error_is_the_last_item() {
        let mut out = SlashOutput::spawn(|tx| async move {
            tx.send("partial".to_string()).await?;
            Err(Error::Search("boom".to_string()))
        });
        assert_eq!(out.next().await.unwrap().unwrap(), "partial");
        assert!(matches!(out.next().await, Some(Err(Error::Search(_)))));
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_ends_a_stalled_command() {
        let mut out = SlashOutput::spawn(|_tx| async move {
            std::future::pending::<()>().await;
            Ok(())
        });
        out.cancel_handle().cancel();
        let next = tokio::time::timeout(Duration::from_secs(2), out.next())
            .await
            .expect("cancelled output should end");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn dropping_the_output_drops_in_flight_work() {
        let (guard_tx, guard_rx) = tokio::sync::oneshot::channel::<()>();
        let out = SlashOutput::spawn(move |_tx| async move {
            // Held until the task is aborted.
            let _guard = guard_tx;
            std::future::pending::<()>().await;
            Ok(())
        });
        tokio::task::yield_now().await;
        drop(out);
        let r = tokio::time::timeout(Duration::from_secs(2), guard_rx)
            .await
            .expect("task should be aborted");
        assert!(r.is_err(), "guard sender dropped without sending");
    }
}
