//! Generation & streaming pipeline: the `<think>`-tag token transformer,
//! transport batching, and the [`graph_core::steps::StreamSink`]
//! implementation that feeds both into a shared
//! [`graph_checkpoint::GenerationStore`], plus cancellation handles the
//! front door's graph walk selects against.
//!
//! Grounded on `orchestrator/src/executor/streaming.rs`'s
//! started/token/progress/completed event-sender shape (replaced its
//! dedicated `mpsc` channel with direct publishes into the shared
//! generation store, since this system's transport fan-out already lives
//! there) and `executor/retry.rs`'s bounded-wait idiom for the
//! per-stream timeout the front door applies around a node execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use graph_core::steps::{StreamSink, ToolEventPhase as StepToolEventPhase};
use graph_checkpoint::{GenerationEvent, GenerationStore, ToolEventPhase};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const ROLLING_WINDOW: usize = 8;
const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";
const BATCH_BYTES: usize = 10;
const BATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Character-by-character `<think>`/`</think>` extraction with a rolling
/// buffer so a tag split across two stream chunks is still recognized.
struct ThinkingTransformer {
    buffer: String,
    in_thinking: bool,
    thinking_started: bool,
    pending_space: bool,
    leading_whitespace_done: bool,
}

enum TransformedChar {
    Thinking(char),
    Content(char),
    EnteredThinking,
}

impl ThinkingTransformer {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            in_thinking: false,
            thinking_started: false,
            pending_space: false,
            leading_whitespace_done: false,
        }
    }

    fn feed(&mut self, chunk: &str, flush: bool) -> Vec<TransformedChar> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            if self.buffer.is_empty() {
                break;
            }
            if self.buffer.starts_with(OPEN_TAG) {
                self.buffer.drain(..OPEN_TAG.len());
                self.in_thinking = true;
                if !self.thinking_started {
                    self.thinking_started = true;
                    out.push(TransformedChar::EnteredThinking);
                }
                continue;
            }
            if self.buffer.starts_with(CLOSE_TAG) {
                self.buffer.drain(..CLOSE_TAG.len());
                self.in_thinking = false;
                self.pending_space = true;
                continue;
            }
            if !flush && self.buffer.len() < ROLLING_WINDOW && could_be_tag_prefix(&self.buffer) {
                break;
            }

            let ch = self.buffer.chars().next().expect("buffer non-empty");
            self.buffer.drain(..ch.len_utf8());

            if self.in_thinking {
                out.push(TransformedChar::Thinking(ch));
                continue;
            }

            if !self.leading_whitespace_done {
                if ch.is_whitespace() {
                    continue;
                }
                self.leading_whitespace_done = true;
            }
            if self.pending_space {
                self.pending_space = false;
                out.push(TransformedChar::Content(' '));
            }
            out.push(TransformedChar::Content(ch));
        }

        out
    }
}

fn could_be_tag_prefix(buf: &str) -> bool {
    OPEN_TAG.starts_with(buf) || CLOSE_TAG.starts_with(buf)
}

/// One per-`generationId` cancellation handle the front door's graph walk
/// races its node execution against.
pub struct CancelHandle {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self { cancelled: AtomicBool::new(false), notify: Notify::new() })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Waits until [`cancel`](Self::cancel) is called. The `Notified`
    /// future is created before the flag check so a `cancel()` landing
    /// between the check and the await is not missed.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Registers a [`CancelHandle`] per in-flight `generationId`; `abort` is
/// the single external cancellation entry point (`abortStream`).
#[derive(Default)]
pub struct CancellationRegistry {
    handles: DashMap<String, Arc<CancelHandle>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, generation_id: &str) -> Arc<CancelHandle> {
        let handle = CancelHandle::new();
        self.handles.insert(generation_id.to_string(), handle.clone());
        handle
    }

    pub fn release(&self, generation_id: &str) {
        self.handles.remove(generation_id);
    }

    pub fn abort(&self, generation_id: &str) -> bool {
        match self.handles.get(generation_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }
}

struct SinkState {
    transformer: ThinkingTransformer,
    pending: String,
    last_flush: Instant,
}

/// Implements [`StreamSink`] for one in-flight generation: every chunk a
/// step produces runs through the thinking-tag transformer, then is
/// batched (10 bytes or 50ms, whichever comes first) before being
/// published to the shared [`GenerationStore`].
pub struct GenerationSink {
    store: Arc<dyn GenerationStore>,
    generation_id: String,
    state: Mutex<SinkState>,
    flusher: JoinHandle<()>,
}

impl GenerationSink {
    /// Builds the sink and starts its 50ms periodic flush task. The task
    /// holds only a `Weak` reference, so it exits on its own once the
    /// returned `Arc` (and every clone of it) is dropped.
    pub fn new(store: Arc<dyn GenerationStore>, generation_id: impl Into<String>) -> Arc<Self> {
        let generation_id = generation_id.into();
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let flusher = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(BATCH_INTERVAL);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    let Some(sink) = weak.upgrade() else { break };
                    let due = {
                        let state = sink.state.lock();
                        !state.pending.is_empty() && state.last_flush.elapsed() >= BATCH_INTERVAL
                    };
                    if due {
                        sink.flush_pending().await;
                    }
                }
            });
            Self {
                store,
                generation_id,
                state: Mutex::new(SinkState {
                    transformer: ThinkingTransformer::new(),
                    pending: String::new(),
                    last_flush: Instant::now(),
                }),
                flusher,
            }
        })
    }

    async fn flush_pending(&self) {
        let text = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return;
            }
            state.last_flush = Instant::now();
            std::mem::take(&mut state.pending)
        };
        let _ = self.store.publish(&self.generation_id, GenerationEvent::ContentChunk { text }).await;
    }

    /// Flush whatever content remains and stop the periodic flusher. Must
    /// be called once the owning generation finishes, streamed or not.
    pub async fn shutdown(&self) {
        self.flusher.abort();
        self.flush_pending().await;
    }
}

impl Drop for GenerationSink {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

#[async_trait]
impl StreamSink for GenerationSink {
    async fn content_chunk(&self, text: &str) {
        let events = {
            let mut state = self.state.lock();
            state.transformer.feed(text, false)
        };

        for event in events {
            match event {
                TransformedChar::EnteredThinking => {
                    let _ = self
                        .store
                        .publish(&self.generation_id, GenerationEvent::Status { action: "thinking".into(), description: None })
                        .await;
                }
                TransformedChar::Thinking(ch) => {
                    let _ = self
                        .store
                        .publish(&self.generation_id, GenerationEvent::ThinkingChunk { text: ch.to_string() })
                        .await;
                }
                TransformedChar::Content(ch) => {
                    let should_flush = {
                        let mut state = self.state.lock();
                        state.pending.push(ch);
                        state.pending.len() >= BATCH_BYTES
                    };
                    if should_flush {
                        self.flush_pending().await;
                    }
                }
            }
        }
    }

    async fn thinking_chunk(&self, text: &str) {
        let _ = self.store.publish(&self.generation_id, GenerationEvent::ThinkingChunk { text: text.to_string() }).await;
    }

    async fn status(&self, action: &str, description: Option<&str>) {
        let _ = self
            .store
            .publish(&self.generation_id, GenerationEvent::Status { action: action.to_string(), description: description.map(String::from) })
            .await;
    }

    async fn tool_event(&self, tool_id: &str, phase: StepToolEventPhase, payload: serde_json::Value) {
        let phase = match phase {
            StepToolEventPhase::Start => ToolEventPhase::Start,
            StepToolEventPhase::Progress => ToolEventPhase::Progress,
            StepToolEventPhase::Complete => ToolEventPhase::Complete,
            StepToolEventPhase::Error => ToolEventPhase::Error,
        };
        let _ = self
            .store
            .publish(&self.generation_id, GenerationEvent::ToolEvent { tool_id: tool_id.to_string(), phase, payload })
            .await;
    }

    async fn finish(&self) {
        self.shutdown().await;
    }
}

/// Groups a flat, persisted `tool_event` log (one entry per phase) back
/// into one execution record per `toolId`: `start` → `progress…` →
/// `complete`/`error`.
pub fn reconstruct_tool_history(events: &[GenerationEvent]) -> Vec<ToolExecution> {
    use std::collections::HashMap;

    let mut order: Vec<String> = Vec::new();
    let mut by_tool: HashMap<String, ToolExecution> = HashMap::new();

    for event in events {
        let GenerationEvent::ToolEvent { tool_id, phase, payload } = event else { continue };
        let entry = by_tool.entry(tool_id.clone()).or_insert_with(|| {
            order.push(tool_id.clone());
            ToolExecution { tool_id: tool_id.clone(), progress: Vec::new(), outcome: None }
        });
        match phase {
            ToolEventPhase::Start | ToolEventPhase::Progress => entry.progress.push(payload.clone()),
            ToolEventPhase::Complete => entry.outcome = Some(ToolOutcome::Complete(payload.clone())),
            ToolEventPhase::Error => entry.outcome = Some(ToolOutcome::Error(payload.clone())),
        }
    }

    order.into_iter().filter_map(|id| by_tool.remove(&id)).collect()
}

#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub tool_id: String,
    pub progress: Vec<serde_json::Value>,
    pub outcome: Option<ToolOutcome>,
}

#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Complete(serde_json::Value),
    Error(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_checkpoint::InMemoryGenerationStore;

    #[test]
    fn transformer_extracts_thinking_block_and_emits_leading_space() {
        let mut t = ThinkingTransformer::new();
        let events = t.feed("<think>plan</think> answer", true);

        let thinking: String = events
            .iter()
            .filter_map(|e| match e {
                TransformedChar::Thinking(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(thinking, "plan");

        let content: String = events
            .iter()
            .filter_map(|e| match e {
                TransformedChar::Content(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(content, " answer");
    }

    #[test]
    fn transformer_drops_leading_whitespace_outside_thinking() {
        let mut t = ThinkingTransformer::new();
        let events = t.feed("   hello", true);
        let content: String = events
            .iter()
            .filter_map(|e| match e {
                TransformedChar::Content(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(content, "hello");
    }

    #[test]
    fn transformer_holds_back_a_tag_split_across_chunks() {
        let mut t = ThinkingTransformer::new();
        let first = t.feed("before <th", false);
        let content: String = first
            .iter()
            .filter_map(|e| match e {
                TransformedChar::Content(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(content, "before ");

        let second = t.feed("ink>hi</think>done", true);
        let thinking: String = second
            .iter()
            .filter_map(|e| match e {
                TransformedChar::Thinking(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(thinking, "hi");
    }

    #[tokio::test]
    async fn sink_batches_content_and_publishes_at_ten_bytes() {
        let store: Arc<dyn GenerationStore> = Arc::new(InMemoryGenerationStore::new(Duration::from_secs(60)));
        store.create("m1", "g1", "c1").await.unwrap();
        let sink = GenerationSink::new(store.clone(), "g1");

        sink.content_chunk("hello wor").await; // 9 bytes, held back
        let state = store.get_state("g1").await.unwrap();
        assert_eq!(state.accumulated_content, "");

        sink.content_chunk("ld!").await; // crosses the 10-byte threshold
        let state = store.get_state("g1").await.unwrap();
        assert_eq!(state.accumulated_content, "hello worl");

        sink.shutdown().await;
        let state = store.get_state("g1").await.unwrap();
        assert_eq!(state.accumulated_content, "hello world!");
    }

    #[tokio::test]
    async fn sink_extracts_thinking_tags_from_streamed_content() {
        let store: Arc<dyn GenerationStore> = Arc::new(InMemoryGenerationStore::new(Duration::from_secs(60)));
        store.create("m1", "g1", "c1").await.unwrap();
        let sink = GenerationSink::new(store.clone(), "g1");

        sink.content_chunk("<think>reasoning</think>answer").await;
        sink.shutdown().await;

        let state = store.get_state("g1").await.unwrap();
        assert_eq!(state.accumulated_thinking, "reasoning");
        assert_eq!(state.accumulated_content, " answer");
    }

    #[tokio::test]
    async fn abort_marks_the_handle_cancelled() {
        let registry = CancellationRegistry::new();
        let handle = registry.register("g1");
        assert!(!handle.is_cancelled());
        assert!(registry.abort("g1"));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn reconstruct_tool_history_groups_phases_by_tool_id() {
        use serde_json::json;

        let events = vec![
            GenerationEvent::ToolEvent { tool_id: "t1".into(), phase: ToolEventPhase::Start, payload: json!({}) },
            GenerationEvent::ToolEvent { tool_id: "t1".into(), phase: ToolEventPhase::Progress, payload: json!({"p": 1}) },
            GenerationEvent::ToolEvent { tool_id: "t1".into(), phase: ToolEventPhase::Complete, payload: json!({"ok": true}) },
        ];
        let history = reconstruct_tool_history(&events);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tool_id, "t1");
        assert_eq!(history[0].progress.len(), 2);
        assert!(matches!(history[0].outcome, Some(ToolOutcome::Complete(_))));
    }
}
