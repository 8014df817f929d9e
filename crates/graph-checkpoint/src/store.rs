//! Shared generation store: a TTL-bounded map of in-flight generations,
//! each with a broadcast channel new subscribers fan out from so a
//! reconnecting client gets both the replayed history and live events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};

use crate::error::{CheckpointError, Result};
use crate::state::{GenerationEvent, GenerationState};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait GenerationStore: Send + Sync {
    async fn create(&self, message_id: &str, generation_id: &str, conversation_id: &str) -> Result<()>;
    async fn publish(&self, generation_id: &str, event: GenerationEvent) -> Result<()>;
    async fn get_state(&self, generation_id: &str) -> Result<GenerationState>;
    /// Replay everything recorded so far, then continue streaming live
    /// events until the generation reaches a terminal state.
    async fn subscribe(&self, generation_id: &str) -> Result<ReplaySubscription>;
}

pub struct ReplaySubscription {
    pub backlog: Vec<GenerationEvent>,
    pub live: broadcast::Receiver<GenerationEvent>,
}

struct Entry {
    state: RwLock<GenerationState>,
    sender: broadcast::Sender<GenerationEvent>,
    last_touched: RwLock<Instant>,
}

/// In-memory, per-process implementation. Production deployments behind a
/// durable cache (Redis, etc.) implement the same trait; the orchestrator
/// depends only on [`GenerationStore`].
pub struct InMemoryGenerationStore {
    entries: DashMap<String, Arc<Entry>>,
    ttl: Duration,
}

impl InMemoryGenerationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn entry(&self, generation_id: &str) -> Result<Arc<Entry>> {
        self.entries
            .get(generation_id)
            .map(|e| e.clone())
            .ok_or_else(|| CheckpointError::NotFound(generation_id.to_string()))
    }

    /// Remove generations untouched for longer than `ttl`. Intended to be
    /// called from a periodic background task.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| {
            let last = entry.last_touched.try_read().map(|g| *g).unwrap_or(now);
            now.duration_since(last) < ttl
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl GenerationStore for InMemoryGenerationStore {
    async fn create(&self, message_id: &str, generation_id: &str, conversation_id: &str) -> Result<()> {
        if self.entries.contains_key(generation_id) {
            return Err(CheckpointError::AlreadyExists(generation_id.to_string()));
        }
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        let entry = Arc::new(Entry {
            state: RwLock::new(GenerationState::new(message_id, generation_id, conversation_id)),
            sender,
            last_touched: RwLock::new(Instant::now()),
        });
        self.entries.insert(generation_id.to_string(), entry);
        Ok(())
    }

    async fn publish(&self, generation_id: &str, event: GenerationEvent) -> Result<()> {
        let entry = self.entry(generation_id)?;
        {
            let mut state = entry.state.write().await;
            state.apply(event.clone());
        }
        *entry.last_touched.write().await = Instant::now();
        // Subscribers may have dropped without unsubscribing; that's fine,
        // the event is still durably recorded in `state.events`.
        let _ = entry.sender.send(event);
        Ok(())
    }

    async fn get_state(&self, generation_id: &str) -> Result<GenerationState> {
        let entry = self.entry(generation_id)?;
        let state = entry.state.read().await.clone();
        Ok(state)
    }

    async fn subscribe(&self, generation_id: &str) -> Result<ReplaySubscription> {
        let entry = self.entry(generation_id)?;
        let live = entry.sender.subscribe();
        let backlog = entry.state.read().await.events.clone();
        Ok(ReplaySubscription { backlog, live })
    }
}

/// Drive [`InMemoryGenerationStore::sweep_expired`] on an interval until
/// the store is dropped.
pub async fn run_ttl_sweeper(store: Arc<InMemoryGenerationStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        store.sweep_expired();
    }
}
