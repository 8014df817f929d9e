//! The durable projection of one in-flight generation: status, the
//! accumulated content/thinking streams, and the event log a reconnecting
//! client replays from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventPhase {
    Start,
    Progress,
    Complete,
    Error,
}

/// One unit of transport-visible output, persisted so a reconnecting
/// client can replay everything it missed rather than re-running the
/// generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    ContentChunk { text: String },
    ThinkingChunk { text: String },
    Status { action: String, description: Option<String> },
    ToolEvent { tool_id: String, phase: ToolEventPhase, payload: Value },
    Done { final_response: Value },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationState {
    pub message_id: String,
    pub generation_id: String,
    pub conversation_id: String,
    pub status: GenerationStatus,
    pub accumulated_content: String,
    pub accumulated_thinking: String,
    pub events: Vec<GenerationEvent>,
    pub final_response: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The `action` of the most recently published `Status` event, so a
    /// reconnecting subscriber can render "currently doing X" without
    /// replaying the whole status history.
    pub current_status: Option<String>,
    /// Token usage, when the terminal `Done` event's metadata carries a
    /// `tokens` field.
    pub tokens: Option<Value>,
}

impl GenerationState {
    pub fn new(
        message_id: impl Into<String>,
        generation_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            generation_id: generation_id.into(),
            conversation_id: conversation_id.into(),
            status: GenerationStatus::Pending,
            accumulated_content: String::new(),
            accumulated_thinking: String::new(),
            events: Vec::new(),
            final_response: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            current_status: None,
            tokens: None,
        }
    }

    /// Fold `event` into the running state: accumulate text, record the
    /// event for replay, and flip status on terminal events.
    pub fn apply(&mut self, event: GenerationEvent) {
        match &event {
            GenerationEvent::ContentChunk { text } => {
                self.status = GenerationStatus::Streaming;
                self.accumulated_content.push_str(text);
            }
            GenerationEvent::ThinkingChunk { text } => {
                self.status = GenerationStatus::Streaming;
                self.accumulated_thinking.push_str(text);
            }
            GenerationEvent::Status { action, .. } => {
                self.current_status = Some(action.clone());
            }
            GenerationEvent::Done { final_response } => {
                self.status = GenerationStatus::Completed;
                self.tokens = final_response.get("tokens").cloned();
                self.final_response = Some(final_response.clone());
                self.completed_at = Some(Utc::now());
            }
            GenerationEvent::Error { message } => {
                self.status = GenerationStatus::Failed;
                self.error = Some(message.clone());
                self.completed_at = Some(Utc::now());
            }
            GenerationEvent::ToolEvent { .. } => {}
        }
        self.events.push(event);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn applying_content_chunks_accumulates_text() {
        let mut state = GenerationState::new("m1", "g1", "c1");
        state.apply(GenerationEvent::ContentChunk { text: "hel".into() });
        state.apply(GenerationEvent::ContentChunk { text: "lo".into() });
        assert_eq!(state.accumulated_content, "hello");
        assert_eq!(state.status, GenerationStatus::Streaming);
    }

    #[test]
    fn done_event_marks_completed_and_is_terminal() {
        let mut state = GenerationState::new("m1", "g1", "c1");
        state.apply(GenerationEvent::Done { final_response: json!({"ok": true}) });
        assert!(state.is_terminal());
        assert_eq!(state.status, GenerationStatus::Completed);
    }

    #[test]
    fn events_are_recorded_in_order_for_replay() {
        let mut state = GenerationState::new("m1", "g1", "c1");
        state.apply(GenerationEvent::ContentChunk { text: "a".into() });
        state.apply(GenerationEvent::ContentChunk { text: "b".into() });
        assert_eq!(state.events.len(), 2);
    }
}
