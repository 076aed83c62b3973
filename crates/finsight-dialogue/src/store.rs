use std::collections::VecDeque;

use finsight_core::types::{ChatMessage, QueryType, Role};

/// Upper bound on retained turns; older turns age out silently.
pub const MAX_TURNS: usize = 20;

/// One user/assistant exchange as the router sees it.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_query: String,
    /// Self-contained restatement; equals `user_query` for complete queries.
    pub expanded_query: String,
    pub query_type: QueryType,
    /// One-line summary of the analysis outcome, filled at completion.
    pub analysis_summary: Option<String>,
}

/// In-memory projection of a session's recent turns, used for query
/// expansion. Never persisted — rehydrated from chat messages on demand.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    turns: VecDeque<Turn>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn add_turn(&mut self, turn: Turn) {
        if self.turns.len() == MAX_TURNS {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.back()
    }

    /// Attach the analysis outcome to the most recent turn.
    pub fn complete_last_turn(&mut self, summary: impl Into<String>) {
        if let Some(turn) = self.turns.back_mut() {
            turn.analysis_summary = Some(summary.into());
        }
    }

    /// The last `k` turns, oldest first.
    pub fn recent(&self, k: usize) -> Vec<&Turn> {
        let skip = self.turns.len().saturating_sub(k);
        self.turns.iter().skip(skip).collect()
    }

    /// Render the last `k` turns as a context block for the router prompt.
    pub fn render_context(&self, k: usize) -> String {
        let mut out = String::new();
        for (i, turn) in self.recent(k).iter().enumerate() {
            out.push_str(&format!(
                "Turn {}: [{}] user: {}\n  expanded: {}\n",
                i + 1,
                turn.query_type,
                turn.user_query,
                turn.expanded_query
            ));
            if let Some(summary) = &turn.analysis_summary {
                out.push_str(&format!("  result: {summary}\n"));
            }
        }
        out
    }

    /// Fold a session's message tail into turns: each user message opens a
    /// turn, the following assistant message closes it. A trailing user
    /// message without a reply stays as an in-flight turn.
    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        let mut store = Self::new();
        let mut pending: Option<Turn> = None;

        for msg in messages {
            match msg.role {
                Role::User => {
                    if let Some(turn) = pending.take() {
                        store.add_turn(turn);
                    }
                    let user_query = msg
                        .original_question
                        .clone()
                        .unwrap_or_else(|| msg.content.clone());
                    let expanded_query = msg
                        .expanded_question
                        .clone()
                        .unwrap_or_else(|| user_query.clone());
                    pending = Some(Turn {
                        user_query,
                        expanded_query,
                        query_type: msg.query_type.unwrap_or(QueryType::Complete),
                        analysis_summary: None,
                    });
                }
                Role::Assistant => {
                    if let Some(mut turn) = pending.take() {
                        turn.analysis_summary = Some(summarize(&msg.content));
                        store.add_turn(turn);
                    }
                }
                Role::System => {}
            }
        }
        if let Some(turn) = pending.take() {
            store.add_turn(turn);
        }
        store
    }
}

/// First line of an assistant reply, clipped for the context block.
fn summarize(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() > 120 {
        let clipped: String = line.chars().take(120).collect();
        format!("{clipped}…")
    } else {
        line.to_string()
    }
}
