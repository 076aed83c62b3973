use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use finsight_core::types::QueryType;
use finsight_llm::{extract_json, send_with_retry, ChatRequest, LlmProvider};

use crate::error::Result;
use crate::store::ConversationStore;

const ROUTER_SYSTEM_PROMPT: &str = "\
You are a financial-question router. Given recent conversation turns and a \
new user message, classify the message and rewrite it as a fully \
self-contained question.

Query types:
- complete: a full standalone question
- contextual: references prior turns (\"what about QQQ to SPY\")
- comparative: compares against a prior result; keep the prior analysis \
category and swap the operands
- parameter: varies a parameter of the prior question (\"what if 3% instead\")

Respond with exactly this JSON object and nothing else:
{\"query_type\": \"complete|contextual|comparative|parameter\", \
\"expanded_query\": \"...\", \"confidence\": 0.0}";

/// Transient LLM failures are retried inside the call; parse problems get
/// one local re-ask before the heuristic fallback takes over.
const TRANSPORT_RETRIES: u32 = 2;
const PARSE_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Router outcome for one user turn.
#[derive(Debug, Clone)]
pub enum RoutedQuery {
    /// First turn or self-contained; `expanded` equals the user text.
    Complete { expanded: String },
    /// Referents or parameters were inferred from the conversation store.
    Expanded {
        query_type: QueryType,
        expanded: String,
        confidence: f64,
    },
    /// Ambiguous — the dispatcher replies without enqueueing.
    NeedsConfirmation { message: String },
    /// Referential text with no context to resolve it against.
    NeedsClarification { message: String },
}

/// Classifies an incoming turn against the conversation store and expands
/// referential text into a self-contained query.
///
/// Reads only the store passed in — never storage — so it is safe to call
/// from any component.
pub struct ContextRouter {
    llm: Arc<dyn LlmProvider>,
    model: String,
    confidence_low: f64,
    context_turns: usize,
}

impl ContextRouter {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        confidence_low: f64,
        context_turns: usize,
    ) -> Self {
        Self {
            llm,
            model: model.into(),
            confidence_low,
            context_turns,
        }
    }

    pub async fn classify_and_expand(
        &self,
        store: &ConversationStore,
        user_text: &str,
    ) -> Result<RoutedQuery> {
        let user_text = user_text.trim();

        if store.is_empty() {
            if is_referential(user_text) {
                return Ok(RoutedQuery::NeedsClarification {
                    message: "I don't have prior context for that — could you give me the full \
                              question?"
                        .to_string(),
                });
            }
            return Ok(RoutedQuery::Complete {
                expanded: user_text.to_string(),
            });
        }

        let prompt = format!(
            "RECENT CONVERSATION:\n{}\nNEW USER MESSAGE: {user_text}\n\n\
             Classify and expand the new message.",
            store.render_context(self.context_turns)
        );

        for attempt in 0..=PARSE_RETRIES {
            let req = ChatRequest::simple(&self.model, ROUTER_SYSTEM_PROMPT, &prompt);
            let resp =
                send_with_retry(self.llm.as_ref(), &req, TRANSPORT_RETRIES, RETRY_BASE_DELAY)
                    .await?;

            match parse_router_reply(&resp.content) {
                Some((query_type, expanded, confidence)) => {
                    debug!(%query_type, confidence, "router classified turn");
                    return Ok(self.finish(query_type, expanded, confidence, user_text));
                }
                None => {
                    warn!(attempt, "router reply was not valid JSON, re-asking");
                }
            }
        }

        // The model never produced a usable structure; fall back to the
        // heuristic classifier rather than failing the turn.
        warn!("router fell back to heuristic classification");
        if is_referential(user_text) {
            Ok(RoutedQuery::NeedsConfirmation {
                message: format!(
                    "I couldn't confidently interpret \"{user_text}\" from our conversation — \
                     could you restate it as a full question?"
                ),
            })
        } else {
            Ok(RoutedQuery::Complete {
                expanded: user_text.to_string(),
            })
        }
    }

    fn finish(
        &self,
        query_type: QueryType,
        expanded: String,
        confidence: f64,
        user_text: &str,
    ) -> RoutedQuery {
        if query_type == QueryType::Complete {
            // Self-contained: the user's own words are authoritative.
            return RoutedQuery::Complete {
                expanded: user_text.to_string(),
            };
        }

        if confidence < self.confidence_low {
            return RoutedQuery::NeedsConfirmation {
                message: format!("Did you mean: \"{expanded}\"?"),
            };
        }

        // The new utterance's numbers win over whatever the expansion kept.
        let expanded = if query_type == QueryType::Parameter {
            override_numeric_tokens(&expanded, user_text)
        } else {
            expanded
        };

        RoutedQuery::Expanded {
            query_type,
            expanded,
            confidence,
        }
    }
}

fn parse_router_reply(content: &str) -> Option<(QueryType, String, f64)> {
    let v = extract_json(content)?;
    let query_type: QueryType = v.get("query_type")?.as_str()?.parse().ok()?;
    let expanded = v.get("expanded_query")?.as_str()?.to_string();
    let confidence = v.get("confidence")?.as_f64()?;
    if !(0.0..=1.0).contains(&confidence) {
        return None;
    }
    Some((query_type, expanded, confidence))
}

/// Cheap referential check used when no LM classification is available.
/// Catches the follow-up phrasings the corpus actually produces.
fn is_referential(text: &str) -> bool {
    let lower = text.to_lowercase();
    const PREFIXES: &[&str] = &[
        "what about",
        "how about",
        "what if",
        "try with",
        "try ",
        "and ",
        "also ",
        "same ",
        "now ",
    ];
    if PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return true;
    }
    lower.contains(" instead") || lower.starts_with("that ") || lower == "that"
}

/// Replace the expansion's numeric tokens pairwise with those from the new
/// utterance. Extra numbers on either side are left alone.
fn override_numeric_tokens(expanded: &str, user_text: &str) -> String {
    let user_numbers = numeric_tokens(user_text);
    if user_numbers.is_empty() {
        return expanded.to_string();
    }

    let mut out = String::with_capacity(expanded.len());
    let mut replaced = 0usize;
    let mut chars = expanded.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            let mut token = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() || next == '.' || next == '%' {
                    token.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if replaced < user_numbers.len() {
                out.push_str(&user_numbers[replaced]);
                replaced += 1;
            } else {
                out.push_str(&token);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Numeric tokens (digits with optional decimal point and % suffix).
fn numeric_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            let mut token = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() || next == '.' || next == '%' {
                    token.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(token);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finsight_llm::{ChatResponse, ProviderError};
    use std::sync::Mutex;

    /// Returns scripted replies in order, then repeats the last one.
    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            _req: &ChatRequest,
        ) -> std::result::Result<ChatResponse, ProviderError> {
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.len() > 1 {
                replies.pop().unwrap()
            } else {
                replies.last().cloned().unwrap_or_default()
            };
            Ok(ChatResponse {
                content,
                model: "scripted".into(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: "stop".into(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn router(llm: Arc<dyn LlmProvider>) -> ContextRouter {
        ContextRouter::new(llm, "scripted", 0.5, 5)
    }

    fn store_with_turn() -> ConversationStore {
        let mut store = ConversationStore::new();
        store.add_turn(crate::store::Turn {
            user_query: "What are the top 5 most volatile stocks this month?".into(),
            expanded_query: "What are the top 5 most volatile stocks this month?".into(),
            query_type: QueryType::Complete,
            analysis_summary: Some("top5 volatility computed".into()),
        });
        store
    }

    #[tokio::test]
    async fn first_turn_is_complete_without_llm() {
        let llm = ScriptedLlm::new(&["should never be called"]);
        let r = router(llm);
        let routed = r
            .classify_and_expand(&ConversationStore::new(), "What are the top 5 volatile stocks?")
            .await
            .unwrap();
        match routed {
            RoutedQuery::Complete { expanded } => {
                assert_eq!(expanded, "What are the top 5 volatile stocks?")
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn referential_text_in_empty_session_needs_clarification() {
        let llm = ScriptedLlm::new(&["unused"]);
        let r = router(llm);
        let routed = r
            .classify_and_expand(&ConversationStore::new(), "what about QQQ")
            .await
            .unwrap();
        assert!(matches!(routed, RoutedQuery::NeedsClarification { .. }));
    }

    #[tokio::test]
    async fn contextual_turn_is_expanded() {
        let llm = ScriptedLlm::new(&[
            r#"{"query_type": "contextual", "expanded_query": "What are the top 5 most volatile stocks this month for QQQ holdings?", "confidence": 0.85}"#,
        ]);
        let r = router(llm);
        let routed = r
            .classify_and_expand(&store_with_turn(), "what about QQQ holdings")
            .await
            .unwrap();
        match routed {
            RoutedQuery::Expanded {
                query_type,
                expanded,
                confidence,
            } => {
                assert_eq!(query_type, QueryType::Contextual);
                assert!(expanded.contains("QQQ holdings"));
                assert!((confidence - 0.85).abs() < 1e-9);
            }
            other => panic!("expected Expanded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn low_confidence_downgrades_to_confirmation() {
        let llm = ScriptedLlm::new(&[
            r#"{"query_type": "comparative", "expanded_query": "Compare X to Y", "confidence": 0.3}"#,
        ]);
        let r = router(llm);
        let routed = r
            .classify_and_expand(&store_with_turn(), "how does that compare")
            .await
            .unwrap();
        assert!(matches!(routed, RoutedQuery::NeedsConfirmation { .. }));
    }

    #[tokio::test]
    async fn parameter_turn_takes_numbers_from_the_new_utterance() {
        // The expansion kept the old 2%; the user said 3%.
        let llm = ScriptedLlm::new(&[
            r#"{"query_type": "parameter", "expanded_query": "Buy QQQ when monthly return goes below -2%", "confidence": 0.9}"#,
        ]);
        let r = router(llm);
        let routed = r
            .classify_and_expand(&store_with_turn(), "what if 3% instead")
            .await
            .unwrap();
        match routed {
            RoutedQuery::Expanded { expanded, .. } => {
                assert_eq!(expanded, "Buy QQQ when monthly return goes below -3%");
            }
            other => panic!("expected Expanded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_replies_re_ask_then_fall_back() {
        let llm = ScriptedLlm::new(&[
            "not json",
            "still not json",
            r#"{"query_type": "contextual", "expanded_query": "resolved on third try", "confidence": 0.8}"#,
        ]);
        let r = router(llm);
        let routed = r
            .classify_and_expand(&store_with_turn(), "and for SPY")
            .await
            .unwrap();
        match routed {
            RoutedQuery::Expanded { expanded, .. } => assert_eq!(expanded, "resolved on third try"),
            other => panic!("expected Expanded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistent_garbage_falls_back_to_heuristics() {
        let llm = ScriptedLlm::new(&["garbage"]);
        let r = router(llm);
        // Referential wording → confirmation rather than silently running a
        // query the router never understood.
        let routed = r
            .classify_and_expand(&store_with_turn(), "what about TSLA")
            .await
            .unwrap();
        assert!(matches!(routed, RoutedQuery::NeedsConfirmation { .. }));
    }

    #[test]
    fn numeric_override_is_pairwise() {
        assert_eq!(
            override_numeric_tokens("below -2% over 6 months", "what if 3% over 12 months"),
            "below -3% over 12 months"
        );
        assert_eq!(override_numeric_tokens("no numbers here", "also none"), "no numbers here");
        // Fewer user numbers than expansion numbers: the tail is kept.
        assert_eq!(
            override_numeric_tokens("between 5% and 10%", "make it 7%"),
            "between 7% and 10%"
        );
    }
}
