use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use finsight_llm::{extract_json, send_with_retry, ChatRequest, LlmProvider};

const REUSE_SYSTEM_PROMPT: &str = "\
You are a financial-analysis reuse evaluator. Given a user question and a \
list of existing analyses, decide whether one of them can be re-run with \
different parameters instead of writing a new script.

Reuse is only valid when the core methodology matches and the differences \
are confined to the analysis's declared parameters (symbols, timeframes, \
thresholds). When in doubt, do not reuse.

Respond with exactly this JSON object and nothing else:
{\"should_reuse\": true|false, \"analysis_id\": \"...\", \
\"category\": \"...\", \"new_parameters\": {}, \"reason\": \"...\"}";

const TRANSPORT_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// A vector-index hit joined with the analysis fields the evaluator needs.
#[derive(Debug, Clone)]
pub struct NeighborAnalysis {
    pub analysis_id: String,
    pub title: String,
    pub category: String,
    pub similarity: f64,
    /// The analysis's declared parameter set (names and current values).
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub enum ReuseDecision {
    /// Re-run an existing analysis's script under new parameters.
    Reuse {
        analysis_id: String,
        new_parameters: Map<String, Value>,
    },
    /// Generate a fresh analysis; `reason` is logged and surfaced to ops.
    Generate { reason: String },
}

/// Decides reuse-with-param-change vs. generate-new over index neighbors.
///
/// Never fails a turn: transport errors, unparseable output and inconsistent
/// decisions all collapse to `Generate`, which is always safe — just slower.
pub struct ReuseEvaluator {
    llm: Arc<dyn LlmProvider>,
    model: String,
    similarity_threshold: f64,
}

impl ReuseEvaluator {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>, similarity_threshold: f64) -> Self {
        Self {
            llm,
            model: model.into(),
            similarity_threshold,
        }
    }

    pub async fn evaluate(
        &self,
        expanded_query: &str,
        neighbors: &[NeighborAnalysis],
    ) -> ReuseDecision {
        let candidates: Vec<&NeighborAnalysis> = neighbors
            .iter()
            .filter(|n| n.similarity >= self.similarity_threshold)
            .collect();

        if candidates.is_empty() {
            debug!(
                total = neighbors.len(),
                threshold = self.similarity_threshold,
                "no neighbor clears the similarity threshold"
            );
            return ReuseDecision::Generate {
                reason: "no sufficiently similar prior analysis".to_string(),
            };
        }

        let prompt = build_evaluation_prompt(expanded_query, &candidates);
        let req = ChatRequest::simple(&self.model, REUSE_SYSTEM_PROMPT, prompt);

        let resp = match send_with_retry(self.llm.as_ref(), &req, TRANSPORT_RETRIES, RETRY_BASE_DELAY)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("reuse evaluation failed, generating new: {e}");
                return ReuseDecision::Generate {
                    reason: format!("reuse evaluation failed: {e}"),
                };
            }
        };

        match parse_decision(&resp.content, &candidates) {
            Some(decision) => decision,
            None => {
                warn!("unparseable reuse decision, generating new");
                ReuseDecision::Generate {
                    reason: "failed to parse reuse evaluation response".to_string(),
                }
            }
        }
    }
}

fn build_evaluation_prompt(query: &str, candidates: &[&NeighborAnalysis]) -> String {
    let mut analyses = String::new();
    for (i, c) in candidates.iter().enumerate() {
        analyses.push_str(&format!(
            "{}. id={} title=\"{}\" category={} similarity={:.2}\n   parameters: {}\n",
            i + 1,
            c.analysis_id,
            c.title,
            c.category,
            c.similarity,
            serde_json::to_string(&c.parameters).unwrap_or_default(),
        ));
    }
    format!(
        "USER QUERY: {query}\n\nEXISTING ANALYSES:\n{analyses}\n\
         Decide whether one of these can be reused with new parameters."
    )
}

/// Validate the model's decision against the candidate list: the chosen id
/// must be a real candidate and the categories must line up.
fn parse_decision(content: &str, candidates: &[&NeighborAnalysis]) -> Option<ReuseDecision> {
    let v = extract_json(content)?;
    let should_reuse = v.get("should_reuse")?.as_bool()?;
    if !should_reuse {
        let reason = v
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("evaluator declined reuse")
            .to_string();
        return Some(ReuseDecision::Generate { reason });
    }

    let analysis_id = v.get("analysis_id")?.as_str()?.to_string();
    let chosen = match candidates.iter().find(|c| c.analysis_id == analysis_id) {
        Some(c) => c,
        None => {
            warn!(%analysis_id, "evaluator picked an analysis outside the candidate set");
            return Some(ReuseDecision::Generate {
                reason: "evaluator picked an unknown analysis".to_string(),
            });
        }
    };

    let query_category = v.get("category").and_then(Value::as_str).unwrap_or_default();
    if !query_category.is_empty() && query_category != chosen.category {
        info!(
            query_category,
            neighbor_category = %chosen.category,
            "category mismatch, generating new"
        );
        return Some(ReuseDecision::Generate {
            reason: format!(
                "category mismatch: query is {query_category}, neighbor is {}",
                chosen.category
            ),
        });
    }

    // Only declared parameters may change on reuse.
    let new_parameters = match v.get("new_parameters").and_then(Value::as_object) {
        Some(params) => {
            if params.keys().any(|k| !chosen.parameters.contains_key(k)) {
                return Some(ReuseDecision::Generate {
                    reason: "reuse would change undeclared parameters".to_string(),
                });
            }
            params.clone()
        }
        None => Map::new(),
    };

    Some(ReuseDecision::Reuse {
        analysis_id,
        new_parameters,
    })
}
