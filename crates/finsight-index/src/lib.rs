//! Client for the vector-index collaborator used for neighbor search over
//! prior analyses. The index itself is external; this crate only speaks its
//! save/search surface, behind a trait so tests can script the results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// A document written into the index: the expanded question text plus
/// metadata pointing back at the analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDoc {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One search hit, most similar first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub similarity: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Index API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn save(&self, doc: IndexDoc) -> Result<(), IndexError>;

    /// Top-k nearest neighbors at or above `min_similarity`.
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f64,
    ) -> Result<Vec<Neighbor>, IndexError>;
}

/// HTTP implementation against a Chroma-style REST collaborator.
pub struct HttpVectorIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl HttpVectorIndex {
    /// `base_url` should NOT include a trailing slash.
    pub fn new(base_url: String, collection: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            collection,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Neighbor>,
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn save(&self, doc: IndexDoc) -> Result<(), IndexError> {
        let url = format!("{}/collections/{}/documents", self.base_url, self.collection);
        let resp = self.client.post(&url).json(&doc).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "index save failed");
            return Err(IndexError::Api {
                status,
                message: text,
            });
        }
        debug!(doc_id = %doc.id, "document indexed");
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f64,
    ) -> Result<Vec<Neighbor>, IndexError> {
        let url = format!("{}/collections/{}/search", self.base_url, self.collection);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "query": query,
                "top_k": top_k,
                "min_similarity": min_similarity,
            }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(IndexError::Api {
                status,
                message: text,
            });
        }
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| IndexError::Parse(e.to_string()))?;
        // The collaborator is expected to filter, but enforce the floor here
        // too so a lax deployment cannot feed weak neighbors downstream.
        Ok(parsed
            .results
            .into_iter()
            .filter(|n| n.similarity >= min_similarity)
            .collect())
    }
}
