use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CollaboratorError;

/// One web search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, CollaboratorError>;
}

/// Used when no search provider is configured. Generation then proceeds
/// without web context.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSearch;

#[async_trait]
impl WebSearch for DisabledSearch {
    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<SearchHit>, CollaboratorError> {
        warn!(query, "web search disabled, continuing without results");
        Ok(Vec::new())
    }
}
