//! Narrow interfaces to the services workflow steps call out to.

mod content;
mod model;
mod search;

use std::sync::Arc;

pub use content::{
    ContentRepository, InMemoryContentRepository, SqliteContentRepository, StoredSyllabus,
    SyllabusKey,
};
pub use model::{AnthropicModel, LanguageModel, ModelTier};
pub use search::{DisabledSearch, SearchHit, WebSearch};

/// The collaborators shared by every workflow.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn WebSearch>,
    pub content: Arc<dyn ContentRepository>,
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Deterministic collaborators for workflow tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::CollaboratorError;

    type Responder = dyn Fn(&str, ModelTier) -> Result<String, CollaboratorError> + Send + Sync;

    /// Model whose replies are computed from the prompt. Records every prompt.
    pub struct FnModel {
        respond: Box<Responder>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl FnModel {
        pub fn new(
            respond: impl Fn(&str, ModelTier) -> Result<String, CollaboratorError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                prompts: Mutex::new(Vec::new()),
            }
        }

        /// Always answers with `reply`.
        pub fn constant(reply: &str) -> Self {
            let reply = reply.to_string();
            Self::new(move |_, _| Ok(reply.clone()))
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for FnModel {
        async fn complete(&self, prompt: &str, tier: ModelTier) -> Result<String, CollaboratorError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            (self.respond)(prompt, tier)
        }
    }

    /// Search returning a fixed hit list and counting queries.
    #[derive(Default)]
    pub struct StaticSearch {
        pub hits: Vec<SearchHit>,
        pub queries: AtomicUsize,
    }

    impl StaticSearch {
        pub fn with_hits(n: usize) -> Self {
            let hits = (0..n)
                .map(|i| SearchHit {
                    title: format!("Result {i}"),
                    snippet: format!("Snippet {i}"),
                    url: format!("https://example.org/{i}"),
                })
                .collect();
            Self {
                hits,
                queries: AtomicUsize::new(0),
            }
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebSearch for StaticSearch {
        async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<SearchHit>, CollaboratorError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.hits.iter().take(max_results).cloned().collect())
        }
    }

    pub fn collaborators(model: Arc<FnModel>, search: Arc<StaticSearch>) -> Collaborators {
        Collaborators {
            model,
            search,
            content: Arc::new(InMemoryContentRepository::new()),
        }
    }
}
