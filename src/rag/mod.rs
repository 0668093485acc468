//! Retrieval-augmented generation context
//!
//! A [`Retriever`] turns the user's words into a short ranked list of
//! reference snippets that the LLM planner can put in its prompt. Retrieval
//! is optional and never fatal to a session.

mod schema;
mod store;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RetrievalError;

pub use schema::SCHEMA_VERSION;
pub use store::{DocumentStore, RagPool, SqliteRetriever, chunk_text, query_terms};

/// One ranked piece of reference text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snippet {
    /// Title of the source document
    pub title: String,
    pub content: String,
    /// Relevance, higher is better
    pub score: f32,
}

/// Looks up reference snippets for a query
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `top_k` snippets, best first
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError` if the store cannot be read
    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<Snippet>, RetrievalError>;
}
