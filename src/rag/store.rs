//! `SQLite` document store with keyword ranking

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use super::{Retriever, Snippet, schema};
use crate::error::RetrievalError;
use crate::{Error, Result};

/// Connection pool for the retrieval store
pub type RagPool = Pool<SqliteConnectionManager>;

/// File name of the store inside the configured directory
const DATABASE_FILE: &str = "documents.sqlite";

/// Longest chunk stored, in characters
const MAX_CHUNK_CHARS: usize = 600;

/// Rows pulled from `SQLite` before ranking
const CANDIDATE_LIMIT: usize = 200;

/// Words too common to rank on
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
    "out", "has", "have", "had", "this", "that", "with", "what", "when", "where", "who", "why",
    "how", "does", "did", "about", "tell", "from", "your", "its", "into", "there", "their",
    "they", "them", "then", "than", "please", "could", "would", "should", "is", "me",
];

/// Documents split into chunks for keyword search
#[derive(Clone)]
pub struct DocumentStore {
    pool: RagPool,
}

impl DocumentStore {
    /// Open or create the store in `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory or database cannot be opened
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DATABASE_FILE);
        let manager = SqliteConnectionManager::file(&path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;
        Self::init(pool, &path.display().to_string())
    }

    /// Open an in-memory store (for testing)
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be initialized
    pub fn open_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;
        Self::init(pool, ":memory:")
    }

    fn init(pool: RagPool, location: &str) -> Result<Self> {
        let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
        schema::init(&conn)?;
        drop(conn);
        tracing::info!(
            location,
            version = schema::SCHEMA_VERSION,
            "retrieval store initialized"
        );
        Ok(Self { pool })
    }

    /// Store a document, split into chunks
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails
    pub fn add_document(&self, title: &str, content: &str) -> Result<i64> {
        let mut conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (title, created_at) VALUES (?1, ?2)",
            params![title, chrono::Utc::now().to_rfc3339()],
        )?;
        let document_id = tx.last_insert_rowid();

        let chunks = chunk_text(content, MAX_CHUNK_CHARS);
        for (position, chunk) in chunks.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            let position = position as i64;
            tx.execute(
                "INSERT INTO chunks (document_id, position, content) VALUES (?1, ?2, ?3)",
                params![document_id, position, chunk],
            )?;
        }
        tx.commit()?;

        tracing::debug!(document_id, title, chunks = chunks.len(), "document stored");
        Ok(document_id)
    }

    /// Number of stored documents
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn document_count(&self) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Rank chunks against `text` and return the best `top_k`
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    pub fn search(&self, text: &str, top_k: usize) -> Result<Vec<Snippet>> {
        let terms = query_terms(text);
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let filter = (1..=terms.len())
            .map(|i| format!("c.content LIKE ?{i}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT d.title, c.content FROM chunks c \
             JOIN documents d ON d.id = c.document_id \
             WHERE {filter} ORDER BY c.id LIMIT {CANDIDATE_LIMIT}"
        );
        let patterns: Vec<String> = terms.iter().map(|t| format!("%{t}%")).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(patterns.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut snippets = Vec::new();
        for row in rows {
            let (title, content) = row?;
            let score = score_chunk(&terms, &title, &content);
            if score > 0.0 {
                snippets.push(Snippet {
                    title,
                    content,
                    score,
                });
            }
        }

        snippets.sort_by(|a, b| b.score.total_cmp(&a.score));
        snippets.truncate(top_k);
        Ok(snippets)
    }
}

/// Async [`Retriever`] over a [`DocumentStore`]
pub struct SqliteRetriever {
    store: Arc<DocumentStore>,
}

impl SqliteRetriever {
    #[must_use]
    pub fn new(store: DocumentStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Open the store in `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self::new(DocumentStore::open(dir)?))
    }
}

#[async_trait]
impl Retriever for SqliteRetriever {
    async fn search(&self, text: &str, top_k: usize) -> std::result::Result<Vec<Snippet>, RetrievalError> {
        let store = Arc::clone(&self.store);
        let text = text.to_string();
        let snippets = tokio::task::spawn_blocking(move || store.search(&text, top_k))
            .await
            .map_err(|e| RetrievalError::StoreUnavailable(e.to_string()))?
            .map_err(|e| RetrievalError::StoreUnavailable(e.to_string()))?;
        tracing::debug!(results = snippets.len(), "retrieval complete");
        Ok(snippets)
    }
}

/// Lower-cased search terms with stopwords and short words removed
#[must_use]
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(w))
    {
        if !terms.iter().any(|t| t == word) {
            terms.push(word.to_string());
        }
    }
    terms
}

/// Split text into paragraph-bounded chunks of at most `max_chars`
#[must_use]
pub fn chunk_text(content: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    let paragraphs = content
        .split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty());

    for paragraph in paragraphs {
        for piece in split_long(&paragraph, max_chars) {
            if !current.is_empty() && current.len() + 1 + piece.len() > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    if paragraph.len() <= max_chars {
        return vec![paragraph.to_string()];
    }
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in paragraph.split(' ') {
        if !current.is_empty() && current.len() + 1 + word.len() > max_chars {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Term coverage, plus a little for repeated hits and title matches
#[allow(clippy::cast_precision_loss)]
fn score_chunk(terms: &[String], title: &str, content: &str) -> f32 {
    let content = content.to_lowercase();
    let title = title.to_lowercase();
    let mut matched = 0_usize;
    let mut hits = 0_usize;
    let mut title_hits = 0_usize;
    for term in terms {
        let count = content.matches(term.as_str()).count();
        if count > 0 {
            matched += 1;
            hits += count;
        }
        if title.contains(term.as_str()) {
            title_hits += 1;
        }
    }
    if matched == 0 {
        return 0.0;
    }
    let n = terms.len() as f32;
    let coverage = matched as f32 / n;
    let density = (hits as f32).ln_1p() / 10.0;
    let title_bonus = 0.2 * title_hits as f32 / n;
    coverage + density + title_bonus
}
