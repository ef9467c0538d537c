//! Long-term memory: keyword-indexed summaries of past turn windows.
//!
//! Every 15 turns the window is compressed into a [`MemoryChunk`] by one
//! generative call. Retrieval is purely local: a keyword set is built from
//! the query and matched against chunk keywords by intersection size.

use crate::executor::{ExecutorError, GenerateRequest, GenerativeBackend, RequestExecutor};
use crate::world::{AppSettings, GameState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Turns per summarized window.
pub const CHUNK_INTERVAL: usize = 15;

/// Maximum chunks returned by a relevance query.
const MAX_RELEVANT: usize = 3;

/// Keyword count requested from the summarizer.
const MIN_KEYWORDS: usize = 5;
const MAX_KEYWORDS: usize = 10;

/// Temperature for summarization: near-deterministic.
const SUMMARY_TEMPERATURE: f32 = 0.3;

/// Words carrying no retrieval signal. Matching is diacritic-sensitive, so
/// accented forms are listed as written.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "with", "that", "this", "from", "into", "about", "what",
    "where", "when", "have", "will", "then", "them", "they", "his", "her", "một", "này", "cho",
    "với", "các", "những", "được", "trong", "tôi", "bạn", "người", "đang", "rồi", "nhưng",
];

/// Errors from chunk creation. Retrieval itself cannot fail.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("summarization call failed: {0}")]
    Executor(#[from] ExecutorError),

    #[error("summary reply unreadable: {0}")]
    Parse(String),
}

/// A compressed, keyword-indexed summary of a contiguous turn range.
/// Immutable once created; keyed deterministically so re-creation after a
/// crash overwrites rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: String,
    pub save_id: String,
    /// 1-based first turn covered.
    pub turn_start: usize,
    /// 1-based last turn covered.
    pub turn_end: usize,
    pub content: String,
    /// Lowercased retrieval keywords.
    pub keywords: Vec<String>,
}

/// Deterministic chunk key from save id and ending turn number.
pub fn chunk_id(save_id: &str, turn_end: usize) -> String {
    format!("{save_id}::{turn_end}")
}

/// True when the turn count sits exactly on a completed window boundary.
pub fn window_complete(turn_count: usize) -> bool {
    turn_count > 0 && turn_count % CHUNK_INTERVAL == 0
}

/// Storage seam for memory chunks: key-value plus the two secondary lookups
/// the index needs. Backed by the host's transactional store in production
/// and by [`InMemoryChunkStore`] in tests.
pub trait ChunkStore: Send + Sync {
    fn get(&self, id: &str) -> Option<MemoryChunk>;
    fn put(&mut self, chunk: MemoryChunk);
    fn delete(&mut self, id: &str);
    fn by_save(&self, save_id: &str) -> Vec<MemoryChunk>;
    fn by_keyword(&self, keyword: &str) -> Vec<MemoryChunk>;
}

/// Simple map-backed chunk store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChunkStore {
    chunks: BTreeMap<String, MemoryChunk>,
}

impl ChunkStore for InMemoryChunkStore {
    fn get(&self, id: &str) -> Option<MemoryChunk> {
        self.chunks.get(id).cloned()
    }

    fn put(&mut self, chunk: MemoryChunk) {
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    fn delete(&mut self, id: &str) {
        self.chunks.remove(id);
    }

    fn by_save(&self, save_id: &str) -> Vec<MemoryChunk> {
        let mut chunks: Vec<MemoryChunk> = self
            .chunks
            .values()
            .filter(|c| c.save_id == save_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.turn_end);
        chunks
    }

    fn by_keyword(&self, keyword: &str) -> Vec<MemoryChunk> {
        let keyword = keyword.to_lowercase();
        let mut chunks: Vec<MemoryChunk> = self
            .chunks
            .values()
            .filter(|c| c.keywords.iter().any(|k| *k == keyword))
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.turn_end);
        chunks
    }
}

/// The source material for one chunk: an owned snapshot so summarization can
/// run detached from the live state.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    pub save_id: String,
    pub turn_start: usize,
    pub turn_end: usize,
    pub stories: Vec<String>,
}

impl ChunkSource {
    /// Capture the most recent completed window, if the turn count sits on a
    /// boundary.
    pub fn from_state(state: &GameState) -> Option<Self> {
        if !window_complete(state.turns.len()) {
            return None;
        }
        let turn_end = state.turns.len();
        let turn_start = turn_end - CHUNK_INTERVAL + 1;
        let stories = state.turns[turn_start - 1..]
            .iter()
            .map(|t| t.summary.clone().unwrap_or_else(|| t.story.clone()))
            .collect();
        Some(Self {
            save_id: state.save_id.clone(),
            turn_start,
            turn_end,
            stories,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChunkSummary {
    summary: String,
    keywords: Vec<String>,
}

/// The long-term memory index over a chunk store.
pub struct MemoryIndex<S> {
    store: S,
}

impl<S: ChunkStore> MemoryIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Summarize one completed window into a chunk and persist it.
    ///
    /// The chunk id is deterministic, so re-running for the same window
    /// overwrites the previous result. Callers in the turn pipeline run this
    /// behind their own error boundary; failures here never reach the user.
    pub async fn create_chunk<B: GenerativeBackend>(
        &mut self,
        source: ChunkSource,
        executor: &mut RequestExecutor<B>,
        app: &AppSettings,
    ) -> Result<MemoryChunk, ChunkError> {
        let chunk = summarize_window(source, executor, app).await?;
        self.store.put(chunk.clone());
        Ok(chunk)
    }

    /// Retrieve up to three chunks relevant to a query, ranked by keyword
    /// overlap. Ties keep chunk order (oldest window first).
    pub fn find_relevant(&self, query: &str, save_id: &str, state: &GameState) -> Vec<MemoryChunk> {
        let chunks = self.store.by_save(save_id);
        if chunks.is_empty() {
            return Vec::new();
        }

        let keywords = query_keywords(query, state);
        if keywords.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, MemoryChunk)> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let overlap = chunk
                    .keywords
                    .iter()
                    .filter(|k| keywords.contains(k.as_str()))
                    .count();
                (overlap > 0).then_some((overlap, chunk))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(MAX_RELEVANT)
            .map(|(_, chunk)| chunk)
            .collect()
    }
}

/// Run the summarization call for one window and build the chunk, without
/// touching any store. Lets background callers work on a detached executor
/// and persist the result under their own brief lock.
pub async fn summarize_window<B: GenerativeBackend>(
    source: ChunkSource,
    executor: &mut RequestExecutor<B>,
    app: &AppSettings,
) -> Result<MemoryChunk, ChunkError> {
    let mut prompt = String::new();
    prompt.push_str(
        "Summarize the following story turns into one compact paragraph, \
         then list the most important retrieval keywords.\n",
    );
    prompt.push_str(&format!(
        "Return JSON: {{\"summary\": string, \"keywords\": [{MIN_KEYWORDS}..{MAX_KEYWORDS} strings]}}\n\n"
    ));
    for (i, story) in source.stories.iter().enumerate() {
        prompt.push_str(&format!("Turn {}: {}\n", source.turn_start + i, story));
    }

    let request = GenerateRequest::new("summarizing recent turns", prompt)
        .with_model(app.model.clone())
        .with_temperature(SUMMARY_TEMPERATURE)
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" },
                "keywords": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["summary", "keywords"]
        }));

    let reply = executor.execute(&request, |_| {}).await?;
    let json = crate::engine::reducer::extract_json(&reply.text);
    let parsed: RawChunkSummary =
        serde_json::from_str(json).map_err(|e| ChunkError::Parse(e.to_string()))?;

    if parsed.summary.trim().is_empty() {
        return Err(ChunkError::Parse("empty summary".to_string()));
    }

    let mut keywords: Vec<String> = parsed
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    keywords.dedup();
    keywords.truncate(MAX_KEYWORDS);
    if keywords.len() < MIN_KEYWORDS {
        tracing::debug!(
            count = keywords.len(),
            "summarizer returned fewer keywords than requested"
        );
    }

    Ok(MemoryChunk {
        id: chunk_id(&source.save_id, source.turn_end),
        save_id: source.save_id,
        turn_start: source.turn_start,
        turn_end: source.turn_end,
        content: parsed.summary,
        keywords,
    })
}

/// Build the keyword set for a query: stop-word-filtered tokens with entity
/// tags stripped, plus any known entity name literally present in the query.
fn query_keywords(query: &str, state: &GameState) -> BTreeSet<String> {
    let stripped = strip_entity_tags(query);
    let mut keywords: BTreeSet<String> = tokenize(&stripped).into_iter().collect();

    let query_lower = query.to_lowercase();
    for (_, name) in state.knowledge_base.all_names() {
        if !name.is_empty() && query_lower.contains(&name.to_lowercase()) {
            keywords.insert(name.to_lowercase());
        }
    }
    if !state.character.name.is_empty()
        && query_lower.contains(&state.character.name.to_lowercase())
    {
        keywords.insert(state.character.name.to_lowercase());
    }

    keywords
}

/// Replace `[TAG:Name]` markers with the bare name.
fn strip_entity_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        match after.find(']') {
            Some(close) => {
                let inner = &after[1..close];
                match inner.split_once(':') {
                    Some((_, name)) => out.push_str(name.trim()),
                    None => out.push_str(&after[..=close]),
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(after);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Lowercase, strip punctuation (Unicode-aware, so diacritics survive),
/// split on whitespace, drop short words and stop words.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .filter(|word| !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}
