//! In-memory BM25 keyword index, sharded per owner.
//!
//! Each owner gets an independent inverted index, so a query never touches
//! another owner's postings and writers for different owners never contend.
//! The index is derived state: [`crate::memory::manager::MemoryManager`]
//! rebuilds it from the record store on open.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::memory::types::{MemoryRecord, Scope};
use crate::sync::{read, write};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it", "its",
    "of", "on", "or", "that", "the", "to", "was", "were", "will", "with",
];

/// Split text into lowercase alphanumeric terms, dropping stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Restrictions applied to lexical candidates.
#[derive(Debug, Clone, Default)]
pub struct LexicalFilter {
    pub scope: Option<Scope>,
    /// Every listed tag must be present on the document.
    pub tags: Vec<String>,
}

#[derive(Debug)]
struct Document {
    scope: Scope,
    tags: Vec<String>,
    term_freqs: HashMap<String, u32>,
    len: u32,
}

#[derive(Debug, Default)]
struct Shard {
    docs: HashMap<String, Document>,
    /// term → ids of documents containing it
    postings: HashMap<String, HashSet<String>>,
    total_len: u64,
}

impl Shard {
    fn insert(&mut self, id: &str, doc: Document) {
        self.remove(id);
        for term in doc.term_freqs.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.total_len += u64::from(doc.len);
        self.docs.insert(id.to_string(), doc);
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(doc) = self.docs.remove(id) else {
            return false;
        };
        self.total_len -= u64::from(doc.len);
        for term in doc.term_freqs.keys() {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }

    fn score(&self, terms: &[String], params: Bm25Params, filter: &LexicalFilter) -> HashMap<&str, f64> {
        let n = self.docs.len() as f64;
        let avgdl = if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f64 / n
        };

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in terms {
            let Some(ids) = self.postings.get(term) else {
                continue;
            };
            let df = ids.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();

            for id in ids {
                let Some(doc) = self.docs.get(id) else {
                    continue;
                };
                if filter.scope.is_some_and(|s| s != doc.scope) {
                    continue;
                }
                if !filter.tags.iter().all(|t| doc.tags.contains(t)) {
                    continue;
                }
                let tf = f64::from(doc.term_freqs.get(term).copied().unwrap_or(0));
                let norm = if avgdl > 0.0 {
                    1.0 - params.b + params.b * f64::from(doc.len) / avgdl
                } else {
                    1.0
                };
                let contribution = idf * tf * (params.k1 + 1.0) / (tf + params.k1 * norm);
                *scores.entry(id.as_str()).or_insert(0.0) += contribution;
            }
        }
        scores
    }
}

pub struct LexicalIndex {
    params: Bm25Params,
    shards: RwLock<HashMap<String, Arc<RwLock<Shard>>>>,
}

impl LexicalIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            shards: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, owner: &str) -> Option<Arc<RwLock<Shard>>> {
        read(&self.shards).get(owner).cloned()
    }

    fn shard_or_create(&self, owner: &str) -> Arc<RwLock<Shard>> {
        if let Some(shard) = self.shard(owner) {
            return shard;
        }
        Arc::clone(write(&self.shards).entry(owner.to_string()).or_default())
    }

    /// Index (or re-index) one record. Re-adding an id replaces its postings.
    pub fn add(&self, record: &MemoryRecord) {
        let terms = tokenize(&record.indexable_text());
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for term in &terms {
            *term_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        let doc = Document {
            scope: record.scope,
            tags: record.tags.clone(),
            term_freqs,
            len: terms.len() as u32,
        };
        let shard = self.shard_or_create(&record.owner);
        write(&shard).insert(&record.id, doc);
    }

    /// Remove a record's postings. Returns `false` if it was not indexed.
    pub fn remove(&self, owner: &str, id: &str) -> bool {
        match self.shard(owner) {
            Some(shard) => write(&shard).remove(id),
            None => false,
        }
    }

    /// Top `limit` `(id, score)` pairs for `query`, best first; ties by id.
    pub fn query(&self, owner: &str, query: &str, limit: usize, filter: &LexicalFilter) -> Vec<(String, f64)> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }
        let Some(shard) = self.shard(owner) else {
            return Vec::new();
        };
        let shard = read(&shard);

        let mut hits: Vec<(String, f64)> = shard
            .score(&terms, self.params, filter)
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        hits
    }

    pub fn contains(&self, owner: &str, id: &str) -> bool {
        self.shard(owner)
            .map(|s| read(&s).docs.contains_key(id))
            .unwrap_or(false)
    }

    /// Number of indexed documents for `owner`.
    pub fn len(&self, owner: &str) -> usize {
        self.shard(owner).map(|s| read(&s).docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        read(&self.shards).values().all(|s| read(s).docs.is_empty())
    }

    /// Every indexed `(owner, id)` pair, in no particular order.
    pub fn entries(&self) -> Vec<(String, String)> {
        let shards: Vec<(String, Arc<RwLock<Shard>>)> = read(&self.shards)
            .iter()
            .map(|(owner, shard)| (owner.clone(), Arc::clone(shard)))
            .collect();
        shards
            .into_iter()
            .flat_map(|(owner, shard)| {
                let ids: Vec<String> = read(&shard).docs.keys().cloned().collect();
                ids.into_iter().map(move |id| (owner.clone(), id))
            })
            .collect()
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(owner: &str, id: &str, key: &str, value: &str, tags: &[&str]) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: id.into(),
            owner: owner.into(),
            scope: Scope::Persistent,
            key: key.into(),
            value: value.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            importance: 0.5,
            metadata: serde_json::json!({}),
            embedding_id: None,
            version: 1,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn tokenize_lowercases_and_drops_stopwords() {
        assert_eq!(
            tokenize("The Rust-lang book, and 2024 edition!"),
            vec!["rust", "lang", "book", "2024", "edition"]
        );
        assert!(tokenize("  ,, ").is_empty());
    }

    #[test]
    fn query_ranks_by_term_frequency() {
        let index = LexicalIndex::default();
        index.add(&record("u", "a", "k1", "python python python", &[]));
        index.add(&record("u", "b", "k2", "python once among many other words", &[]));
        index.add(&record("u", "c", "k3", "completely unrelated", &[]));

        let hits = index.query("u", "python", 10, &LexicalFilter::default());
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn owners_are_isolated() {
        let index = LexicalIndex::default();
        index.add(&record("alice", "a", "k", "secret plans", &[]));
        assert!(index.query("bob", "secret", 10, &LexicalFilter::default()).is_empty());
        assert_eq!(index.query("alice", "secret", 10, &LexicalFilter::default()).len(), 1);
    }

    #[test]
    fn readd_replaces_postings() {
        let index = LexicalIndex::default();
        index.add(&record("u", "a", "k", "old words", &[]));
        index.add(&record("u", "a", "k", "new words", &[]));
        assert!(index.query("u", "old", 10, &LexicalFilter::default()).is_empty());
        assert_eq!(index.query("u", "new", 10, &LexicalFilter::default()).len(), 1);
        assert_eq!(index.len("u"), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let index = LexicalIndex::default();
        index.add(&record("u", "a", "k", "text", &[]));
        assert!(index.remove("u", "a"));
        assert!(!index.remove("u", "a"));
        assert!(!index.remove("nobody", "a"));
        assert!(index.query("u", "text", 10, &LexicalFilter::default()).is_empty());
    }

    #[test]
    fn tag_filter_requires_all_tags() {
        let index = LexicalIndex::default();
        index.add(&record("u", "a", "k", "rust tips", &["lang", "rust"]));
        index.add(&record("u", "b", "k2", "rust tips", &["rust"]));
        let filter = LexicalFilter {
            scope: None,
            tags: vec!["lang".into(), "rust".into()],
        };
        let hits = index.query("u", "tips", 10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn ties_break_by_id() {
        let index = LexicalIndex::default();
        index.add(&record("u", "z", "k", "same text", &[]));
        index.add(&record("u", "m", "k", "same text", &[]));
        let hits = index.query("u", "same", 10, &LexicalFilter::default());
        assert_eq!(hits[0].0, "m");
        assert_eq!(hits[1].0, "z");
    }

    #[test]
    fn key_words_are_searchable() {
        let index = LexicalIndex::default();
        index.add(&record("u", "a", "python_tips", "Use type hints", &[]));
        assert_eq!(index.query("u", "tips", 10, &LexicalFilter::default()).len(), 1);
    }
}
