//! Message-id, hash, location, and full-text indexes built on top of the
//! ordered index store, plus the transactional rollback stack used for
//! multi-step imports.

use std::collections::{HashMap, HashSet};

use crate::email_batch::{deserialize_location, CompositeId, COMPOUND_KEY_NS};
use crate::error::{Error, Result};
use crate::index_store::IndexStore;

pub const MESSAGE_ID_NS: &str = "idx.message_id";
pub const WORD_POSTINGS_NS_PREFIX: &str = "idx.word.";
pub const ENVELOPE_METADATA_NS: &str = "idx.envelope_metadata";

const PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '"', '\'', '(', ')', '[', ']', '{', '}', '-', '_', '/', '\\'];

/// Whitespace + fixed punctuation split, lowercase, drop tokens < 3 chars.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || PUNCTUATION.contains(&c))
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() >= 3)
        .collect()
}

#[derive(Debug, Clone)]
pub struct EnvelopeMetadata {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: i64,
    pub size: u64,
}

/// One rollback-capable mutation the writer can undo if a later step in
/// the same import fails.
enum Action {
    IndexPut { namespace: String, key: Vec<u8> },
    PostingAdd { word: String, compound_key: String },
}

/// A single import's rollback stack. Dropped (committed) on success;
/// `rollback()` must be called explicitly on failure — the email block
/// itself is never unwritten (§4.8).
pub struct Transaction<'a> {
    coordinator: &'a IndexCoordinator<'a>,
    actions: Vec<Action>,
}

impl<'a> Transaction<'a> {
    pub fn commit(self) {
        // Dropping the action log is the commit; nothing left to undo.
    }

    pub fn rollback(self) {
        for action in self.actions.into_iter().rev() {
            match action {
                Action::IndexPut { namespace, key } => {
                    self.coordinator.index.delete(&namespace, &key);
                }
                Action::PostingAdd { word, compound_key } => {
                    self.coordinator.remove_posting(&word, &compound_key);
                }
            }
        }
    }
}

/// Wraps an [`IndexStore`] with the specific namespace layout and
/// tokenizer this engine needs.
pub struct IndexCoordinator<'a> {
    index: &'a IndexStore,
}

impl<'a> IndexCoordinator<'a> {
    pub fn new(index: &'a IndexStore) -> Self {
        Self { index }
    }

    pub fn begin(&'a self) -> Transaction<'a> {
        Transaction { coordinator: self, actions: Vec::new() }
    }

    pub fn resolve_location(&self, compound_key: &str) -> Result<CompositeId> {
        let bytes = self
            .index
            .get(COMPOUND_KEY_NS, compound_key.as_bytes())
            .ok_or_else(|| Error::not_found(format!("compound key {compound_key}")))?;
        deserialize_location(&bytes)
    }

    pub fn index_message_id(&self, txn: &mut Transaction<'_>, message_id: &str, compound_key: &str) {
        self.index.put(MESSAGE_ID_NS, message_id.as_bytes().to_vec(), compound_key.as_bytes().to_vec());
        txn.actions.push(Action::IndexPut { namespace: MESSAGE_ID_NS.to_string(), key: message_id.as_bytes().to_vec() });
    }

    pub fn index_envelope_metadata(&self, txn: &mut Transaction<'_>, compound_key: &str, metadata: &EnvelopeMetadata) -> Result<()> {
        let payload = serde_json::to_vec(&(metadata.subject.clone(), metadata.from.clone(), metadata.to.clone(), metadata.date, metadata.size))?;
        self.index.put(ENVELOPE_METADATA_NS, compound_key.as_bytes().to_vec(), payload);
        txn.actions.push(Action::IndexPut { namespace: ENVELOPE_METADATA_NS.to_string(), key: compound_key.as_bytes().to_vec() });
        Ok(())
    }

    /// Index subject + body tokens against `compound_key`.
    pub fn index_full_text(&self, txn: &mut Transaction<'_>, compound_key: &str, subject: &str, body: &str) {
        let mut words: HashSet<String> = HashSet::new();
        words.extend(tokenize(subject));
        words.extend(tokenize(body));
        for word in words {
            self.add_posting(&word, compound_key);
            txn.actions.push(Action::PostingAdd { word, compound_key: compound_key.to_string() });
        }
    }

    fn postings_namespace(word: &str) -> String {
        format!("{WORD_POSTINGS_NS_PREFIX}{word}")
    }

    fn add_posting(&self, word: &str, compound_key: &str) {
        let ns = Self::postings_namespace(word);
        let mut set = self.load_postings(&ns);
        set.insert(compound_key.to_string());
        self.store_postings(&ns, &set);
    }

    fn remove_posting(&self, word: &str, compound_key: &str) {
        let ns = Self::postings_namespace(word);
        let mut set = self.load_postings(&ns);
        set.remove(compound_key);
        self.store_postings(&ns, &set);
    }

    fn load_postings(&self, ns: &str) -> HashSet<String> {
        self.index
            .get(ns, b"set")
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn store_postings(&self, ns: &str, set: &HashSet<String>) {
        if let Ok(bytes) = serde_json::to_vec(set) {
            self.index.put(ns, b"set".to_vec(), bytes);
        }
    }

    /// Look up by message-id (unique).
    pub fn find_by_message_id(&self, message_id: &str) -> Option<String> {
        self.index.get(MESSAGE_ID_NS, message_id.as_bytes()).and_then(|b| String::from_utf8(b).ok())
    }

    /// AND-intersection multi-word search, ranked by term-frequency over
    /// query length.
    pub fn search(&self, query: &str) -> Vec<(String, f64)> {
        let words = tokenize(query);
        if words.is_empty() {
            return Vec::new();
        }
        let mut postings: Vec<HashSet<String>> = words.iter().map(|w| self.load_postings(&Self::postings_namespace(w))).collect();
        postings.sort_by_key(|s| s.len());

        let mut intersection = match postings.first() {
            Some(first) => first.clone(),
            None => return Vec::new(),
        };
        for set in &postings[1..] {
            intersection = intersection.intersection(set).cloned().collect();
        }

        let mut scores: HashMap<String, f64> = HashMap::new();
        for compound_key in intersection {
            let mut matches = 0usize;
            for word in &words {
                let set = self.load_postings(&Self::postings_namespace(word));
                if set.contains(&compound_key) {
                    matches += 1;
                }
            }
            scores.insert(compound_key, matches as f64 / words.len() as f64);
        }
        let mut ranked: Vec<_> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_lowercases_and_drops_short_tokens() {
        let tokens = tokenize("Hi, Re: the Quick-Brown fox!");
        assert!(tokens.contains(&"the".to_string()));
        assert!(tokens.contains(&"quick".to_string()));
        assert!(!tokens.contains(&"hi".to_string()));
        assert!(!tokens.contains(&"re".to_string()));
    }

    #[test]
    fn message_id_lookup_roundtrip() {
        let store = IndexStore::new();
        let coord = IndexCoordinator::new(&store);
        let mut txn = coord.begin();
        coord.index_message_id(&mut txn, "msg-1", "1:0");
        txn.commit();
        assert_eq!(coord.find_by_message_id("msg-1"), Some("1:0".to_string()));
    }

    #[test]
    fn full_text_search_is_intersection() {
        let store = IndexStore::new();
        let coord = IndexCoordinator::new(&store);

        let mut t1 = coord.begin();
        coord.index_full_text(&mut t1, "1:0", "hello world", "");
        t1.commit();

        let mut t2 = coord.begin();
        coord.index_full_text(&mut t2, "1:1", "hello there", "");
        t2.commit();

        let results = coord.search("hello world");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "1:0");
    }

    #[test]
    fn rollback_undoes_postings_and_index_entries() {
        let store = IndexStore::new();
        let coord = IndexCoordinator::new(&store);
        let mut txn = coord.begin();
        coord.index_message_id(&mut txn, "msg-2", "2:0");
        coord.index_full_text(&mut txn, "2:0", "urgent invoice", "");
        txn.rollback();

        assert_eq!(coord.find_by_message_id("msg-2"), None);
        assert!(coord.search("urgent").is_empty());
    }

    #[test]
    fn search_is_case_insensitive() {
        let store = IndexStore::new();
        let coord = IndexCoordinator::new(&store);
        let mut txn = coord.begin();
        coord.index_full_text(&mut txn, "1:0", "Important Meeting", "");
        txn.commit();
        assert_eq!(coord.search("IMPORTANT meeting").len(), 1);
    }
}
