//! A minimal Okapi BM25 scorer over an in-memory inverted index.
//!
//! No crate in the retrieval pack does full-text ranking, so this is written
//! from the textbook formula rather than adapted from a teacher file (see
//! DESIGN.md). Kept deliberately small: one inverted index, one score
//! function, no query parser beyond whitespace/tokenizer splitting.

use std::collections::HashMap;

use crate::tokenizer::tokenize;

const K1: f64 = 1.2;
const B: f64 = 0.75;

#[derive(Debug, Clone)]
struct Document {
    term_freqs: HashMap<String, u32>,
    length: u32,
}

/// An inverted index over documents identified by an opaque `String` id
/// (here, a tool's `prefixed_name`). Single-writer, many-readers per spec
/// §5 — enforced by the caller (`ToolIndex`) taking `&mut self` for writes.
#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    documents: HashMap<String, Document>,
    // term -> set of doc ids containing it, for document frequency + postings
    postings: HashMap<String, HashMap<String, u32>>,
    total_length: u64,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Index (or re-index) a document under `doc_id` with the given text.
    pub fn upsert(&mut self, doc_id: &str, text: &str) {
        self.remove(doc_id);
        let tokens = tokenize(text);
        let mut term_freqs = HashMap::new();
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        let length = tokens.len() as u32;
        for term in term_freqs.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(doc_id.to_string(), term_freqs[term]);
        }
        self.total_length += length as u64;
        self.documents
            .insert(doc_id.to_string(), Document { term_freqs, length });
    }

    pub fn remove(&mut self, doc_id: &str) {
        if let Some(doc) = self.documents.remove(doc_id) {
            self.total_length -= doc.length as u64;
            for term in doc.term_freqs.keys() {
                if let Some(posting) = self.postings.get_mut(term) {
                    posting.remove(doc_id);
                    if posting.is_empty() {
                        self.postings.remove(term);
                    }
                }
            }
        }
    }

    /// Remove every document whose id satisfies `predicate` — used to purge
    /// an entire server's prefix in one pass.
    pub fn remove_where(&mut self, predicate: impl Fn(&str) -> bool) {
        let victims: Vec<String> = self
            .documents
            .keys()
            .filter(|id| predicate(id))
            .cloned()
            .collect();
        for id in victims {
            self.remove(&id);
        }
    }

    fn avg_doc_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.documents.len() as f64;
        let df = self.postings.get(term).map_or(0, HashMap::len) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Score every document against the (already tokenized) query terms.
    /// Returns `(doc_id, score)` pairs for documents matching at least one
    /// term, unsorted — callers sort/limit.
    pub fn score(&self, query_terms: &[String]) -> Vec<(String, f64)> {
        let avgdl = self.avg_doc_length();
        let mut scores: HashMap<String, f64> = HashMap::new();
        for term in query_terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(term);
            for (doc_id, &tf) in posting {
                let doc = &self.documents[doc_id];
                let tf = tf as f64;
                let denom = tf + K1 * (1.0 - B + B * (doc.length as f64 / avgdl.max(1.0)));
                let term_score = idf * (tf * (K1 + 1.0)) / denom.max(f64::EPSILON);
                *scores.entry(doc_id.clone()).or_insert(0.0) += term_score;
            }
        }
        scores.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_term_match_scores_above_unrelated_doc() {
        let mut index = Bm25Index::new();
        index.upsert("a:read_file", "read file contents from disk");
        index.upsert("b:send_email", "send an email message");

        let scores = index.score(&tokenize("read file"));
        let a_score = scores.iter().find(|(id, _)| id == "a:read_file").unwrap().1;
        let b_score = scores.iter().find(|(id, _)| id == "b:send_email");
        assert!(a_score > 0.0);
        assert!(b_score.is_none());
    }

    #[test]
    fn remove_where_purges_server_prefix() {
        let mut index = Bm25Index::new();
        index.upsert("a:one", "one");
        index.upsert("a:two", "two");
        index.upsert("b:three", "three");
        index.remove_where(|id| id.starts_with("a:"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn upsert_overwrites_previous_text() {
        let mut index = Bm25Index::new();
        index.upsert("a:x", "alpha");
        index.upsert("a:x", "beta");
        let scores = index.score(&tokenize("alpha"));
        assert!(scores.is_empty());
        let scores = index.score(&tokenize("beta"));
        assert_eq!(scores.len(), 1);
    }
}
