//! Chunk ordering
//!
//! Turns a raw chunk listing into the canonical merge order. Indices are
//! compared as integers, so `f-10` sorts after `f-9`.

use std::collections::BTreeMap;

use super::error::OrderingError;
use super::types::{parse_index, OrderedChunk, OrderingPolicy, CHUNK_INDEX_DELIMITER};

/// Upper bound on missing indices listed in an error
const MAX_REPORTED_MISSING: usize = 32;

/// Orders chunk identifiers by their numeric index suffix
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOrderer {
    policy: OrderingPolicy,
}

impl ChunkOrderer {
    pub fn new(policy: OrderingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.policy
    }

    /// Produce the ascending merge order for one upload's identifiers.
    ///
    /// Strict policy requires exactly `0..N-1`, each once. Best effort
    /// accepts gaps but still rejects two identifiers with the same index
    /// (e.g. `f-1` and `f-01`), since either choice would be arbitrary.
    pub fn order<S: AsRef<str>>(&self, identifiers: &[S]) -> Result<Vec<OrderedChunk>, OrderingError> {
        if identifiers.is_empty() {
            return Err(OrderingError::NoChunksFound);
        }

        let mut by_index: BTreeMap<u64, Vec<&str>> = BTreeMap::new();
        for identifier in identifiers {
            let identifier = identifier.as_ref();
            let index = identifier
                .rsplit_once(CHUNK_INDEX_DELIMITER)
                .and_then(|(_, suffix)| parse_index(suffix))
                .ok_or_else(|| OrderingError::MalformedChunkIndex {
                    identifier: identifier.to_string(),
                })?;
            by_index.entry(index).or_default().push(identifier);
        }

        let duplicates: Vec<u64> = by_index
            .iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(index, _)| *index)
            .collect();

        // BTreeMap is non-empty here
        let highest = by_index.keys().next_back().copied().unwrap_or(0);
        let expected = highest.saturating_add(1);

        let missing: Vec<u64> = match self.policy {
            OrderingPolicy::Strict if by_index.len() as u64 != expected => (0..expected)
                .filter(|i| !by_index.contains_key(i))
                .take(MAX_REPORTED_MISSING)
                .collect(),
            _ => Vec::new(),
        };

        if !missing.is_empty() || !duplicates.is_empty() {
            return Err(OrderingError::IncompleteChunkSet {
                expected,
                missing,
                duplicates,
            });
        }

        Ok(by_index
            .into_iter()
            .filter_map(|(index, mut names)| {
                names.pop().map(|name| OrderedChunk {
                    index,
                    identifier: name.to_string(),
                })
            })
            .collect())
    }
}
