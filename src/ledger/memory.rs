//! In-memory ledger implementation using `DashMap`.
//!
//! Data is lost on process restart, so this backend only serves tests and
//! single-process pipelines. Cross-process pipelines use [`FileLedger`].
//!
//! [`FileLedger`]: super::FileLedger

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ExperimentNode, Ledger};
use crate::{Error, Result};

/// In-memory ledger using a lock-free concurrent hashmap.
///
/// Create-if-absent goes through the map's entry API, which holds the
/// shard lock for the id while the slot is checked and filled.
///
/// # Example
///
/// ```rust
/// use stage_lineage::ledger::{ExperimentNode, Ledger, MemoryLedger};
///
/// # async fn example() -> stage_lineage::Result<()> {
/// let ledger = MemoryLedger::new();
/// ledger.create_node(ExperimentNode::new("e1", "Import")).await?;
/// assert!(ledger.create_node(ExperimentNode::new("e1", "Import")).await.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryLedger {
    nodes: DashMap<String, ExperimentNode>,
}

impl MemoryLedger {
    /// Create an empty in-memory ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// Create with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: DashMap::with_capacity(capacity),
        }
    }

    /// Get the number of committed nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger for MemoryLedger {
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.nodes.contains_key(id))
    }

    async fn create_node(&self, node: ExperimentNode) -> Result<()> {
        match self.nodes.entry(node.id().to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateId {
                id: node.id().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }

    async fn get_node(&self, id: &str) -> Result<ExperimentNode> {
        self.nodes
            .get(id)
            .map(|n| n.value().clone())
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.nodes.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_get() {
        let ledger = MemoryLedger::new();
        let node = ExperimentNode::new("e1", "Import");

        ledger.create_node(node.clone()).await.unwrap();

        assert_eq!(ledger.get_node("e1").await.unwrap(), node);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let ledger = MemoryLedger::new();
        let err = ledger.get_node("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { id } if id == "missing"));
    }

    #[tokio::test]
    async fn test_duplicate_leaves_original() {
        let ledger = MemoryLedger::new();
        let original = ExperimentNode::new("e1", "Import");
        ledger.create_node(original.clone()).await.unwrap();

        let imposter = ExperimentNode::builder("e1", "QC").parent("e0").build();
        let err = ledger.create_node(imposter).await.unwrap_err();

        assert!(matches!(err, Error::DuplicateId { .. }));
        assert_eq!(ledger.get_node("e1").await.unwrap(), original);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_same_id() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut handles = vec![];

        for i in 0..64 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut params = crate::ledger::StageParams::new();
                params.insert("writer".into(), serde_json::json!(i));
                let node = ExperimentNode::builder("shared", "Import").params(params).build();
                ledger.create_node(node).await.map(|()| i)
            }));
        }

        let mut winners = vec![];
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(i) => winners.push(i),
                Err(Error::DuplicateId { .. }) => duplicates += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(duplicates, 63);
        let stored = ledger.get_node("shared").await.unwrap();
        assert_eq!(stored.params()["writer"], serde_json::json!(winners[0]));
    }

    #[test]
    fn test_default_is_empty() {
        let ledger = MemoryLedger::default();
        assert!(ledger.is_empty());
    }
}
