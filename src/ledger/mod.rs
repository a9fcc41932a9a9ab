//! Lineage Ledger - durable, append-only store of committed stage executions
//!
//! Provides:
//! - Atomic create-if-absent commits (exactly one concurrent writer wins)
//! - Point lookup, children lookup and lazy predicate queries
//! - An in-memory backend and a file-backed backend shared across processes
//!
//! # Example
//!
//! ```rust
//! use stage_lineage::ledger::{ExperimentNode, Ledger, MemoryLedger, NodeFilter};
//!
//! # async fn example() -> stage_lineage::Result<()> {
//! let ledger = MemoryLedger::new();
//!
//! ledger.create_node(ExperimentNode::new("e1", "Import")).await?;
//! ledger
//!     .create_node(ExperimentNode::builder("e2", "QC").parent("e1").build())
//!     .await?;
//!
//! assert!(ledger.exists("e1").await?);
//! assert_eq!(ledger.children("e1").await?.len(), 1);
//!
//! let mut cursor = ledger.query(NodeFilter::new().stage("QC")).await?;
//! while let Some(node) = cursor.next().await? {
//!     assert_eq!(node.parent(), Some("e1"));
//! }
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;
mod node;

pub use file::FileLedger;
pub use memory::MemoryLedger;
pub use node::{ExperimentNode, ExperimentNodeBuilder, NodeOutputs, StageParams};

use std::future::Future;

use crate::registry::StageType;
use crate::Result;

/// Ledger of committed experiment nodes.
///
/// Implementations must make [`Ledger::create_node`] linearizable with
/// respect to concurrent callers using the same id. Nodes are never updated
/// or deleted, so readers need no locking beyond what a single lookup takes.
pub trait Ledger: Send + Sync {
    /// Check if a node with this id is committed.
    fn exists(&self, id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Commit a node if its id is not yet taken.
    ///
    /// Fails with `DuplicateId` if the id is present, leaving the stored
    /// node unchanged. The node is either fully visible or not at all.
    fn create_node(&self, node: ExperimentNode) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a node by id.
    ///
    /// Fails with `NotFound` if absent.
    fn get_node(&self, id: &str) -> impl Future<Output = Result<ExperimentNode>> + Send;

    /// Snapshot of all committed ids, in no particular order.
    fn ids(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// All nodes whose parent is `parent_id`, unordered.
    fn children(
        &self,
        parent_id: &str,
    ) -> impl Future<Output = Result<Vec<ExperimentNode>>> + Send {
        async move {
            self.query(NodeFilter::new().parent(parent_id))
                .await?
                .collect()
                .await
        }
    }

    /// Lazily iterate the nodes matching `filter`.
    ///
    /// Each call starts from a fresh snapshot of ids; nodes are fetched as
    /// the cursor advances.
    fn query(&self, filter: NodeFilter) -> impl Future<Output = Result<NodeCursor<'_, Self>>> + Send {
        async move {
            let ids = self.ids().await?;
            Ok(NodeCursor::new(self, ids, filter))
        }
    }
}

/// Predicate over experiment nodes. An empty filter matches every node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFilter {
    stage: Option<StageType>,
    parent: Option<Option<String>>,
    params: Vec<(String, serde_json::Value)>,
}

impl NodeFilter {
    /// Create a filter that matches every node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only nodes of this stage type.
    #[must_use]
    pub fn stage(mut self, stage: impl Into<StageType>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Only direct children of `parent`.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(Some(parent.into()));
        self
    }

    /// Only root nodes.
    #[must_use]
    pub fn roots(mut self) -> Self {
        self.parent = Some(None);
        self
    }

    /// Only nodes whose parameter `key` equals `value`.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.push((key.into(), value));
        self
    }

    /// Evaluate the filter against a node.
    #[must_use]
    pub fn matches(&self, node: &ExperimentNode) -> bool {
        if self.stage.as_ref().is_some_and(|s| s != node.stage_type()) {
            return false;
        }
        if let Some(parent) = &self.parent {
            if parent.as_deref() != node.parent() {
                return false;
            }
        }
        self.params
            .iter()
            .all(|(key, value)| node.params().get(key) == Some(value))
    }
}

/// Lazy, finite cursor over the nodes matching a [`NodeFilter`].
pub struct NodeCursor<'a, L: ?Sized> {
    ledger: &'a L,
    ids: std::vec::IntoIter<String>,
    filter: NodeFilter,
}

impl<'a, L: Ledger + ?Sized> NodeCursor<'a, L> {
    fn new(ledger: &'a L, ids: Vec<String>, filter: NodeFilter) -> Self {
        Self {
            ledger,
            ids: ids.into_iter(),
            filter,
        }
    }

    /// Fetch the next matching node, `None` once the snapshot is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying ledger read fails.
    pub async fn next(&mut self) -> Result<Option<ExperimentNode>> {
        while let Some(id) = self.ids.next() {
            let node = self.ledger.get_node(&id).await?;
            if self.filter.matches(&node) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Drain the cursor into a vector.
    ///
    /// # Errors
    ///
    /// Returns an error if any underlying ledger read fails.
    pub async fn collect(mut self) -> Result<Vec<ExperimentNode>> {
        let mut nodes = Vec::new();
        while let Some(node) = self.next().await? {
            nodes.push(node);
        }
        Ok(nodes)
    }
}
