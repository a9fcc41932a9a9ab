//! Lineage Resolver - typed ancestor search over the ledger
//!
//! Lineage is a tree: every node names at most one parent. Resolving an
//! ancestor is a single upward walk along `parent` references, one ledger
//! lookup per hop, returning the nearest node of the requested stage type.
//!
//! Nodes are immutable once committed, so a walk needs no locks and cannot
//! be invalidated by other stages committing elsewhere in the graph.

use std::collections::HashSet;

use crate::ledger::{ExperimentNode, Ledger};
use crate::registry::StageType;
use crate::{Error, Result};

/// Walks parent references through a ledger.
#[derive(Debug)]
pub struct LineageResolver<'l, L: ?Sized> {
    ledger: &'l L,
}

impl<L: ?Sized> Clone for LineageResolver<'_, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: ?Sized> Copy for LineageResolver<'_, L> {}

impl<'l, L: Ledger + ?Sized> LineageResolver<'l, L> {
    /// Create a resolver reading from `ledger`.
    #[must_use]
    pub const fn new(ledger: &'l L) -> Self {
        Self { ledger }
    }

    /// Nearest node of stage `target`, comparing `start` itself first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LineageNotFound`] if the root is reached without a
    /// match, or [`Error::CorruptLedger`] if the chain is dangling or loops.
    pub async fn resolve(&self, start: &ExperimentNode, target: &StageType) -> Result<ExperimentNode> {
        if start.stage_type() == target {
            return Ok(start.clone());
        }
        self.resolve_strict(start, target).await
    }

    /// Nearest strict ancestor of stage `target`; `start` is never returned.
    ///
    /// # Errors
    ///
    /// Same as [`LineageResolver::resolve`].
    pub async fn resolve_strict(
        &self,
        start: &ExperimentNode,
        target: &StageType,
    ) -> Result<ExperimentNode> {
        let mut visited = HashSet::from([start.id().to_string()]);
        let mut next = start.parent().map(str::to_string);

        while let Some(id) = next {
            let node = self.step(start, &id, &mut visited).await?;
            if node.stage_type() == target {
                tracing::debug!(start = start.id(), target = %target, found = node.id(), "ancestor resolved");
                return Ok(node);
            }
            next = node.parent().map(str::to_string);
        }

        Err(Error::LineageNotFound {
            start: start.id().to_string(),
            target: target.to_string(),
        })
    }

    /// [`LineageResolver::resolve`] starting from a committed node id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not committed, otherwise the
    /// errors of [`LineageResolver::resolve`].
    pub async fn resolve_id(&self, id: &str, target: &StageType) -> Result<ExperimentNode> {
        let start = self.ledger.get_node(id).await?;
        self.resolve(&start, target).await
    }

    /// The full chain from `start` up to its root, `start` first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptLedger`] if the chain is dangling or loops.
    pub async fn lineage(&self, start: &ExperimentNode) -> Result<Vec<ExperimentNode>> {
        let mut visited = HashSet::from([start.id().to_string()]);
        let mut chain = vec![start.clone()];
        let mut next = start.parent().map(str::to_string);

        while let Some(id) = next {
            let node = self.step(start, &id, &mut visited).await?;
            next = node.parent().map(str::to_string);
            chain.push(node);
        }
        Ok(chain)
    }

    async fn step(
        &self,
        start: &ExperimentNode,
        id: &str,
        visited: &mut HashSet<String>,
    ) -> Result<ExperimentNode> {
        if !visited.insert(id.to_string()) {
            return Err(Error::CorruptLedger(format!(
                "lineage of '{}' loops through '{id}'",
                start.id()
            )));
        }
        match self.ledger.get_node(id).await {
            Err(Error::NotFound { .. }) => Err(Error::CorruptLedger(format!(
                "lineage of '{}' references missing node '{id}'",
                start.id()
            ))),
            other => other,
        }
    }
}
