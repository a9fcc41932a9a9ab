//! Stage Execution Envelope - the protocol every stage driver follows
//!
//! ```text
//! Pending ──exists?──────────────────────────────> Skipped
//!    │
//!    ├─ params / parent / allocation / ancestors ─> Rejected   (no side effects)
//!    ├─ computation fails ────────────────────────> Failed     (ledger untouched)
//!    ├─ commit loses the id race ─────────────────> Failed
//!    └─ commit ───────────────────────────────────> Committed
//! ```
//!
//! All four outcomes are terminal. There are no retries in here; a retry is
//! another `execute` with the same id, which either redoes the work into the
//! same output paths or finds the node committed and skips.

mod command;
mod computation;

pub use command::CommandComputation;
pub use computation::{StageComputation, StageContext};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::allocator::OutputAllocator;
use crate::error::ErrorKind;
use crate::ledger::{ExperimentNode, Ledger, StageParams};
use crate::observability::stage_span;
use crate::registry::{Registry, StageDefinition, StageType};
use crate::resolver::LineageResolver;
use crate::{Error, Result};

/// Exit status for `Committed` and `Skipped`.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status for `Failed`.
pub const EXIT_FAILED: u8 = 1;
/// Exit status for `Rejected`.
pub const EXIT_REJECTED: u8 = 2;
/// Exit status when no stage could run (configuration or storage).
pub const EXIT_FATAL: u8 = 3;

/// State of one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Execution has not reached a terminal state.
    Pending,
    /// A node with this id was already committed.
    Skipped,
    /// Validation failed before any computation.
    Rejected,
    /// Computation or commit failed; retry with the same id is safe.
    Failed,
    /// The node was committed.
    Committed,
}

impl ExecutionState {
    /// True for every state except `Pending`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// True for the states that map to a success exit status.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Skipped | Self::Committed)
    }
}

/// Launch parameters for one stage execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRequest {
    id: String,
    parent: Option<String>,
    stage_type: StageType,
    params: StageParams,
    output_root: PathBuf,
}

impl StageRequest {
    /// Create a request with no parent and no params.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        stage_type: impl Into<StageType>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            parent: None,
            stage_type: stage_type.into(),
            params: StageParams::new(),
            output_root: output_root.into(),
        }
    }

    /// Set the parent node id.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set or clear the parent node id. Empty strings count as absent.
    #[must_use]
    pub fn parent_opt(mut self, parent: Option<String>) -> Self {
        self.parent = parent.filter(|p| !p.is_empty());
        self
    }

    /// Set the parameter payload.
    #[must_use]
    pub fn params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    /// Node id to commit under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parent id supplied by the launcher.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Stage to execute.
    #[must_use]
    pub const fn stage_type(&self) -> &StageType {
        &self.stage_type
    }

    /// Parameter payload.
    #[must_use]
    pub const fn param_map(&self) -> &StageParams {
        &self.params
    }

    /// Output root directory.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

/// Terminal result of one envelope run.
#[derive(Debug)]
pub enum StageOutcome {
    /// The id was already committed; nothing was done.
    Skipped {
        /// Requested id
        id: String,
    },
    /// Validation failed; nothing was written.
    Rejected {
        /// Requested id
        id: String,
        /// Why the request was rejected
        error: Error,
    },
    /// Computation or commit failed; the ledger is unchanged.
    Failed {
        /// Requested id
        id: String,
        /// What failed
        error: Error,
    },
    /// The node was committed.
    Committed(ExperimentNode),
}

impl StageOutcome {
    /// Terminal state of the outcome.
    #[must_use]
    pub const fn state(&self) -> ExecutionState {
        match self {
            Self::Skipped { .. } => ExecutionState::Skipped,
            Self::Rejected { .. } => ExecutionState::Rejected,
            Self::Failed { .. } => ExecutionState::Failed,
            Self::Committed(_) => ExecutionState::Committed,
        }
    }

    /// Process exit status for the outcome.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Skipped { .. } | Self::Committed(_) => EXIT_SUCCESS,
            Self::Failed { .. } => EXIT_FAILED,
            Self::Rejected { .. } => EXIT_REJECTED,
        }
    }

    /// Requested id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Skipped { id } | Self::Rejected { id, .. } | Self::Failed { id, .. } => id,
            Self::Committed(node) => node.id(),
        }
    }

    /// Error behind a `Rejected` or `Failed` outcome.
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        match self {
            Self::Rejected { error, .. } | Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Committed node, if any.
    #[must_use]
    pub const fn node(&self) -> Option<&ExperimentNode> {
        match self {
            Self::Committed(node) => Some(node),
            _ => None,
        }
    }
}

/// Orchestrates one stage execution against a registry and a ledger.
#[derive(Debug)]
pub struct StageEnvelope<'a, L> {
    registry: &'a Registry,
    ledger: &'a L,
}

impl<'a, L: Ledger> StageEnvelope<'a, L> {
    /// Create an envelope over an already loaded registry and open ledger.
    #[must_use]
    pub const fn new(registry: &'a Registry, ledger: &'a L) -> Self {
        Self { registry, ledger }
    }

    /// Run the full protocol for `request`.
    ///
    /// Returns `Ok` with the terminal outcome for every non-fatal path.
    ///
    /// # Errors
    ///
    /// Returns fatal errors only (ledger unavailable or corrupt), which
    /// must stop the process.
    pub async fn execute<C: StageComputation>(
        &self,
        request: StageRequest,
        computation: &C,
    ) -> Result<StageOutcome> {
        let span = stage_span(request.stage_type().as_str(), request.id());
        self.execute_inner(request, computation)
            .instrument(span)
            .await
    }

    async fn execute_inner<C: StageComputation>(
        &self,
        request: StageRequest,
        computation: &C,
    ) -> Result<StageOutcome> {
        let id = request.id().to_string();

        if self.ledger.exists(&id).await.map_err(unavailable)? {
            tracing::info!("experiment already committed, skipping");
            return Ok(StageOutcome::Skipped { id });
        }

        let parent = match self.validate(&request).await {
            Ok(parent) => parent,
            Err(error) => return settle(id, error),
        };

        let outputs = match OutputAllocator::new(self.registry)
            .allocate(request.stage_type().as_str(), request.output_root())
            .await
        {
            Ok(outputs) => outputs,
            Err(error) => return settle(id, error),
        };

        let mut ancestors = BTreeMap::new();
        if let Err(error) = self
            .resolve_ancestors(&id, parent.as_ref(), computation.ancestors(), &mut ancestors)
            .await
        {
            return settle(id, error);
        }

        let ctx = StageContext::new(&request, parent.as_ref(), &ancestors, &outputs);
        if let Err(source) = computation.run(&ctx).await {
            return settle(id, Error::computation(request.stage_type().as_str(), source));
        }

        let node = ExperimentNode::builder(id.clone(), request.stage_type().clone())
            .parent_opt(request.parent_id().map(str::to_string))
            .params(request.param_map().clone())
            .outputs(outputs.to_node_outputs())
            .committed_now()
            .build();

        match self.ledger.create_node(node.clone()).await {
            Ok(()) => {
                tracing::info!(outputs = outputs.len(), "experiment committed");
                Ok(StageOutcome::Committed(node))
            }
            Err(error) => settle(id, error),
        }
    }

    /// Steps 2a-2b: required params, then the parent reference.
    async fn validate(&self, request: &StageRequest) -> Result<Option<ExperimentNode>> {
        let definition = self.registry.get_definition(request.stage_type().as_str())?;
        check_params(definition, request.param_map())?;

        match (definition.required_parent(), request.parent_id()) {
            (None, None) => Ok(None),
            (None, Some(parent)) => Err(Error::UnexpectedParent {
                stage: definition.stage_type().to_string(),
                parent: parent.to_string(),
            }),
            (Some(_), None) => Err(Error::MissingParent {
                stage: definition.stage_type().to_string(),
            }),
            (Some(expected), Some(parent_id)) => {
                let parent = match self.ledger.get_node(parent_id).await {
                    Err(Error::NotFound { .. }) => {
                        return Err(Error::ParentNotFound {
                            parent: parent_id.to_string(),
                        })
                    }
                    other => other?,
                };
                if parent.stage_type() != expected {
                    return Err(Error::ParentTypeMismatch {
                        stage: definition.stage_type().to_string(),
                        parent: parent_id.to_string(),
                        expected: expected.to_string(),
                        actual: parent.stage_type().to_string(),
                    });
                }
                Ok(Some(parent))
            }
        }
    }

    async fn resolve_ancestors(
        &self,
        id: &str,
        parent: Option<&ExperimentNode>,
        targets: Vec<StageType>,
        found: &mut BTreeMap<StageType, ExperimentNode>,
    ) -> Result<()> {
        let resolver = LineageResolver::new(self.ledger);
        for target in targets {
            let Some(parent) = parent else {
                return Err(Error::LineageNotFound {
                    start: id.to_string(),
                    target: target.to_string(),
                });
            };
            let node = resolver.resolve(parent, &target).await?;
            found.insert(target, node);
        }
        Ok(())
    }
}

fn check_params(definition: &StageDefinition, params: &StageParams) -> Result<()> {
    for key in definition.required_params() {
        if !params.contains_key(key) {
            return Err(Error::MissingParameter {
                stage: definition.stage_type().to_string(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

fn unavailable(error: Error) -> Error {
    if error.is_fatal() {
        error
    } else {
        Error::StorageUnavailable(error.to_string())
    }
}

/// Map a non-success error onto its terminal outcome, or escalate it.
fn settle(id: String, error: Error) -> Result<StageOutcome> {
    match error.kind() {
        ErrorKind::Fatal => {
            tracing::error!(error = %error, "fatal ledger error");
            Err(error)
        }
        ErrorKind::Rejected => {
            tracing::warn!(error = %error, "stage rejected");
            Ok(StageOutcome::Rejected { id, error })
        }
        ErrorKind::Failed => {
            tracing::error!(error = %error, "stage failed");
            Ok(StageOutcome::Failed { id, error })
        }
    }
}
