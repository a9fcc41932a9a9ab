//! External computation seam

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use super::StageRequest;
use crate::allocator::ResolvedOutputSet;
use crate::ledger::{ExperimentNode, StageParams};
use crate::registry::StageType;
use crate::{Error, Result};

/// The opaque work a stage performs.
///
/// Implementations read their inputs from the parent and ancestor outputs,
/// write every allocated output path, and return an error on failure.
/// Partially written files are left in place; a retry overwrites them.
pub trait StageComputation: Send + Sync {
    /// Non-immediate ancestor stage types the computation needs resolved.
    fn ancestors(&self) -> Vec<StageType> {
        Vec::new()
    }

    /// Run the computation.
    fn run(&self, ctx: &StageContext<'_>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Everything a computation may read, assembled by the envelope.
#[derive(Debug)]
pub struct StageContext<'a> {
    request: &'a StageRequest,
    parent: Option<&'a ExperimentNode>,
    ancestors: &'a BTreeMap<StageType, ExperimentNode>,
    outputs: &'a ResolvedOutputSet,
}

impl<'a> StageContext<'a> {
    pub(crate) const fn new(
        request: &'a StageRequest,
        parent: Option<&'a ExperimentNode>,
        ancestors: &'a BTreeMap<StageType, ExperimentNode>,
        outputs: &'a ResolvedOutputSet,
    ) -> Self {
        Self {
            request,
            parent,
            ancestors,
            outputs,
        }
    }

    /// Id the node will be committed under.
    #[must_use]
    pub fn id(&self) -> &str {
        self.request.id()
    }

    /// Stage being executed.
    #[must_use]
    pub const fn stage_type(&self) -> &StageType {
        self.request.stage_type()
    }

    /// Validated parameter payload.
    #[must_use]
    pub const fn params(&self) -> &StageParams {
        self.request.param_map()
    }

    /// Deserialize the parameter `key` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingParameter`] if absent or
    /// [`Error::InvalidParameter`] if it has the wrong shape.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .params()
            .get(key)
            .ok_or_else(|| Error::MissingParameter {
                stage: self.stage_type().to_string(),
                key: key.to_string(),
            })?;
        serde_json::from_value(value.clone()).map_err(|e| Error::InvalidParameter {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Parent node, `None` for root stages.
    #[must_use]
    pub const fn parent(&self) -> Option<&ExperimentNode> {
        self.parent
    }

    /// Parent's data outputs, the stage's primary inputs.
    #[must_use]
    pub fn input_paths(&self) -> Vec<PathBuf> {
        self.parent
            .map(|p| p.outputs().data.clone())
            .unwrap_or_default()
    }

    /// Resolved ancestor of stage `stage`, if it was requested.
    #[must_use]
    pub fn ancestor(&self, stage: &str) -> Option<&ExperimentNode> {
        self.ancestors.get(stage)
    }

    /// All resolved ancestors by stage type.
    #[must_use]
    pub const fn ancestors(&self) -> &BTreeMap<StageType, ExperimentNode> {
        self.ancestors
    }

    /// Allocated output locations.
    #[must_use]
    pub const fn outputs(&self) -> &ResolvedOutputSet {
        self.outputs
    }

    /// Output root of this execution.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        self.outputs.root()
    }
}
