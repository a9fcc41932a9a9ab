//! Experiment Node - one committed stage execution

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::registry::StageType;

/// Ordered key-value parameter payload recorded for audit.
pub type StageParams = serde_json::Map<String, serde_json::Value>;

/// Output paths of a node, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutputs {
    /// Data artifact paths in slot order.
    #[serde(default, deserialize_with = "one_or_many")]
    pub data: Vec<PathBuf>,
    /// Visualization paths in slot order.
    #[serde(default, deserialize_with = "one_or_many")]
    pub visuals: Vec<PathBuf>,
}

impl NodeOutputs {
    /// Create an output group from data and visual paths.
    #[must_use]
    pub const fn new(data: Vec<PathBuf>, visuals: Vec<PathBuf>) -> Self {
        Self { data, visuals }
    }

    /// True if the node recorded no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.visuals.is_empty()
    }

    /// Data path at `index`.
    #[must_use]
    pub fn data_at(&self, index: usize) -> Option<&Path> {
        self.data.get(index).map(PathBuf::as_path)
    }

    /// Visual path at `index`.
    #[must_use]
    pub fn visual_at(&self, index: usize) -> Option<&Path> {
        self.visuals.get(index).map(PathBuf::as_path)
    }
}

// Older records store a single path or null where a list is expected.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(path)) => vec![path],
        Some(OneOrMany::Many(paths)) => paths,
    })
}

/// Experiment Node represents one committed stage execution.
///
/// Nodes are append-only: once written to a ledger they are never mutated
/// or deleted. The serialized form is the ledger record
/// `{id, parent, stageType, params, output: {data, visuals}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentNode {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(rename = "stageType", alias = "stage")]
    stage_type: StageType,
    #[serde(default)]
    params: StageParams,
    #[serde(rename = "output", default)]
    outputs: NodeOutputs,
    #[serde(
        rename = "committedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    committed_at: Option<DateTime<Utc>>,
}

impl ExperimentNode {
    /// Create a root node with no params and no outputs.
    ///
    /// # Arguments
    ///
    /// * `id` - Caller-supplied, globally unique node id
    /// * `stage_type` - Stage type the node was produced by
    #[must_use]
    pub fn new(id: impl Into<String>, stage_type: impl Into<StageType>) -> Self {
        ExperimentNodeBuilder::new(id, stage_type).build()
    }

    /// Create a builder for constructing a node with optional fields.
    #[must_use]
    pub fn builder(
        id: impl Into<String>,
        stage_type: impl Into<StageType>,
    ) -> ExperimentNodeBuilder {
        ExperimentNodeBuilder::new(id, stage_type)
    }

    /// Get the node ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the parent node ID, `None` for roots.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// True if the node starts a lineage.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Get the stage type.
    #[must_use]
    pub const fn stage_type(&self) -> &StageType {
        &self.stage_type
    }

    /// Get the recorded parameters.
    #[must_use]
    pub const fn params(&self) -> &StageParams {
        &self.params
    }

    /// Get the output paths.
    #[must_use]
    pub const fn outputs(&self) -> &NodeOutputs {
        &self.outputs
    }

    /// Get the commit timestamp, if recorded.
    #[must_use]
    pub const fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.committed_at
    }
}

/// Builder for `ExperimentNode`.
#[derive(Debug)]
pub struct ExperimentNodeBuilder {
    id: String,
    parent: Option<String>,
    stage_type: StageType,
    params: StageParams,
    outputs: NodeOutputs,
    committed_at: Option<DateTime<Utc>>,
}

impl ExperimentNodeBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, stage_type: impl Into<StageType>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            stage_type: stage_type.into(),
            params: StageParams::new(),
            outputs: NodeOutputs::default(),
            committed_at: None,
        }
    }

    /// Set the parent node ID.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set or clear the parent node ID.
    #[must_use]
    pub fn parent_opt(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    /// Set the parameter payload.
    #[must_use]
    pub fn params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    /// Set the output paths.
    #[must_use]
    pub fn outputs(mut self, outputs: NodeOutputs) -> Self {
        self.outputs = outputs;
        self
    }

    /// Stamp the node with the current time.
    #[must_use]
    pub fn committed_now(self) -> Self {
        self.committed_at(Utc::now())
    }

    /// Set a custom commit timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn committed_at(mut self, committed_at: DateTime<Utc>) -> Self {
        self.committed_at = Some(committed_at);
        self
    }

    /// Build the `ExperimentNode`.
    #[must_use]
    pub fn build(self) -> ExperimentNode {
        ExperimentNode {
            id: self.id,
            parent: self.parent,
            stage_type: self.stage_type,
            params: self.params,
            outputs: self.outputs,
            committed_at: self.committed_at,
        }
    }
}
