//! External-program computation used by the stage driver binary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use tokio::process::Command;

use super::{StageComputation, StageContext};
use crate::ledger::NodeOutputs;
use crate::registry::StageType;

/// Runs a program as the stage's computation.
///
/// The program learns where to read and write through its environment:
///
/// | Variable                 | Content                                        |
/// |--------------------------|------------------------------------------------|
/// | `STAGE_ID`               | id the node will be committed under            |
/// | `STAGE_TYPE`             | stage being executed                           |
/// | `STAGE_PARAMS`           | parameter payload (JSON object)                |
/// | `STAGE_PARENT_OUTPUTS`   | parent `{data, visuals}` (JSON, `null` at root) |
/// | `STAGE_ANCESTOR_OUTPUTS` | `{stage: {data, visuals}}` for resolved ancestors |
/// | `STAGE_OUTPUTS`          | allocated `{data, visuals}` paths (JSON)       |
///
/// A non-zero exit status fails the stage.
#[derive(Debug, Clone)]
pub struct CommandComputation {
    program: PathBuf,
    args: Vec<String>,
    ancestors: Vec<StageType>,
}

impl CommandComputation {
    /// Create a computation that runs `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ancestors: Vec::new(),
        }
    }

    /// Ask the envelope to resolve these ancestor stages before running.
    #[must_use]
    pub fn with_ancestors(mut self, ancestors: Vec<StageType>) -> Self {
        self.ancestors = ancestors;
        self
    }

    fn environment(ctx: &StageContext<'_>) -> anyhow::Result<Vec<(&'static str, String)>> {
        let ancestor_outputs: BTreeMap<&str, &NodeOutputs> = ctx
            .ancestors()
            .iter()
            .map(|(stage, node)| (stage.as_str(), node.outputs()))
            .collect();

        Ok(vec![
            ("STAGE_ID", ctx.id().to_string()),
            ("STAGE_TYPE", ctx.stage_type().to_string()),
            ("STAGE_PARAMS", serde_json::to_string(ctx.params())?),
            (
                "STAGE_PARENT_OUTPUTS",
                serde_json::to_string(&ctx.parent().map(|p| p.outputs()))?,
            ),
            ("STAGE_ANCESTOR_OUTPUTS", serde_json::to_string(&ancestor_outputs)?),
            (
                "STAGE_OUTPUTS",
                serde_json::to_string(&ctx.outputs().to_node_outputs())?,
            ),
        ])
    }
}

impl StageComputation for CommandComputation {
    fn ancestors(&self) -> Vec<StageType> {
        self.ancestors.clone()
    }

    async fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
        let env = Self::environment(ctx)?;
        tracing::info!(program = %self.program.display(), "starting computation");

        let status = Command::new(&self.program)
            .args(&self.args)
            .envs(env)
            .current_dir(ctx.output_root())
            .status()
            .await
            .with_context(|| format!("failed to launch {}", self.program.display()))?;

        if !status.success() {
            bail!("{} exited with {status}", self.program.display());
        }
        Ok(())
    }
}
