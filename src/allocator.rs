//! Output Location Allocator
//!
//! Maps `(stage type, output root)` to concrete output paths:
//!
//! ```text
//! data slots     -> <root>/<template>
//! visuals slots  -> <root>/Visuals/<template>
//! ```
//!
//! Paths depend on nothing but the stage's registry entry and the root, so
//! a retried execution writes to exactly the files an earlier attempt used
//! instead of scattering duplicates. Directory creation only ever creates,
//! and pre-existing directories are not an error, so concurrent stages
//! sharing a root cannot interfere.

use std::path::{Path, PathBuf};

use crate::ledger::NodeOutputs;
use crate::registry::{OutputCategory, Registry, StageType};
use crate::{Error, Result};

/// Directory (under the output root) that holds visualization outputs.
pub const VISUALS_DIR: &str = "Visuals";

/// One allocated output slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSlot {
    name: String,
    path: PathBuf,
}

impl ResolvedSlot {
    /// Slot name (its relative template).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concrete absolute path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Concrete output paths for one stage execution, grouped and ordered
/// exactly like the stage's output slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutputSet {
    stage_type: StageType,
    root: PathBuf,
    data: Vec<ResolvedSlot>,
    visuals: Vec<ResolvedSlot>,
}

impl ResolvedOutputSet {
    /// Stage type the set was allocated for.
    #[must_use]
    pub const fn stage_type(&self) -> &StageType {
        &self.stage_type
    }

    /// Output root the set was allocated under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slots of one category, in declaration order.
    #[must_use]
    pub fn slots(&self, category: OutputCategory) -> &[ResolvedSlot] {
        match category {
            OutputCategory::Data => &self.data,
            OutputCategory::Visuals => &self.visuals,
        }
    }

    /// Data path at position `index`.
    #[must_use]
    pub fn data(&self, index: usize) -> Option<&Path> {
        self.data.get(index).map(ResolvedSlot::path)
    }

    /// Visual path at position `index`.
    #[must_use]
    pub fn visual(&self, index: usize) -> Option<&Path> {
        self.visuals.get(index).map(ResolvedSlot::path)
    }

    /// Path allocated for the slot named `name`.
    #[must_use]
    pub fn path_for(&self, name: &str) -> Option<&Path> {
        self.data
            .iter()
            .chain(&self.visuals)
            .find(|s| s.name == name)
            .map(ResolvedSlot::path)
    }

    /// Every path, data first, each category in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.data
            .iter()
            .chain(&self.visuals)
            .map(ResolvedSlot::path)
    }

    /// Total number of allocated paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() + self.visuals.len()
    }

    /// True if the stage declares no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Output group to record on the committed node.
    #[must_use]
    pub fn to_node_outputs(&self) -> NodeOutputs {
        NodeOutputs::new(
            self.data.iter().map(|s| s.path.clone()).collect(),
            self.visuals.iter().map(|s| s.path.clone()).collect(),
        )
    }
}

/// Allocates output locations from registry slot templates.
#[derive(Debug, Clone, Copy)]
pub struct OutputAllocator<'r> {
    registry: &'r Registry,
}

impl<'r> OutputAllocator<'r> {
    /// Create an allocator over `registry`.
    #[must_use]
    pub const fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Compute output paths without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStage`] for unregistered stages and
    /// [`Error::InvalidOutputRoot`] if `root` is relative.
    pub fn plan(&self, stage: &str, root: impl AsRef<Path>) -> Result<ResolvedOutputSet> {
        let root = root.as_ref();
        if !root.is_absolute() {
            return Err(Error::InvalidOutputRoot {
                path: root.display().to_string(),
            });
        }
        let definition = self.registry.get_definition(stage)?;

        let resolve = |category: OutputCategory| -> Vec<ResolvedSlot> {
            let base = category_root(root, category);
            definition
                .slots_in(category)
                .map(|slot| ResolvedSlot {
                    name: slot.template().to_string(),
                    path: base.join(slot.template()),
                })
                .collect()
        };

        Ok(ResolvedOutputSet {
            stage_type: definition.stage_type().clone(),
            root: root.to_path_buf(),
            data: resolve(OutputCategory::Data),
            visuals: resolve(OutputCategory::Visuals),
        })
    }

    /// Compute output paths and make sure their directories exist.
    ///
    /// The data root is always created; `Visuals` only when the stage
    /// declares visual slots. Existing directories are left as they are.
    ///
    /// # Errors
    ///
    /// Returns the [`OutputAllocator::plan`] errors, or [`Error::Io`] if a
    /// directory cannot be created.
    pub async fn allocate(&self, stage: &str, root: impl AsRef<Path>) -> Result<ResolvedOutputSet> {
        let outputs = self.plan(stage, root)?;

        tokio::fs::create_dir_all(&outputs.root).await?;
        for path in outputs.paths() {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        tracing::debug!(
            stage,
            root = %outputs.root.display(),
            paths = outputs.len(),
            "outputs allocated"
        );
        Ok(outputs)
    }
}

fn category_root(root: &Path, category: OutputCategory) -> PathBuf {
    match category {
        OutputCategory::Data => root.to_path_buf(),
        OutputCategory::Visuals => root.join(VISUALS_DIR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::from_json(
            r#"[
                {"stageType": "Import", "output": {"data": ["seqs.fmt"]}},
                {"stageType": "QC", "parent": "Import",
                 "output": {"data": ["table.fmt", "reps.fmt"], "visuals": ["qc.viz"]}},
                {"stageType": "Nested", "parent": "QC",
                 "output": {"data": ["tables/otu.biom"]}}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_plan_layout() {
        let registry = registry();
        let outputs = OutputAllocator::new(&registry).plan("QC", "/out").unwrap();

        let paths: Vec<&Path> = outputs.paths().collect();
        assert_eq!(
            paths,
            vec![
                Path::new("/out/table.fmt"),
                Path::new("/out/reps.fmt"),
                Path::new("/out/Visuals/qc.viz"),
            ]
        );
        assert_eq!(outputs.data(1), Some(Path::new("/out/reps.fmt")));
        assert_eq!(outputs.visual(0), Some(Path::new("/out/Visuals/qc.viz")));
        assert_eq!(outputs.path_for("qc.viz"), outputs.visual(0));
    }

    #[test]
    fn test_relative_root_rejected() {
        let registry = registry();
        let err = OutputAllocator::new(&registry).plan("QC", "out").unwrap_err();
        assert!(matches!(err, Error::InvalidOutputRoot { .. }));
    }

    #[test]
    fn test_unknown_stage() {
        let registry = registry();
        let err = OutputAllocator::new(&registry).plan("Lefse", "/out").unwrap_err();
        assert!(matches!(err, Error::UnknownStage { .. }));
    }

    #[tokio::test]
    async fn test_allocate_creates_directories_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let allocator = OutputAllocator::new(&registry);

        let first = allocator.allocate("QC", dir.path()).await.unwrap();
        let second = allocator.allocate("QC", dir.path()).await.unwrap();

        assert_eq!(first, second);
        assert!(dir.path().is_dir());
        assert!(dir.path().join(VISUALS_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_allocate_without_visuals_skips_visuals_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let outputs = OutputAllocator::new(&registry)
            .allocate("Import", dir.path())
            .await
            .unwrap();

        assert_eq!(outputs.len(), 1);
        assert!(!dir.path().join(VISUALS_DIR).exists());
    }

    #[tokio::test]
    async fn test_nested_template_parent_created() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let outputs = OutputAllocator::new(&registry)
            .allocate("Nested", dir.path())
            .await
            .unwrap();

        assert!(dir.path().join("tables").is_dir());
        assert_eq!(outputs.data(0), Some(dir.path().join("tables/otu.biom").as_path()));
    }

    #[test]
    fn test_node_outputs_partition() {
        let registry = registry();
        let outputs = OutputAllocator::new(&registry).plan("QC", "/out").unwrap();
        let node_outputs = outputs.to_node_outputs();
        assert_eq!(node_outputs.data.len(), 2);
        assert_eq!(node_outputs.visuals, vec![PathBuf::from("/out/Visuals/qc.viz")]);
    }
}
