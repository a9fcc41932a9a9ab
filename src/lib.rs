//! # stage-lineage: lineage tracking for multi-stage analysis pipelines
//!
//! Every stage execution of a pipeline is recorded as an immutable
//! *experiment node* naming its parent execution, its parameters and the
//! files it produced. Nodes form a tree; any stage can locate the outputs of
//! an earlier stage by walking up that tree.
//!
//! ## Components
//!
//! - [`registry`]: which stage types exist, who their parent is, what they emit
//! - [`ledger`]: append-only store of committed nodes (memory or file backed)
//! - [`resolver`]: typed ancestor search along parent references
//! - [`allocator`]: deterministic output paths under an execution root
//! - [`envelope`]: the validate, allocate, resolve, compute, commit protocol
//! - [`catalog`]: sample/metadata documents joined onto stage inputs
//!
//! ## Example
//!
//! ```rust
//! use stage_lineage::envelope::{StageComputation, StageContext, StageEnvelope, StageRequest};
//! use stage_lineage::ledger::MemoryLedger;
//! use stage_lineage::registry::Registry;
//!
//! struct Import;
//!
//! impl StageComputation for Import {
//!     async fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
//!         for path in ctx.outputs().paths() {
//!             std::fs::write(path, b"reads")?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let registry = Registry::from_json(
//!     r#"[{"stageType": "Import", "parent": null, "output": {"data": ["reads.fq"]}}]"#,
//! )?;
//! let ledger = MemoryLedger::new();
//! let root = tempfile::tempdir()?;
//!
//! let request = StageRequest::new("exp-1", "Import", root.path());
//! let outcome = StageEnvelope::new(&registry, &ledger)
//!     .execute(request, &Import)
//!     .await?;
//!
//! assert_eq!(outcome.exit_code(), 0);
//! assert!(root.path().join("reads.fq").exists());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod allocator;
pub mod catalog;
pub mod cli;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod observability;
pub mod registry;
pub mod resolver;

pub use error::{Error, ErrorKind, Result};
