//! Lineage Pipeline Example
//!
//! Runs a small four-stage pipeline through the execution envelope against a
//! file ledger, then walks the recorded lineage.
//!
//! Run with: cargo run --example lineage_pipeline

use std::fmt::Write as _;

use serde_json::json;
use stage_lineage::catalog::{DocumentCollection, SampleCatalog};
use stage_lineage::envelope::{StageComputation, StageContext, StageEnvelope, StageRequest};
use stage_lineage::ledger::{FileLedger, Ledger, NodeFilter};
use stage_lineage::observability::{init_logging, LogFormat};
use stage_lineage::registry::{Registry, StageType};
use stage_lineage::resolver::LineageResolver;

const REGISTRY: &str = r#"[
    {"stageType": "Import", "parent": null, "output": {"data": ["seqs.fmt"]}},
    {"stageType": "QC", "parent": "Import", "params": ["threshold"],
     "output": {"data": ["table.fmt", "reps.fmt"], "visuals": ["qc.viz"]}},
    {"stageType": "Taxonomy", "parent": "QC", "output": {"data": ["taxonomy.tsv"]}},
    {"stageType": "Diversity", "parent": "Taxonomy",
     "output": {"data": ["alpha.tsv"], "visuals": ["alpha.viz"]}}
]"#;

/// Stand-in tool: writes a line naming its inputs into every output.
struct Touch;

impl StageComputation for Touch {
    async fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
        let inputs = ctx.input_paths();
        for path in ctx.outputs().paths() {
            std::fs::write(path, format!("{} <- {inputs:?}\n", ctx.stage_type()))?;
        }
        Ok(())
    }
}

/// Joins diagnosis covariates onto the imported runs.
struct Diversity {
    catalog: SampleCatalog,
}

impl StageComputation for Diversity {
    fn ancestors(&self) -> Vec<StageType> {
        vec![StageType::from("Import")]
    }

    async fn run(&self, ctx: &StageContext<'_>) -> anyhow::Result<()> {
        let runs: Vec<String> = ctx.param("runs")?;
        let mut table = String::from("run\tdx\n");
        for run in &runs {
            // Unknown diagnoses are kept as "unknown" rather than failing.
            let dx = self.catalog.covariate(run, "dx").label();
            writeln!(table, "{run}\t{dx}")?;
        }
        if let Some(path) = ctx.outputs().data(0) {
            std::fs::write(path, table)?;
        }
        if let Some(path) = ctx.outputs().visual(0) {
            let import = ctx.ancestor("Import").map(|n| n.id().to_string());
            std::fs::write(path, format!("import: {import:?}\n"))?;
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging(LogFormat::Pretty);
    println!("=== stage-lineage pipeline ===\n");

    let dir = tempfile::tempdir()?;
    let ledger = FileLedger::open(dir.path().join("ledger")).await?;
    let registry = Registry::from_json(REGISTRY)?;
    ledger.publish_registry(&registry).await?;
    let out = dir.path().join("out");

    let catalog = SampleCatalog::new(
        DocumentCollection::from_json(
            "samples",
            r#"[{"run_accession": "ERR1", "sample_alias": "S-01"},
                {"run_accession": "ERR2", "sample_alias": "S-02"}]"#,
        )?,
        DocumentCollection::from_json("metadata", r#"[{"sample": "S-01", "dx": "CD"}]"#)?,
    );

    // -------------------------------------------------------------------------
    // 1. Run the stages, each as its own envelope invocation
    // -------------------------------------------------------------------------
    println!("1. Running stages...");
    let envelope = StageEnvelope::new(&registry, &ledger);
    let threshold = json!({"threshold": 20});
    let runs = json!({"runs": ["ERR1", "ERR2"]});

    let steps = [
        ("e1", "Import", None, None),
        ("e2", "QC", Some("e1"), threshold.as_object()),
        ("e3", "Taxonomy", Some("e2"), None),
    ];
    for (id, stage, parent, params) in steps {
        let request = StageRequest::new(id, stage, out.join(id))
            .parent_opt(parent.map(str::to_string))
            .params(params.cloned().unwrap_or_default());
        let outcome = envelope.execute(request, &Touch).await?;
        println!("   {id} ({stage}): {:?}", outcome.state());
    }

    let request = StageRequest::new("e4", "Diversity", out.join("e4"))
        .parent("e3")
        .params(runs.as_object().cloned().unwrap_or_default());
    let outcome = envelope.execute(request, &Diversity { catalog }).await?;
    println!("   e4 (Diversity): {:?}", outcome.state());

    // -------------------------------------------------------------------------
    // 2. Re-running a committed id is a no-op
    // -------------------------------------------------------------------------
    println!("\n2. Re-running e1...");
    let outcome = envelope
        .execute(StageRequest::new("e1", "Import", out.join("e1")), &Touch)
        .await?;
    println!("   e1: {:?} (exit {})", outcome.state(), outcome.exit_code());

    // -------------------------------------------------------------------------
    // 3. A mis-wired launch is rejected before anything runs
    // -------------------------------------------------------------------------
    println!("\n3. Launching Taxonomy under Import...");
    let outcome = envelope
        .execute(
            StageRequest::new("bad", "Taxonomy", out.join("bad")).parent("e1"),
            &Touch,
        )
        .await?;
    if let Some(error) = outcome.error() {
        println!("   {:?}: {error}", outcome.state());
    }

    // -------------------------------------------------------------------------
    // 4. Inspect the lineage
    // -------------------------------------------------------------------------
    println!("\n4. Lineage of e4:");
    let e4 = ledger.get_node("e4").await?;
    for node in LineageResolver::new(&ledger).lineage(&e4).await? {
        println!("   {} [{}] -> {:?}", node.id(), node.stage_type(), node.outputs().data);
    }

    let roots = ledger.query(NodeFilter::new().roots()).await?.collect().await?;
    println!("\n   Root experiments: {}", roots.len());

    let table = std::fs::read_to_string(out.join("e4").join("alpha.tsv"))?;
    println!("\n5. Diversity table:\n{table}");

    Ok(())
}
