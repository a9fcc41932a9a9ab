//! End-to-end lineage scenario: registry, ledger, allocator and resolver
//! working together on both ledger backends.

use std::path::PathBuf;

use stage_lineage::allocator::OutputAllocator;
use stage_lineage::ledger::{ExperimentNode, FileLedger, Ledger, MemoryLedger};
use stage_lineage::registry::{Registry, StageType};
use stage_lineage::resolver::LineageResolver;
use stage_lineage::Error;

const REGISTRY: &str = r#"[
    {"stageType": "Import", "parent": null, "output": {"data": ["seqs.fmt"]}},
    {"stageType": "QC", "parent": "Import",
     "output": {"data": ["table.fmt", "reps.fmt"], "visuals": ["qc.viz"]}}
]"#;

async fn scenario<L: Ledger>(ledger: &L) {
    let registry = Registry::from_json(REGISTRY).unwrap();

    ledger
        .create_node(ExperimentNode::new("e1", "Import"))
        .await
        .unwrap();
    ledger
        .create_node(ExperimentNode::builder("e2", "QC").parent("e1").build())
        .await
        .unwrap();

    let outputs = OutputAllocator::new(&registry).plan("QC", "/out").unwrap();
    let paths: Vec<PathBuf> = outputs.paths().map(PathBuf::from).collect();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("/out/table.fmt"),
            PathBuf::from("/out/reps.fmt"),
            PathBuf::from("/out/Visuals/qc.viz"),
        ]
    );

    let e1 = ledger.get_node("e1").await.unwrap();
    let e2 = ledger.get_node("e2").await.unwrap();
    let resolver = LineageResolver::new(ledger);
    assert_eq!(
        resolver.resolve(&e2, &StageType::from("Import")).await.unwrap(),
        e1
    );

    let lineage = resolver.lineage(&e2).await.unwrap();
    let ids: Vec<&str> = lineage.iter().map(ExperimentNode::id).collect();
    assert_eq!(ids, vec!["e2", "e1"]);

    let children = ledger.children("e1").await.unwrap();
    assert_eq!(children, vec![e2]);
}

#[tokio::test]
async fn test_end_to_end_memory_ledger() {
    scenario(&MemoryLedger::new()).await;
}

#[tokio::test]
async fn test_end_to_end_file_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::open(dir.path()).await.unwrap();
    scenario(&ledger).await;
}

#[tokio::test]
async fn test_three_stage_chain_resolution() {
    let ledger = MemoryLedger::new();
    ledger.create_node(ExperimentNode::new("A", "S1")).await.unwrap();
    ledger
        .create_node(ExperimentNode::builder("B", "S2").parent("A").build())
        .await
        .unwrap();
    ledger
        .create_node(ExperimentNode::builder("C", "S3").parent("B").build())
        .await
        .unwrap();

    let resolver = LineageResolver::new(&ledger);
    let c = ledger.get_node("C").await.unwrap();

    assert_eq!(resolver.resolve(&c, &"S1".into()).await.unwrap().id(), "A");
    assert_eq!(resolver.resolve(&c, &"S2".into()).await.unwrap().id(), "B");
    assert_eq!(resolver.resolve(&c, &"S3".into()).await.unwrap().id(), "C");
    assert!(matches!(
        resolver.resolve(&c, &"S4".into()).await,
        Err(Error::LineageNotFound { .. })
    ));
    assert!(matches!(
        resolver.resolve_strict(&c, &"S3".into()).await,
        Err(Error::LineageNotFound { .. })
    ));
}

#[tokio::test]
async fn test_hand_edited_cycle_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::open(dir.path()).await.unwrap();
    ledger
        .create_node(ExperimentNode::builder("x", "S1").parent("y").build())
        .await
        .unwrap();
    ledger
        .create_node(ExperimentNode::builder("y", "S1").parent("x").build())
        .await
        .unwrap();

    let x = ledger.get_node("x").await.unwrap();
    let err = LineageResolver::new(&ledger)
        .resolve(&x, &"S9".into())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorruptLedger(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_allocation_creates_category_directories() {
    let registry = Registry::from_json(REGISTRY).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("e2");

    let allocator = OutputAllocator::new(&registry);
    let first = allocator.allocate("QC", &root).await.unwrap();
    let second = allocator.allocate("QC", &root).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert!(root.is_dir());
    assert!(root.join("Visuals").is_dir());

    let import_root = dir.path().join("e1");
    allocator.allocate("Import", &import_root).await.unwrap();
    assert!(!import_root.join("Visuals").exists());
}
