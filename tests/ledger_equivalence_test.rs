//! Backend equivalence: MemoryLedger and FileLedger must agree on every
//! observable operation.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use stage_lineage::ledger::{ExperimentNode, FileLedger, Ledger, MemoryLedger, NodeFilter, NodeOutputs};
use stage_lineage::Error;

fn nodes() -> Vec<ExperimentNode> {
    let mut params = serde_json::Map::new();
    params.insert("threshold".to_string(), json!(20));
    params.insert("trim".to_string(), json!({"left": 10, "right": 240}));

    vec![
        ExperimentNode::new("e1", "Import"),
        ExperimentNode::builder("e2", "QC")
            .parent("e1")
            .params(params)
            .outputs(NodeOutputs::new(
                vec!["/out/e2/table.fmt".into()],
                vec!["/out/e2/Visuals/qc.viz".into()],
            ))
            .committed_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
            .build(),
        ExperimentNode::builder("e3", "QC").parent("e1").build(),
        ExperimentNode::builder("run/7 ü", "Taxonomy").parent("e2").build(),
        ExperimentNode::new("e9", "Import"),
    ]
}

async fn observe<L: Ledger>(ledger: &L) -> Vec<String> {
    for node in nodes() {
        ledger.create_node(node).await.unwrap();
    }

    let mut seen = Vec::new();

    let ids: BTreeSet<String> = ledger.ids().await.unwrap().into_iter().collect();
    seen.push(format!("ids={ids:?}"));

    for node in nodes() {
        let stored = ledger.get_node(node.id()).await.unwrap();
        assert_eq!(stored, node);
        seen.push(serde_json::to_string(&stored).unwrap());
    }

    let mut children: Vec<String> = ledger
        .children("e1")
        .await
        .unwrap()
        .iter()
        .map(|n| n.id().to_string())
        .collect();
    children.sort();
    seen.push(format!("children={children:?}"));

    let mut roots: Vec<String> = ledger
        .query(NodeFilter::new().roots())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id().to_string())
        .collect();
    roots.sort();
    seen.push(format!("roots={roots:?}"));

    let by_param = ledger
        .query(NodeFilter::new().stage("QC").param("threshold", json!(20)))
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    seen.push(format!("by_param={}", by_param.len()));

    let duplicate = ledger
        .create_node(ExperimentNode::new("e1", "Overwrite"))
        .await;
    assert!(matches!(duplicate, Err(Error::DuplicateId { .. })));
    assert_eq!(
        ledger.get_node("e1").await.unwrap().stage_type().as_str(),
        "Import"
    );

    assert!(matches!(
        ledger.get_node("missing").await,
        Err(Error::NotFound { .. })
    ));
    assert!(!ledger.exists("missing").await.unwrap());

    seen
}

#[tokio::test]
async fn test_backends_are_equivalent() {
    let memory = observe(&MemoryLedger::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let file = observe(&FileLedger::open(dir.path()).await.unwrap()).await;

    assert_eq!(memory, file);
}

#[tokio::test]
async fn test_query_cursor_is_restartable() {
    let ledger = MemoryLedger::new();
    for node in nodes() {
        ledger.create_node(node).await.unwrap();
    }
    let filter = NodeFilter::new().stage("Import");

    let first = ledger.query(filter.clone()).await.unwrap().collect().await.unwrap();
    ledger
        .create_node(ExperimentNode::new("e10", "Import"))
        .await
        .unwrap();
    let second = ledger.query(filter).await.unwrap().collect().await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_ledger_concurrent_create_single_winner() {
    const N: usize = 24;
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(FileLedger::open(dir.path()).await.unwrap());

    let handles: Vec<_> = (0..N)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let node = ExperimentNode::builder("shared", "Import")
                    .params({
                        let mut p = serde_json::Map::new();
                        p.insert("writer".to_string(), json!(i));
                        p
                    })
                    .build();
                ledger.create_node(node.clone()).await.map(|()| node)
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(node) => winners.push(node),
            Err(Error::DuplicateId { .. }) => duplicates += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(duplicates, N - 1);
    assert_eq!(ledger.get_node("shared").await.unwrap(), winners[0]);

    // Temp files never show up as nodes.
    assert_eq!(ledger.ids().await.unwrap(), vec!["shared".to_string()]);
}

#[tokio::test]
async fn test_second_process_view() {
    let dir = tempfile::tempdir().unwrap();
    let writer = FileLedger::open(dir.path()).await.unwrap();
    let reader = FileLedger::open(dir.path()).await.unwrap();

    writer
        .create_node(ExperimentNode::new("e1", "Import"))
        .await
        .unwrap();

    assert!(reader.exists("e1").await.unwrap());
    assert!(matches!(
        reader.create_node(ExperimentNode::new("e1", "Import")).await,
        Err(Error::DuplicateId { .. })
    ));
}
