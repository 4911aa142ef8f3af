//! The coalescer's contract: after `close_and_wait`, the persisted state is
//! the pointwise merger-fold of every accepted delta, regardless of the
//! order they were emitted in or how the background writer batched them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sideload::catalog::{ColumnInfo, DbInfo, TableInfo};
use sideload::checkpoint::{
    apply_diff, CheckpointMerger, CheckpointStatus, CheckpointStore, ChunkCheckpoint, ChunkKey,
    EngineCheckpoint, FileCheckpointStore, TableCheckpoint, TableCheckpointDiff,
};
use sideload::coalescer::Coalescer;
use sideload::mydump::Chunk;
use sideload::verification::KvChecksum;

fn db_infos() -> HashMap<String, DbInfo> {
    let table = |name: &str, id: i64| TableInfo {
        id,
        name: name.to_string(),
        columns: vec![ColumnInfo {
            name: "a".to_string(),
        }],
        pk_is_handle: false,
        auto_inc_id: 0,
        create_table_stmt: String::new(),
    };
    HashMap::from([(
        "db".to_string(),
        DbInfo {
            name: "db".to_string(),
            tables: HashMap::from([
                ("t1".to_string(), table("t1", 1)),
                ("t2".to_string(), table("t2", 2)),
            ]),
        },
    )])
}

fn engine_with_chunk(path: &str) -> EngineCheckpoint {
    EngineCheckpoint {
        status: CheckpointStatus::LOADED,
        chunks: vec![ChunkCheckpoint {
            key: ChunkKey {
                path: path.into(),
                offset: 0,
            },
            columns: None,
            should_include_row_id: false,
            chunk: Chunk {
                offset: 0,
                end_offset: 1000,
                prev_row_id_max: 0,
                row_id_max: 1000,
            },
            checksum: KvChecksum::default(),
        }],
    }
}

fn deltas() -> Vec<(String, CheckpointMerger)> {
    let t1 = "`db`.`t1`".to_string();
    let t2 = "`db`.`t2`".to_string();
    let key1 = ChunkKey {
        path: "t1.sql".into(),
        offset: 0,
    };
    vec![
        (t1.clone(), CheckpointMerger::Rebase { alloc_base: 100 }),
        (
            t1.clone(),
            CheckpointMerger::Chunk {
                engine_id: 0,
                key: key1.clone(),
                pos: 400,
                row_id: 40,
                checksum: KvChecksum::new(11, 40, 400),
            },
        ),
        (
            t1.clone(),
            CheckpointMerger::Chunk {
                engine_id: 0,
                key: key1.clone(),
                pos: 900,
                row_id: 90,
                checksum: KvChecksum::new(23, 90, 900),
            },
        ),
        (t1.clone(), CheckpointMerger::Rebase { alloc_base: 901 }),
        (
            t1.clone(),
            CheckpointMerger::Status {
                engine_id: Some(0),
                status: CheckpointStatus::ALL_WRITTEN,
            },
        ),
        (
            t2.clone(),
            CheckpointMerger::Status {
                engine_id: None,
                status: CheckpointStatus::IMPORTED,
            },
        ),
        (t2.clone(), CheckpointMerger::Rebase { alloc_base: 77 }),
    ]
}

async fn run_coalescer(
    path: &Path,
    order: &[(String, CheckpointMerger)],
) -> (TableCheckpoint, TableCheckpoint) {
    let store = Arc::new(FileCheckpointStore::new(path.to_path_buf()));
    store.initialize(&db_infos()).await.expect("initialize");
    store
        .insert_engine_checkpoints("`db`.`t1`", &[engine_with_chunk("t1.sql")])
        .await
        .expect("insert engines");
    store
        .insert_engine_checkpoints("`db`.`t2`", &[engine_with_chunk("t2.sql")])
        .await
        .expect("insert engines");

    let coalescer = Coalescer::spawn(store.clone());
    let sender = coalescer.sender();
    for (i, (table_name, merger)) in order.iter().enumerate() {
        sender.send(table_name.clone(), merger.clone());
        // Yield occasionally so the writer interleaves flushes with merges.
        if i % 2 == 1 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
    coalescer.close_and_wait().await;

    (
        store.get("`db`.`t1`").await.expect("t1"),
        store.get("`db`.`t2`").await.expect("t2"),
    )
}

#[tokio::test]
async fn flushed_state_equals_pointwise_fold_in_any_order() {
    let forward = deltas();
    let mut backward = deltas();
    backward.reverse();

    let dir = tempfile::tempdir().expect("tempdir");
    let (t1_fwd, t2_fwd) = run_coalescer(&dir.path().join("fwd.json"), &forward).await;
    let (t1_bwd, t2_bwd) = run_coalescer(&dir.path().join("bwd.json"), &backward).await;

    // Same final state no matter the emission order.
    assert_eq!(t1_fwd.status, t1_bwd.status);
    assert_eq!(t1_fwd.alloc_base, t1_bwd.alloc_base);
    assert_eq!(
        t1_fwd.engines[0].chunks[0].chunk,
        t1_bwd.engines[0].chunks[0].chunk
    );
    assert_eq!(
        t1_fwd.engines[0].chunks[0].checksum,
        t1_bwd.engines[0].chunks[0].checksum
    );
    assert_eq!(t2_fwd.status, t2_bwd.status);
    assert_eq!(t2_fwd.alloc_base, t2_bwd.alloc_base);

    // And it equals folding every delta into one diff applied at once.
    let mut expected_t1 = TableCheckpoint::new();
    expected_t1.engines = vec![engine_with_chunk("t1.sql")];
    let mut expected_t2 = TableCheckpoint::new();
    expected_t2.engines = vec![engine_with_chunk("t2.sql")];
    let mut diff_t1 = TableCheckpointDiff::default();
    let mut diff_t2 = TableCheckpointDiff::default();
    for (table_name, merger) in &forward {
        if table_name.contains("t1") {
            merger.merge_into(&mut diff_t1);
        } else {
            merger.merge_into(&mut diff_t2);
        }
    }
    apply_diff(&mut expected_t1, &diff_t1);
    apply_diff(&mut expected_t2, &diff_t2);

    assert_eq!(t1_fwd.alloc_base, expected_t1.alloc_base);
    assert_eq!(t1_fwd.engines[0].status, expected_t1.engines[0].status);
    assert_eq!(
        t1_fwd.engines[0].chunks[0].chunk,
        expected_t1.engines[0].chunks[0].chunk
    );
    assert_eq!(t2_fwd.status, expected_t2.status);
    assert_eq!(t2_fwd.alloc_base, expected_t2.alloc_base);
}
