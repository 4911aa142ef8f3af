//! Table- and engine-level restore orchestration.
//!
//! A table fans out into importer engines, each engine fans out into chunks.
//! Engine imports are serialized process-wide, and the auto-increment fixup,
//! checksum, and analyze passes run per table once every engine is in.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::catalog::{
    alter_auto_increment, analyze_table, do_checksum, set_session_concurrency_vars, TableInfo,
};
use crate::checkpoint::{
    CheckpointMerger, CheckpointStatus, ChunkCheckpoint, ChunkKey, EngineCheckpoint,
    TableCheckpoint,
};
use crate::chunk::ChunkRestore;
use crate::config::Config;
use crate::controller::{RestoreController, COMPACT_STATE_DOING, COMPACT_STATE_IDLE};
use crate::error::{Cancelled, OnceError};
use crate::importer::{ClosedEngine, OpenedEngine, LEVEL1_COMPACT};
use crate::kv::{KvEncoder, KvEncoderBuilder, PanickingAllocator, EXTRA_HANDLE_COLUMN};
use crate::mydump::{make_table_regions, TableMeta};
use crate::verification::KvChecksum;

/// Runtime view of one engine: the status it was loaded with plus the shared
/// chunk checkpoints its workers mutate.
pub(crate) struct EngineRun {
    status: CheckpointStatus,
    chunks: Arc<Vec<Arc<Mutex<ChunkCheckpoint>>>>,
}

pub struct TableRestore {
    /// The unique table name in the form `` `db`.`tbl` ``.
    pub(crate) table_name: String,
    pub(crate) table_meta: TableMeta,
    pub(crate) table_info: TableInfo,
    pub(crate) encoder: Arc<dyn KvEncoder>,
    pub(crate) alloc: Arc<PanickingAllocator>,
}

impl TableRestore {
    pub fn new(
        table_name: String,
        table_meta: TableMeta,
        table_info: TableInfo,
        cp: &TableCheckpoint,
        encoder_builder: &dyn KvEncoderBuilder,
        sql_mode: &str,
    ) -> Result<Arc<Self>> {
        let alloc = Arc::new(PanickingAllocator::new(cp.alloc_base));
        let encoder = encoder_builder
            .build(&table_meta.db, &table_info, sql_mode, alloc.clone())
            .with_context(|| format!("build kv encoder for {table_name}"))?;
        Ok(Arc::new(Self {
            table_name,
            table_meta,
            table_info,
            encoder,
            alloc,
        }))
    }

    pub async fn restore_table(
        self: &Arc<Self>,
        rc: &Arc<RestoreController>,
        token: &CancellationToken,
        mut cp: TableCheckpoint,
    ) -> Result<()> {
        // 1. Populate chunks, unless the checkpoint already carries them.
        if !cp.engines.is_empty() {
            tracing::info!(
                table = %self.table_name,
                engines = cp.engines.len(),
                chunks = cp.count_chunks(),
                "reusing engines and chunks from checkpoint"
            );
        } else if cp.status < CheckpointStatus::ALL_WRITTEN {
            self.populate_chunks(&rc.cfg, &mut cp)?;
            rc.checkpoint_store
                .insert_engine_checkpoints(&self.table_name, &cp.engines)
                .await?;

            // Rebase the allocator past every reservation so encoder-side
            // allocations can never collide with parser-assigned row IDs.
            cp.alloc_base = cp.alloc_base.max(self.table_info.auto_inc_id);
            for engine in &cp.engines {
                for chunk in &engine.chunks {
                    cp.alloc_base = cp.alloc_base.max(chunk.chunk.row_id_max);
                }
            }
            self.alloc.rebase(cp.alloc_base);
            rc.saver.send(
                self.table_name.clone(),
                CheckpointMerger::Rebase {
                    alloc_base: cp.alloc_base,
                },
            );
        }

        let engines: Vec<EngineRun> = cp
            .engines
            .iter()
            .map(|engine| EngineRun {
                status: engine.status,
                chunks: Arc::new(
                    engine
                        .chunks
                        .iter()
                        .map(|chunk| Arc::new(Mutex::new(chunk.clone())))
                        .collect(),
                ),
            })
            .collect();

        // 2. Restore and import engines, if still needed.
        if cp.status < CheckpointStatus::IMPORTED {
            let timer = Instant::now();
            let engine_err = Arc::new(OnceError::new());
            let mut tasks = FuturesUnordered::new();

            for (engine_id, engine) in engines.iter().enumerate() {
                if token.is_cancelled() {
                    return Err(Cancelled.into());
                }
                if engine_err.is_set() {
                    break;
                }

                let worker = rc.table_workers.apply().await;
                let tr = self.clone();
                let rc = rc.clone();
                let token = token.clone();
                let latch = engine_err.clone();
                let status = engine.status;
                let chunks = engine.chunks.clone();

                tasks.push(tokio::spawn(async move {
                    let tag = format!("{}:{}", tr.table_name, engine_id);
                    let result = tr
                        .restore_engine(&rc, &token, engine_id, status, &chunks)
                        .await;
                    drop(worker);
                    match result {
                        Ok(closed) => {
                            if let Err(err) = tr
                                .import_engine(&rc, closed.as_ref(), engine_id, status)
                                .await
                            {
                                latch.set(&tag, err);
                            }
                        }
                        Err(err) => latch.set(&tag, err),
                    }
                }));
            }

            while let Some(joined) = tasks.next().await {
                if let Err(err) = joined {
                    engine_err.set(&self.table_name, anyhow!("engine task died: {err}"));
                }
            }

            tracing::info!(table = %self.table_name, took = ?timer.elapsed(), "imported whole table");
            let err = engine_err.take();
            rc.save_status_checkpoint(
                &self.table_name,
                None,
                err.as_ref(),
                CheckpointStatus::IMPORTED,
            );
            if let Some(err) = err {
                return Err(err);
            }
        }

        // 3. Post-process.
        self.post_process(rc, cp.status, &engines).await
    }

    async fn restore_engine(
        self: &Arc<Self>,
        rc: &Arc<RestoreController>,
        token: &CancellationToken,
        engine_id: usize,
        status: CheckpointStatus,
        chunks: &Arc<Vec<Arc<Mutex<ChunkCheckpoint>>>>,
    ) -> Result<Box<dyn ClosedEngine>> {
        if status >= CheckpointStatus::CLOSED {
            tracing::info!(
                table = %self.table_name,
                engine_id,
                "engine already closed, resuming without rewrite"
            );
            return rc
                .importer
                .unsafe_close_engine(&self.table_name, engine_id)
                .await;
        }

        let timer = Instant::now();
        let engine: Arc<dyn OpenedEngine> = Arc::from(
            rc.importer
                .open_engine(&self.table_name, engine_id)
                .await
                .with_context(|| format!("open engine {}:{}", self.table_name, engine_id))?,
        );

        let chunk_err = Arc::new(OnceError::new());
        let mut tasks = FuturesUnordered::new();

        for (chunk_index, ccp) in chunks.iter().enumerate() {
            let pending = {
                let chunk = ccp.lock().expect("chunk checkpoint poisoned");
                chunk.chunk.offset < chunk.chunk.end_offset
            };
            if !pending {
                continue;
            }
            if token.is_cancelled() {
                return Err(Cancelled.into());
            }
            if chunk_err.is_set() {
                break;
            }

            let key = {
                let chunk = ccp.lock().expect("chunk checkpoint poisoned");
                chunk.key.to_string()
            };
            let cr = ChunkRestore::new(
                chunk_index,
                ccp.clone(),
                rc.parser_builder.as_ref(),
                rc.cfg.source.read_block_size,
                rc.io_workers.clone(),
            )?;
            rc.progress.chunk_pending();

            let worker = rc.region_workers.apply().await;
            let tr = self.clone();
            let rc = rc.clone();
            let token = token.clone();
            let latch = chunk_err.clone();
            let engine = engine.clone();

            tasks.push(tokio::spawn(async move {
                rc.progress.chunk_running();
                let result = cr
                    .restore(
                        &token,
                        &tr,
                        engine_id,
                        engine.as_ref(),
                        &rc.saver,
                        &rc.progress,
                        rc.cfg.source.read_block_size,
                    )
                    .await;
                drop(worker);
                match result {
                    Ok(()) => rc.progress.chunk_finished(),
                    Err(err) => {
                        rc.progress.chunk_failed();
                        let tag = format!("{}:{} {}", tr.table_name, engine_id, key);
                        latch.set(&tag, err);
                    }
                }
            }));
        }

        while let Some(joined) = tasks.next().await {
            if let Err(err) = joined {
                chunk_err.set(
                    &format!("{}:{}", self.table_name, engine_id),
                    anyhow!("chunk task died: {err}"),
                );
            }
        }

        // Wrap-up statistics for debugging.
        let mut total_kv_size = 0u64;
        let mut total_sql_size = 0i64;
        for ccp in chunks.iter() {
            let chunk = ccp.lock().expect("chunk checkpoint poisoned");
            total_kv_size += chunk.checksum.sum_size();
            total_sql_size += chunk.chunk.end_offset;
        }
        tracing::info!(
            table = %self.table_name,
            engine_id,
            took = ?timer.elapsed(),
            read = total_sql_size,
            written = total_kv_size,
            "encoded and wrote engine data"
        );

        let err = chunk_err.take();
        rc.save_status_checkpoint(
            &self.table_name,
            Some(engine_id),
            err.as_ref(),
            CheckpointStatus::ALL_WRITTEN,
        );
        if let Some(err) = err {
            return Err(err);
        }

        let closed = engine.close().await;
        rc.save_status_checkpoint(
            &self.table_name,
            Some(engine_id),
            closed.as_ref().err(),
            CheckpointStatus::CLOSED,
        );
        match closed {
            Ok(closed) => Ok(closed),
            Err(err) => {
                tracing::error!(
                    table = %self.table_name,
                    engine_id,
                    error = ?err,
                    "closing engine failed"
                );
                Err(err)
            }
        }
    }

    async fn import_engine(
        &self,
        rc: &Arc<RestoreController>,
        closed: &dyn ClosedEngine,
        engine_id: usize,
        status: CheckpointStatus,
    ) -> Result<()> {
        if status >= CheckpointStatus::IMPORTED {
            return Ok(());
        }

        // The lock keeps `import` calls from running concurrently across
        // tables; the importer ingests one engine at a time.
        let guard = rc.post_process_lock.lock().await;
        let result = self.import_kv(closed).await;
        drop(guard);

        rc.save_status_checkpoint(
            &self.table_name,
            Some(engine_id),
            result.as_ref().err(),
            CheckpointStatus::IMPORTED,
        );
        result?;

        // Opportunistic level-1 compaction while the importer is idle.
        if rc
            .compact_state
            .compare_exchange(
                COMPACT_STATE_IDLE,
                COMPACT_STATE_DOING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let rc = rc.clone();
            tokio::spawn(async move {
                if let Err(err) = rc.importer.compact(LEVEL1_COMPACT).await {
                    tracing::warn!(level = LEVEL1_COMPACT, error = ?err, "compaction failed");
                }
                rc.compact_state.store(COMPACT_STATE_IDLE, Ordering::SeqCst);
            });
        }

        Ok(())
    }

    async fn import_kv(&self, closed: &dyn ClosedEngine) -> Result<()> {
        tracing::info!(table = %self.table_name, "importing engine");
        let start = Instant::now();

        if let Err(err) = closed.import().await {
            if !crate::error::is_cancelled(&err) {
                tracing::error!(table = %self.table_name, error = ?err, "engine import failed");
            }
            return Err(err);
        }
        if let Err(err) = closed.cleanup().await {
            tracing::warn!(table = %self.table_name, error = ?err, "engine cleanup failed");
        }

        tracing::info!(table = %self.table_name, took = ?start.elapsed(), "engine imported");
        Ok(())
    }

    async fn post_process(
        &self,
        rc: &Arc<RestoreController>,
        status: CheckpointStatus,
        engines: &[EngineRun],
    ) -> Result<()> {
        set_session_concurrency_vars(rc.catalog.as_ref(), &rc.cfg.tidb).await;

        // 3. Point the auto-increment counter past every allocated row ID.
        if status < CheckpointStatus::ALTERED_AUTO_INC {
            let guard = rc.alter_table_lock.lock().await;
            let result = self.restore_table_meta(rc).await;
            drop(guard);
            rc.save_status_checkpoint(
                &self.table_name,
                None,
                result.as_ref().err(),
                CheckpointStatus::ALTERED_AUTO_INC,
            );
            if let Err(err) = result {
                tracing::error!(
                    table = %self.table_name,
                    auto_increment = self.alloc.base() + 1,
                    error = ?err,
                    "failed to set table auto_increment"
                );
                return Err(err);
            }
        }

        // 4. Compare the local checksum against the server.
        if status < CheckpointStatus::CHECKSUMMED {
            if !rc.cfg.post_restore.checksum {
                tracing::info!(table = %self.table_name, "skip checksum");
                rc.save_status_checkpoint(
                    &self.table_name,
                    None,
                    None,
                    CheckpointStatus::CHECKSUM_SKIPPED,
                );
            } else {
                let result = self.compare_checksum(rc, engines).await;
                rc.save_status_checkpoint(
                    &self.table_name,
                    None,
                    result.as_ref().err(),
                    CheckpointStatus::CHECKSUMMED,
                );
                if let Err(err) = result {
                    tracing::error!(table = %self.table_name, error = ?err, "checksum failed");
                    return Err(err);
                }
            }
        }

        // 5. Refresh statistics.
        if status < CheckpointStatus::ANALYZED {
            if !rc.cfg.post_restore.analyze {
                tracing::info!(table = %self.table_name, "skip analyze");
                rc.save_status_checkpoint(
                    &self.table_name,
                    None,
                    None,
                    CheckpointStatus::ANALYZE_SKIPPED,
                );
            } else {
                let timer = Instant::now();
                let result = analyze_table(rc.catalog.as_ref(), &self.table_name).await;
                rc.save_status_checkpoint(
                    &self.table_name,
                    None,
                    result.as_ref().err(),
                    CheckpointStatus::ANALYZED,
                );
                if let Err(err) = result {
                    tracing::error!(table = %self.table_name, error = ?err, "analyze failed");
                    return Err(err);
                }
                tracing::info!(table = %self.table_name, took = ?timer.elapsed(), "analyzed");
            }
        }

        Ok(())
    }

    async fn restore_table_meta(&self, rc: &Arc<RestoreController>) -> Result<()> {
        let timer = Instant::now();
        alter_auto_increment(
            rc.catalog.as_ref(),
            &self.table_meta.db,
            &self.table_meta.name,
            self.alloc.base() + 1,
        )
        .await?;
        tracing::info!(table = %self.table_name, took = ?timer.elapsed(), "set auto_increment");
        Ok(())
    }

    async fn compare_checksum(
        &self,
        rc: &Arc<RestoreController>,
        engines: &[EngineRun],
    ) -> Result<()> {
        let mut local = KvChecksum::default();
        for engine in engines {
            for ccp in engine.chunks.iter() {
                let chunk = ccp.lock().expect("chunk checkpoint poisoned");
                local.add(&chunk.checksum);
            }
        }

        let start = Instant::now();
        let remote = do_checksum(rc.catalog.as_ref(), &self.table_name).await?;

        if remote.checksum != local.sum()
            || remote.total_kvs != local.sum_kvs()
            || remote.total_bytes != local.sum_size()
        {
            bail!(
                "checksum mismatched remote vs local => (checksum: {} vs {}) (total_kvs: {} vs {}) (total_bytes: {} vs {})",
                remote.checksum,
                local.sum(),
                remote.total_kvs,
                local.sum_kvs(),
                remote.total_bytes,
                local.sum_size(),
            );
        }

        tracing::info!(
            table = %self.table_name,
            checksum = %local,
            took = ?start.elapsed(),
            "checksum pass"
        );
        Ok(())
    }

    pub(crate) fn populate_chunks(&self, cfg: &Config, cp: &mut TableCheckpoint) -> Result<()> {
        tracing::info!(table = %self.table_name, "loading chunks");
        let timer = Instant::now();

        let regions = make_table_regions(
            &self.table_meta,
            cfg.source.batch_size,
            cfg.source.batch_import_ratio,
        )?;

        for region in &regions {
            while region.engine_id >= cp.engines.len() {
                cp.engines.push(EngineCheckpoint {
                    status: CheckpointStatus::LOADED,
                    chunks: Vec::new(),
                });
            }
            cp.engines[region.engine_id].chunks.push(ChunkCheckpoint {
                key: ChunkKey {
                    path: region.file.clone(),
                    offset: region.chunk.offset,
                },
                columns: None,
                should_include_row_id: false,
                chunk: region.chunk,
                checksum: KvChecksum::default(),
            });
        }

        tracing::info!(
            table = %self.table_name,
            engines = cp.engines.len(),
            chunks = regions.len(),
            took = ?timer.elapsed(),
            "loaded chunks"
        );
        Ok(())
    }

    pub(crate) fn initialize_columns(
        &self,
        columns: Option<Vec<u8>>,
        ccp: &mut ChunkCheckpoint,
    ) {
        initialize_columns(&self.table_info, columns, ccp);
    }
}

/// Decide the effective column list of a chunk, injecting the hidden row-ID
/// column when the table's primary key is not the row handle.
pub(crate) fn initialize_columns(
    table_info: &TableInfo,
    columns: Option<Vec<u8>>,
    ccp: &mut ChunkCheckpoint,
) {
    let columns = columns.unwrap_or_default();
    let should_include_row_id =
        !table_info.pk_is_handle && !mentions_row_id_column(&columns);

    let columns = if should_include_row_id {
        if !columns.is_empty() {
            // A column listing already exists, append the hidden column.
            let mut buf = columns[..columns.len() - 1].to_vec();
            buf.extend_from_slice(format!(",`{EXTRA_HANDLE_COLUMN}`)").as_bytes());
            buf
        } else {
            // Recreate the listing from the declared columns.
            let mut buf = Vec::new();
            buf.push(b'(');
            for column in &table_info.columns {
                buf.push(b'`');
                buf.extend_from_slice(column.name.as_bytes());
                buf.extend_from_slice(b"`,");
            }
            buf.extend_from_slice(format!("`{EXTRA_HANDLE_COLUMN}`)").as_bytes());
            buf
        }
    } else {
        columns
    };

    ccp.columns = Some(columns);
    ccp.should_include_row_id = should_include_row_id;
}

fn mentions_row_id_column(columns: &[u8]) -> bool {
    let name = EXTRA_HANDLE_COLUMN.as_bytes();
    let lower: Vec<u8> = columns.iter().map(u8::to_ascii_lowercase).collect();
    if lower.len() < name.len() {
        return false;
    }
    (0..=lower.len() - name.len()).any(|i| {
        lower[i..i + name.len()] == *name
            && (i == 0 || !is_ident_byte(lower[i - 1]))
            && (i + name.len() == lower.len() || !is_ident_byte(lower[i + name.len()]))
    })
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
