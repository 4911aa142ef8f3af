//! Top-level restore controller: prerequisite checks, schema restore, the
//! per-table fan-out, final compaction, mode restore, and checkpoint cleanup.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::catalog::{unique_table, DbInfo, SqlCatalog};
use crate::checkpoint::{
    open_checkpoint_store, CheckpointMerger, CheckpointStatus, CheckpointStore,
};
use crate::coalescer::{CheckpointSender, Coalescer};
use crate::config::Config;
use crate::error::{is_cancelled, Cancelled, OnceError};
use crate::importer::{Importer, SwitchMode, FULL_LEVEL_COMPACT};
use crate::kv::KvEncoderBuilder;
use crate::mydump::{DatabaseMeta, ParserBuilder};
use crate::table::TableRestore;
use crate::version::{check_pd_version, check_tidb_version, check_tikv_version};
use crate::worker::Pool;

pub(crate) const COMPACT_STATE_IDLE: i32 = 0;
pub(crate) const COMPACT_STATE_DOING: i32 = 1;

/// Run-wide progress counters, read by the periodic progress report.
#[derive(Default)]
pub struct Progress {
    chunks_estimated: AtomicU64,
    chunks_pending: AtomicU64,
    chunks_running: AtomicU64,
    chunks_finished: AtomicU64,
    chunks_failed: AtomicU64,
    tables_total: AtomicU64,
    tables_completed: AtomicU64,
    bytes_read: AtomicU64,
}

impl Progress {
    pub(crate) fn add_estimated(&self, chunks: u64) {
        self.chunks_estimated.fetch_add(chunks, Ordering::Relaxed);
    }

    pub(crate) fn chunk_pending(&self) {
        self.chunks_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_running(&self) {
        self.chunks_running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_finished(&self) {
        self.chunks_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_tables_total(&self, tables: u64) {
        self.tables_total.store(tables, Ordering::Relaxed);
    }

    pub(crate) fn table_completed(&self) {
        self.tables_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn estimated_chunks(&self) -> u64 {
        self.chunks_estimated.load(Ordering::Relaxed)
    }

    pub fn finished_chunks(&self) -> u64 {
        self.chunks_finished.load(Ordering::Relaxed)
    }

    pub fn failed_chunks(&self) -> u64 {
        self.chunks_failed.load(Ordering::Relaxed)
    }

    pub fn completed_tables(&self) -> u64 {
        self.tables_completed.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct ErrorSummaries {
    summary: Mutex<BTreeMap<String, (CheckpointStatus, String)>>,
}

impl ErrorSummaries {
    pub(crate) fn record(&self, table_name: &str, err: &anyhow::Error, status: CheckpointStatus) {
        let mut summary = self.summary.lock().expect("error summaries poisoned");
        summary.insert(table_name.to_string(), (status, format!("{err:#}")));
    }

    fn emit_log(&self) {
        let summary = self.summary.lock().expect("error summaries poisoned");
        if summary.is_empty() {
            return;
        }
        let mut msg = format!(
            "Totally **{}** tables failed to be imported.\n",
            summary.len()
        );
        for (table_name, (status, err)) in summary.iter() {
            let _ = writeln!(msg, "- [{table_name}] [{}] {err}", status.name());
        }
        tracing::error!("{msg}");
    }
}

pub struct RestoreController {
    pub(crate) cfg: Config,
    db_metas: Vec<DatabaseMeta>,
    db_infos: RwLock<HashMap<String, DbInfo>>,
    pub(crate) table_workers: Pool,
    pub(crate) region_workers: Pool,
    pub(crate) io_workers: Arc<Pool>,
    pub(crate) importer: Arc<dyn Importer>,
    pub(crate) catalog: Arc<dyn SqlCatalog>,
    pub(crate) encoder_builder: Arc<dyn KvEncoderBuilder>,
    pub(crate) parser_builder: Arc<dyn ParserBuilder>,
    pub(crate) checkpoint_store: Arc<dyn CheckpointStore>,
    coalescer: Coalescer,
    pub(crate) saver: CheckpointSender,
    /// Serializes engine imports across tables.
    pub(crate) post_process_lock: tokio::sync::Mutex<()>,
    /// Serializes `ALTER TABLE` statements.
    pub(crate) alter_table_lock: tokio::sync::Mutex<()>,
    pub(crate) compact_state: AtomicI32,
    pub(crate) progress: Progress,
    pub(crate) error_summaries: ErrorSummaries,
}

impl RestoreController {
    pub fn new(
        cfg: Config,
        db_metas: Vec<DatabaseMeta>,
        importer: Arc<dyn Importer>,
        catalog: Arc<dyn SqlCatalog>,
        encoder_builder: Arc<dyn KvEncoderBuilder>,
        parser_builder: Arc<dyn ParserBuilder>,
    ) -> Result<Arc<Self>> {
        let checkpoint_store = open_checkpoint_store(&cfg, catalog.clone())?;
        Ok(Self::with_store(
            cfg,
            db_metas,
            importer,
            catalog,
            encoder_builder,
            parser_builder,
            checkpoint_store,
        ))
    }

    pub fn with_store(
        cfg: Config,
        db_metas: Vec<DatabaseMeta>,
        importer: Arc<dyn Importer>,
        catalog: Arc<dyn SqlCatalog>,
        encoder_builder: Arc<dyn KvEncoderBuilder>,
        parser_builder: Arc<dyn ParserBuilder>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Arc<Self> {
        let coalescer = Coalescer::spawn(checkpoint_store.clone());
        let saver = coalescer.sender();
        Arc::new(Self {
            table_workers: Pool::new(cfg.app.table_concurrency, "table"),
            region_workers: Pool::new(cfg.app.region_concurrency, "region"),
            io_workers: Arc::new(Pool::new(cfg.app.io_concurrency, "io")),
            cfg,
            db_metas,
            db_infos: RwLock::new(HashMap::new()),
            importer,
            catalog,
            encoder_builder,
            parser_builder,
            checkpoint_store,
            coalescer,
            saver,
            post_process_lock: tokio::sync::Mutex::new(()),
            alter_table_lock: tokio::sync::Mutex::new(()),
            compact_state: AtomicI32::new(COMPACT_STATE_IDLE),
            progress: Progress::default(),
            error_summaries: ErrorSummaries::default(),
        })
    }

    /// Run the whole restore. Cancellation stops the sequence without being
    /// reported as a failure; the coalescer is drained either way.
    pub async fn run(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let timer = Instant::now();

        let result = match self.run_phases(token).await {
            Ok(()) => Ok(()),
            Err(err) if is_cancelled(&err) => {
                tracing::info!(error = ?err, "user terminated");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = ?err, "restore failed");
                Err(err)
            }
        };

        tracing::info!(took = ?timer.elapsed(), "the whole procedure finished");
        self.error_summaries.emit_log();
        self.coalescer.close_and_wait().await;
        result
    }

    async fn run_phases(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        self.check_requirements().await?;
        self.restore_schema().await?;
        self.restore_tables(token).await?;
        self.full_compact(token).await?;
        self.switch_to_normal_mode().await;
        self.clean_checkpoints().await
    }

    async fn check_requirements(&self) -> Result<()> {
        if !self.cfg.app.check_requirements {
            return Ok(());
        }
        let client = reqwest::Client::new();
        check_tidb_version(&client, &self.cfg.tidb).await?;
        check_pd_version(&client, &self.cfg.tidb.pd_addr).await?;
        check_tikv_version(&client, &self.cfg.tidb.pd_addr).await?;
        Ok(())
    }

    async fn restore_schema(&self) -> Result<()> {
        if !self.cfg.source.no_schema {
            for db_meta in &self.db_metas {
                let timer = Instant::now();
                tracing::info!(db = %db_meta.name, "restoring table schemas");
                let schemas: HashMap<String, String> = db_meta
                    .tables
                    .iter()
                    .map(|table| (table.name.clone(), table.schema.clone()))
                    .collect();
                self.catalog
                    .init_schema(&db_meta.name, &schemas)
                    .await
                    .with_context(|| format!("init schema for database {}", db_meta.name))?;
                tracing::info!(db = %db_meta.name, took = ?timer.elapsed(), "restored table schemas");
            }
        }

        let db_infos = self.catalog.load_schema_info(&self.db_metas).await?;
        self.checkpoint_store.initialize(&db_infos).await?;
        *self.db_infos.write().expect("db infos poisoned") = db_infos;

        // Estimate the chunk count for progress reporting.
        let estimated: u64 = self
            .db_metas
            .iter()
            .flat_map(|db| db.tables.iter())
            .map(|table| table.data_files.len() as u64)
            .sum();
        self.progress.add_estimated(estimated);
        Ok(())
    }

    async fn restore_tables(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let timer = Instant::now();
        let restore_err = Arc::new(OnceError::new());

        let stop = CancellationToken::new();
        let periodic = {
            let rc = self.clone();
            let token = token.clone();
            let stop = stop.clone();
            tokio::spawn(async move { rc.run_periodic_actions(&token, &stop).await })
        };

        let db_infos = self.db_infos.read().expect("db infos poisoned").clone();
        let total_tables: u64 = self
            .db_metas
            .iter()
            .map(|db| db.tables.len() as u64)
            .sum();
        self.progress.set_tables_total(total_tables);

        let mut tasks = FuturesUnordered::new();
        let spawn_result: Result<()> = async {
            for db_meta in &self.db_metas {
                let Some(db_info) = db_infos.get(&db_meta.name) else {
                    tracing::error!(db = %db_meta.name, "database not found in schema info");
                    continue;
                };
                for table_meta in &db_meta.tables {
                    let Some(table_info) = db_info.tables.get(&table_meta.name) else {
                        bail!("table info {} not found", table_meta.name);
                    };

                    if token.is_cancelled() {
                        return Err(Cancelled.into());
                    }

                    let table_name = unique_table(&db_info.name, &table_info.name);
                    let cp = self.checkpoint_store.get(&table_name).await?;
                    if cp.status.is_invalid() {
                        bail!(
                            "Checkpoint for {table_name} has invalid status: {}",
                            cp.status.0
                        );
                    }

                    let tr = TableRestore::new(
                        table_name.clone(),
                        table_meta.clone(),
                        table_info.clone(),
                        &cp,
                        self.encoder_builder.as_ref(),
                        &self.cfg.tidb.sql_mode,
                    )?;

                    let rc = self.clone();
                    let token = token.clone();
                    let latch = restore_err.clone();
                    tasks.push(tokio::spawn(async move {
                        match tr.restore_table(&rc, &token, cp).await {
                            Ok(()) => rc.progress.table_completed(),
                            Err(err) => latch.set(&tr.table_name, err),
                        }
                    }));
                }
            }
            Ok(())
        }
        .await;

        while let Some(joined) = tasks.next().await {
            if let Err(err) = joined {
                restore_err.set("restore tables", anyhow::anyhow!("table task died: {err}"));
            }
        }
        stop.cancel();
        let _ = periodic.await;

        tracing::info!(took = ?timer.elapsed(), "restored all tables data");
        spawn_result?;
        match restore_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_periodic_actions(&self, token: &CancellationToken, stop: &CancellationToken) {
        self.switch_to_import_mode().await;

        let period_start = tokio::time::Instant::now();
        let mut switch_ticker = tokio::time::interval_at(
            period_start + self.cfg.cron.switch_mode,
            self.cfg.cron.switch_mode,
        );
        let mut progress_ticker = tokio::time::interval_at(
            period_start + self.cfg.cron.log_progress,
            self.cfg.cron.log_progress,
        );
        let start = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::warn!("stopping periodic actions, context cancelled");
                    return;
                }
                _ = stop.cancelled() => {
                    tracing::info!("everything imported, stopping periodic actions");
                    return;
                }
                // The storage nodes drop the import-mode lease on their own,
                // so it has to be renewed periodically.
                _ = switch_ticker.tick() => self.switch_to_import_mode().await,
                _ = progress_ticker.tick() => self.log_progress(start),
            }
        }
    }

    fn log_progress(&self, start: Instant) {
        let nanoseconds = start.elapsed().as_nanos() as f64;
        let estimated = self.progress.estimated_chunks() as f64;
        let finished = self.progress.finished_chunks() as f64;
        let total_tables = self.progress.tables_total.load(Ordering::Relaxed) as f64;
        let completed_tables = self.progress.completed_tables() as f64;
        let bytes_read = self.progress.bytes_read() as f64;

        let remaining = if finished >= estimated {
            ", post-processing".to_string()
        } else if finished > 0.0 {
            let remain_nanos = (estimated / finished - 1.0) * nanoseconds;
            let remain = Duration::from_secs((remain_nanos / 1e9).round() as u64);
            format!(", remaining {remain:?}")
        } else {
            String::new()
        };

        let chunk_pct = if estimated > 0.0 {
            finished / estimated * 100.0
        } else {
            0.0
        };
        let table_pct = if total_tables > 0.0 {
            completed_tables / total_tables * 100.0
        } else {
            0.0
        };
        // A speed of 28 MiB/s roughly corresponds to 100 GiB/hour.
        let speed = bytes_read / (1048576e-9 * nanoseconds);

        tracing::info!(
            "progress: {finished:.0}/{estimated:.0} chunks ({chunk_pct:.1}%), \
             {completed_tables:.0}/{total_tables:.0} tables ({table_pct:.1}%), \
             speed {speed:.2} MiB/s{remaining}"
        );
    }

    async fn switch_to_import_mode(&self) {
        self.switch_tikv_mode(SwitchMode::Import).await;
    }

    async fn switch_to_normal_mode(&self) {
        self.switch_tikv_mode(SwitchMode::Normal).await;
    }

    async fn switch_tikv_mode(&self, mode: SwitchMode) {
        if let Err(err) = self.importer.switch_mode(mode).await {
            tracing::warn!(%mode, error = ?err, "cannot switch mode");
        }
    }

    /// Final full compaction over everything that was ingested. Waits for an
    /// in-flight level-1 compaction by spinning on the compact-state CAS.
    async fn full_compact(&self, token: &CancellationToken) -> Result<()> {
        if !self.cfg.post_restore.compact {
            tracing::info!("skip full compaction");
            return Ok(());
        }

        tracing::info!("waiting for existing level 1 compaction to finish");
        let start = Instant::now();
        while self
            .compact_state
            .compare_exchange(
                COMPACT_STATE_IDLE,
                COMPACT_STATE_DOING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            if token.is_cancelled() {
                return Err(Cancelled.into());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::info!(took = ?start.elapsed(), "level 1 compaction finished");

        self.importer
            .compact(FULL_LEVEL_COMPACT)
            .await
            .context("full compaction")
    }

    async fn clean_checkpoints(&self) -> Result<()> {
        if !self.cfg.checkpoint.enable || self.cfg.checkpoint.keep_after_success {
            tracing::info!("skip clean checkpoints");
            return Ok(());
        }
        let timer = Instant::now();
        self.checkpoint_store
            .remove("all")
            .await
            .context("clean checkpoints")?;
        tracing::info!(took = ?timer.elapsed(), "cleaned checkpoints");
        Ok(())
    }

    /// Emit a status checkpoint for a table or one of its engines.
    ///
    /// A real error divides the status into the invalid range and records an
    /// error summary; cancellation saves nothing so the checkpoint stays at
    /// its last durable status, ready to resume.
    pub(crate) fn save_status_checkpoint(
        &self,
        table_name: &str,
        engine_id: Option<usize>,
        err: Option<&anyhow::Error>,
        status: CheckpointStatus,
    ) {
        let mut saved_status = status;
        match err {
            None => {}
            Some(err) if !is_cancelled(err) => {
                saved_status = status.invalidated();
                self.error_summaries.record(table_name, err, status);
            }
            Some(_) => return,
        }
        self.saver.send(
            table_name.to_string(),
            CheckpointMerger::Status {
                engine_id,
                status: saved_status,
            },
        );
    }

    /// Read-only view of the progress counters.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}
