//! Durable restore progress: the status ladder, per-chunk checkpoints,
//! commutative diffs, and the three store back-ends (null, file, SQL).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{DbInfo, SqlCatalog};
use crate::config::Config;
use crate::mydump::Chunk;
use crate::verification::KvChecksum;

/// Monotonic progress marker. Higher is further along; dividing by 10 moves
/// a status into the invalid range below `MAX_INVALID`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CheckpointStatus(pub u8);

impl CheckpointStatus {
    pub const MISSING: Self = Self(0);
    pub const MAX_INVALID: Self = Self(25);
    pub const LOADED: Self = Self(30);
    pub const ALL_WRITTEN: Self = Self(60);
    pub const CLOSED: Self = Self(90);
    pub const IMPORTED: Self = Self(120);
    pub const ALTERED_AUTO_INC: Self = Self(150);
    pub const CHECKSUM_SKIPPED: Self = Self(170);
    pub const CHECKSUMMED: Self = Self(180);
    pub const ANALYZE_SKIPPED: Self = Self(200);
    pub const ANALYZED: Self = Self(210);

    /// The unrecoverable twin of this status.
    pub fn invalidated(self) -> Self {
        Self(self.0 / 10)
    }

    pub fn is_invalid(self) -> bool {
        self <= Self::MAX_INVALID
    }

    /// Short name used in error summaries and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::LOADED => "loaded",
            Self::ALL_WRITTEN => "written",
            Self::CLOSED => "closed",
            Self::IMPORTED => "imported",
            Self::ALTERED_AUTO_INC => "altered_auto_inc",
            Self::CHECKSUM_SKIPPED | Self::CHECKSUMMED => "checksum",
            Self::ANALYZE_SKIPPED | Self::ANALYZED => "analyze",
            _ => "invalid",
        }
    }
}

impl fmt::Debug for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckpointStatus({}:{})", self.0, self.name())
    }
}

/// Stable identity of a chunk within a table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub path: PathBuf,
    pub offset: i64,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.offset)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub key: ChunkKey,
    /// Column list cached from the file on first read; `Some(empty)` means
    /// "initialized, no explicit column list".
    pub columns: Option<Vec<u8>>,
    pub should_include_row_id: bool,
    pub chunk: Chunk,
    pub checksum: KvChecksum,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    pub status: CheckpointStatus,
    pub chunks: Vec<ChunkCheckpoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub status: CheckpointStatus,
    pub alloc_base: i64,
    pub engines: Vec<EngineCheckpoint>,
}

impl TableCheckpoint {
    pub fn new() -> Self {
        Self {
            status: CheckpointStatus::LOADED,
            alloc_base: 0,
            engines: Vec::new(),
        }
    }

    pub fn count_chunks(&self) -> usize {
        self.engines.iter().map(|engine| engine.chunks.len()).sum()
    }
}

impl Default for TableCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkDiff {
    pub pos: i64,
    pub row_id: i64,
    pub checksum: KvChecksum,
}

#[derive(Clone, Debug, Default)]
pub struct EngineDiff {
    pub status: Option<CheckpointStatus>,
    pub chunks: BTreeMap<ChunkKey, ChunkDiff>,
}

/// Accumulated deltas for one table. Fields merge commutatively: max for
/// monotonic fields, greater-pos-wins for chunk progress, invalid sticks.
#[derive(Clone, Debug, Default)]
pub struct TableCheckpointDiff {
    pub status: Option<CheckpointStatus>,
    pub alloc_base: Option<i64>,
    pub engines: BTreeMap<usize, EngineDiff>,
}

fn merge_status(current: Option<CheckpointStatus>, incoming: CheckpointStatus) -> CheckpointStatus {
    match current {
        None => incoming,
        Some(cur) if cur.is_invalid() => cur,
        Some(_) if incoming.is_invalid() => incoming,
        Some(cur) => cur.max(incoming),
    }
}

/// One checkpoint delta, tagged by what it updates.
#[derive(Clone, Debug)]
pub enum CheckpointMerger {
    /// Advance (or invalidate) the status of the whole table
    /// (`engine_id: None`) or of one engine.
    Status {
        engine_id: Option<usize>,
        status: CheckpointStatus,
    },
    /// Raise the row-ID allocation base.
    Rebase { alloc_base: i64 },
    /// Record chunk progress acknowledged by the importer.
    Chunk {
        engine_id: usize,
        key: ChunkKey,
        pos: i64,
        row_id: i64,
        checksum: KvChecksum,
    },
}

impl CheckpointMerger {
    pub fn merge_into(&self, diff: &mut TableCheckpointDiff) {
        match self {
            CheckpointMerger::Status { engine_id, status } => match engine_id {
                None => diff.status = Some(merge_status(diff.status, *status)),
                Some(id) => {
                    let engine = diff.engines.entry(*id).or_default();
                    engine.status = Some(merge_status(engine.status, *status));
                }
            },
            CheckpointMerger::Rebase { alloc_base } => {
                diff.alloc_base = Some(diff.alloc_base.unwrap_or(i64::MIN).max(*alloc_base));
            }
            CheckpointMerger::Chunk {
                engine_id,
                key,
                pos,
                row_id,
                checksum,
            } => {
                let engine = diff.engines.entry(*engine_id).or_default();
                let chunk = engine.chunks.entry(key.clone()).or_default();
                if *pos >= chunk.pos {
                    chunk.pos = *pos;
                    chunk.row_id = *row_id;
                    chunk.checksum = *checksum;
                }
            }
        }
    }
}

/// Apply a merged diff to an in-memory checkpoint. Shared by the file
/// back-end and by the coalescer tests.
pub fn apply_diff(cp: &mut TableCheckpoint, diff: &TableCheckpointDiff) {
    if let Some(status) = diff.status {
        cp.status = merge_status(Some(cp.status), status);
    }
    if let Some(alloc_base) = diff.alloc_base {
        cp.alloc_base = cp.alloc_base.max(alloc_base);
    }
    for (engine_id, engine_diff) in &diff.engines {
        let Some(engine) = cp.engines.get_mut(*engine_id) else {
            continue;
        };
        if let Some(status) = engine_diff.status {
            engine.status = merge_status(Some(engine.status), status);
        }
        for (key, chunk_diff) in &engine_diff.chunks {
            let Some(chunk) = engine.chunks.iter_mut().find(|c| c.key == *key) else {
                continue;
            };
            if chunk_diff.pos >= chunk.chunk.offset {
                chunk.chunk.offset = chunk_diff.pos;
                chunk.chunk.prev_row_id_max = chunk_diff.row_id;
                chunk.checksum = chunk_diff.checksum;
            }
        }
    }
}

/// Durable keyed store of per-table restore progress.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn initialize(&self, db_infos: &HashMap<String, DbInfo>) -> Result<()>;

    async fn get(&self, table_name: &str) -> Result<TableCheckpoint>;

    async fn insert_engine_checkpoints(
        &self,
        table_name: &str,
        engines: &[EngineCheckpoint],
    ) -> Result<()>;

    /// Persist one batch of diffs. Crash consistent: on recovery either all
    /// deltas of the call are visible or none.
    async fn update(&self, diffs: &HashMap<String, TableCheckpointDiff>) -> Result<()>;

    /// Remove the checkpoint of one table, or everything for `"all"`.
    async fn remove(&self, table_name: &str) -> Result<()>;
}

/// Choose a back-end from the configuration.
pub fn open_checkpoint_store(
    cfg: &Config,
    catalog: Arc<dyn SqlCatalog>,
) -> Result<Arc<dyn CheckpointStore>> {
    if !cfg.checkpoint.enable {
        return Ok(Arc::new(NullCheckpointStore));
    }
    match cfg.checkpoint.driver.as_str() {
        "mysql" => Ok(Arc::new(SqlCheckpointStore::new(
            catalog,
            cfg.checkpoint.schema.clone(),
        ))),
        "file" => Ok(Arc::new(FileCheckpointStore::new(
            PathBuf::from(&cfg.checkpoint.dsn),
        ))),
        other => bail!("unknown checkpoint driver {other}"),
    }
}

/// No-op store used when checkpoints are disabled. Every `get` returns a
/// fresh `Loaded` checkpoint, so a restarted run starts from scratch.
pub struct NullCheckpointStore;

#[async_trait]
impl CheckpointStore for NullCheckpointStore {
    async fn initialize(&self, _db_infos: &HashMap<String, DbInfo>) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _table_name: &str) -> Result<TableCheckpoint> {
        Ok(TableCheckpoint::new())
    }

    async fn insert_engine_checkpoints(
        &self,
        _table_name: &str,
        _engines: &[EngineCheckpoint],
    ) -> Result<()> {
        Ok(())
    }

    async fn update(&self, _diffs: &HashMap<String, TableCheckpointDiff>) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _table_name: &str) -> Result<()> {
        Ok(())
    }
}

/// File-backed store: the whole run serialized as one JSON blob, rewritten
/// atomically (temp file + rename) on every update.
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, TableCheckpoint>>,
}

impl FileCheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    fn persist(&self, state: &BTreeMap<String, TableCheckpoint>) -> Result<()> {
        let payload = serde_json::to_vec(state).context("serialize checkpoints")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload).context("write checkpoint temp file")?;
        fs::rename(&tmp_path, &self.path).context("replace checkpoint file")?;
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, TableCheckpoint>> {
        match fs::read(&self.path) {
            Ok(payload) => serde_json::from_slice(&payload).context("parse checkpoint file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err).context("read checkpoint file"),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn initialize(&self, db_infos: &HashMap<String, DbInfo>) -> Result<()> {
        let mut state = self.state.lock().expect("checkpoint state poisoned");
        *state = self.load()?;
        for db in db_infos.values() {
            for table in db.tables.values() {
                state
                    .entry(crate::catalog::unique_table(&db.name, &table.name))
                    .or_insert_with(TableCheckpoint::new);
            }
        }
        self.persist(&state)
    }

    async fn get(&self, table_name: &str) -> Result<TableCheckpoint> {
        let state = self.state.lock().expect("checkpoint state poisoned");
        state
            .get(table_name)
            .cloned()
            .with_context(|| format!("no checkpoint for table {table_name}"))
    }

    async fn insert_engine_checkpoints(
        &self,
        table_name: &str,
        engines: &[EngineCheckpoint],
    ) -> Result<()> {
        let mut state = self.state.lock().expect("checkpoint state poisoned");
        let cp = state
            .get_mut(table_name)
            .with_context(|| format!("no checkpoint for table {table_name}"))?;
        cp.engines = engines.to_vec();
        self.persist(&state)
    }

    async fn update(&self, diffs: &HashMap<String, TableCheckpointDiff>) -> Result<()> {
        let mut state = self.state.lock().expect("checkpoint state poisoned");
        for (table_name, diff) in diffs {
            if let Some(cp) = state.get_mut(table_name) {
                apply_diff(cp, diff);
            }
        }
        self.persist(&state)
    }

    async fn remove(&self, table_name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("checkpoint state poisoned");
        if table_name == "all" {
            state.clear();
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).context("remove checkpoint file"),
            }
        } else {
            state.remove(table_name);
            self.persist(&state)
        }
    }
}

/// SQL-backed store. Three tables under a dedicated schema; every `update`
/// becomes one batched transaction through the catalog.
pub struct SqlCheckpointStore {
    catalog: Arc<dyn SqlCatalog>,
    schema: String,
}

impl SqlCheckpointStore {
    pub fn new(catalog: Arc<dyn SqlCatalog>, schema: String) -> Self {
        Self { catalog, schema }
    }

    fn table_table(&self) -> String {
        format!("`{}`.`table_v1`", self.schema)
    }

    fn engine_table(&self) -> String {
        format!("`{}`.`engine_v1`", self.schema)
    }

    fn chunk_table(&self) -> String {
        format!("`{}`.`chunk_v1`", self.schema)
    }
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn parse_field<T: std::str::FromStr>(row: &[String], index: usize, what: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    row.get(index)
        .with_context(|| format!("checkpoint row missing column {index} ({what})"))?
        .parse()
        .with_context(|| format!("parse checkpoint column {what}"))
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn initialize(&self, db_infos: &HashMap<String, DbInfo>) -> Result<()> {
        let mut stmts = vec![
            format!("CREATE DATABASE IF NOT EXISTS `{}`", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 table_name varchar(261) NOT NULL PRIMARY KEY, \
                 status tinyint unsigned NOT NULL DEFAULT 30, \
                 alloc_base bigint NOT NULL DEFAULT 0)",
                self.table_table()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 table_name varchar(261) NOT NULL, \
                 engine_id int unsigned NOT NULL, \
                 status tinyint unsigned NOT NULL DEFAULT 30, \
                 PRIMARY KEY(table_name, engine_id))",
                self.engine_table()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 table_name varchar(261) NOT NULL, \
                 engine_id int unsigned NOT NULL, \
                 path varchar(2048) NOT NULL, \
                 offset bigint NOT NULL, \
                 columns text NULL, \
                 should_include_row_id BOOL NOT NULL, \
                 pos bigint NOT NULL, \
                 end_offset bigint NOT NULL, \
                 prev_rowid_max bigint NOT NULL, \
                 rowid_max bigint NOT NULL, \
                 checksum_sum bigint unsigned NOT NULL DEFAULT 0, \
                 checksum_kvs bigint unsigned NOT NULL DEFAULT 0, \
                 checksum_bytes bigint unsigned NOT NULL DEFAULT 0, \
                 PRIMARY KEY(table_name, engine_id, path(500), offset))",
                self.chunk_table()
            ),
        ];
        for db in db_infos.values() {
            for table in db.tables.values() {
                let name = crate::catalog::unique_table(&db.name, &table.name);
                stmts.push(format!(
                    "INSERT IGNORE INTO {} (table_name) VALUES ({})",
                    self.table_table(),
                    sql_quote(&name)
                ));
            }
        }
        self.catalog
            .exec_batch(&stmts)
            .await
            .context("initialize checkpoint schema")
    }

    async fn get(&self, table_name: &str) -> Result<TableCheckpoint> {
        let quoted = sql_quote(table_name);
        let table_row = self
            .catalog
            .query_row(&format!(
                "SELECT status, alloc_base FROM {} WHERE table_name = {}",
                self.table_table(),
                quoted
            ))
            .await
            .with_context(|| format!("load checkpoint for {table_name}"))?;
        let status = CheckpointStatus(parse_field(&table_row, 0, "status")?);
        let alloc_base = parse_field(&table_row, 1, "alloc_base")?;

        let engine_rows = self
            .catalog
            .query_rows(&format!(
                "SELECT engine_id, status FROM {} WHERE table_name = {} ORDER BY engine_id",
                self.engine_table(),
                quoted
            ))
            .await?;
        let mut engines = Vec::with_capacity(engine_rows.len());
        for row in &engine_rows {
            let engine_id: usize = parse_field(row, 0, "engine_id")?;
            if engine_id != engines.len() {
                bail!("engine checkpoints for {table_name} are not contiguous");
            }
            engines.push(EngineCheckpoint {
                status: CheckpointStatus(parse_field(row, 1, "status")?),
                chunks: Vec::new(),
            });
        }

        let chunk_rows = self
            .catalog
            .query_rows(&format!(
                "SELECT engine_id, path, offset, columns, should_include_row_id, \
                 pos, end_offset, prev_rowid_max, rowid_max, \
                 checksum_sum, checksum_kvs, checksum_bytes \
                 FROM {} WHERE table_name = {} ORDER BY engine_id, path, offset",
                self.chunk_table(),
                quoted
            ))
            .await?;
        for row in &chunk_rows {
            let engine_id: usize = parse_field(row, 0, "engine_id")?;
            let engine = engines
                .get_mut(engine_id)
                .with_context(|| format!("chunk row references unknown engine {engine_id}"))?;
            let path = row
                .get(1)
                .context("checkpoint chunk row missing path")?;
            let columns = row.get(3).filter(|c| !c.is_empty()).map(|c| c.as_bytes().to_vec());
            engine.chunks.push(ChunkCheckpoint {
                key: ChunkKey {
                    path: PathBuf::from(path),
                    offset: parse_field(row, 2, "offset")?,
                },
                columns,
                should_include_row_id: row.get(4).map(|v| v == "1").unwrap_or(false),
                chunk: Chunk {
                    offset: parse_field(row, 5, "pos")?,
                    end_offset: parse_field(row, 6, "end_offset")?,
                    prev_row_id_max: parse_field(row, 7, "prev_rowid_max")?,
                    row_id_max: parse_field(row, 8, "rowid_max")?,
                },
                checksum: KvChecksum::new(
                    parse_field(row, 9, "checksum_sum")?,
                    parse_field(row, 10, "checksum_kvs")?,
                    parse_field(row, 11, "checksum_bytes")?,
                ),
            });
        }

        Ok(TableCheckpoint {
            status,
            alloc_base,
            engines,
        })
    }

    async fn insert_engine_checkpoints(
        &self,
        table_name: &str,
        engines: &[EngineCheckpoint],
    ) -> Result<()> {
        let quoted = sql_quote(table_name);
        let mut stmts = Vec::new();
        for (engine_id, engine) in engines.iter().enumerate() {
            stmts.push(format!(
                "INSERT IGNORE INTO {} (table_name, engine_id, status) VALUES ({}, {}, {})",
                self.engine_table(),
                quoted,
                engine_id,
                engine.status.0
            ));
            for chunk in &engine.chunks {
                let columns = chunk
                    .columns
                    .as_ref()
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .unwrap_or_default();
                stmts.push(format!(
                    "INSERT IGNORE INTO {} \
                     (table_name, engine_id, path, offset, columns, should_include_row_id, \
                      pos, end_offset, prev_rowid_max, rowid_max, \
                      checksum_sum, checksum_kvs, checksum_bytes) \
                     VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
                    self.chunk_table(),
                    quoted,
                    engine_id,
                    sql_quote(&chunk.key.path.display().to_string()),
                    chunk.key.offset,
                    sql_quote(&columns),
                    u8::from(chunk.should_include_row_id),
                    chunk.chunk.offset,
                    chunk.chunk.end_offset,
                    chunk.chunk.prev_row_id_max,
                    chunk.chunk.row_id_max,
                    chunk.checksum.sum(),
                    chunk.checksum.sum_kvs(),
                    chunk.checksum.sum_size(),
                ));
            }
        }
        self.catalog
            .exec_batch(&stmts)
            .await
            .with_context(|| format!("insert engine checkpoints for {table_name}"))
    }

    async fn update(&self, diffs: &HashMap<String, TableCheckpointDiff>) -> Result<()> {
        let mut stmts = Vec::new();
        for (table_name, diff) in diffs {
            let quoted = sql_quote(table_name);
            if let Some(status) = diff.status {
                stmts.push(format!(
                    "UPDATE {} SET status = {} WHERE table_name = {}",
                    self.table_table(),
                    status.0,
                    quoted
                ));
            }
            if let Some(alloc_base) = diff.alloc_base {
                stmts.push(format!(
                    "UPDATE {} SET alloc_base = GREATEST(alloc_base, {}) WHERE table_name = {}",
                    self.table_table(),
                    alloc_base,
                    quoted
                ));
            }
            for (engine_id, engine_diff) in &diff.engines {
                if let Some(status) = engine_diff.status {
                    stmts.push(format!(
                        "UPDATE {} SET status = {} WHERE table_name = {} AND engine_id = {}",
                        self.engine_table(),
                        status.0,
                        quoted,
                        engine_id
                    ));
                }
                for (key, chunk) in &engine_diff.chunks {
                    stmts.push(format!(
                        "UPDATE {} SET pos = {}, prev_rowid_max = {}, \
                         checksum_sum = {}, checksum_kvs = {}, checksum_bytes = {} \
                         WHERE table_name = {} AND engine_id = {} AND path = {} AND offset = {}",
                        self.chunk_table(),
                        chunk.pos,
                        chunk.row_id,
                        chunk.checksum.sum(),
                        chunk.checksum.sum_kvs(),
                        chunk.checksum.sum_size(),
                        quoted,
                        engine_id,
                        sql_quote(&key.path.display().to_string()),
                        key.offset
                    ));
                }
            }
        }
        if stmts.is_empty() {
            return Ok(());
        }
        self.catalog
            .exec_batch(&stmts)
            .await
            .context("update checkpoints")
    }

    async fn remove(&self, table_name: &str) -> Result<()> {
        if table_name == "all" {
            return self
                .catalog
                .exec(&format!("DROP DATABASE IF EXISTS `{}`", self.schema))
                .await
                .context("drop checkpoint schema");
        }
        let quoted = sql_quote(table_name);
        let stmts = vec![
            format!(
                "DELETE FROM {} WHERE table_name = {}",
                self.chunk_table(),
                quoted
            ),
            format!(
                "DELETE FROM {} WHERE table_name = {}",
                self.engine_table(),
                quoted
            ),
            format!(
                "DELETE FROM {} WHERE table_name = {}",
                self.table_table(),
                quoted
            ),
        ];
        self.catalog
            .exec_batch(&stmts)
            .await
            .with_context(|| format!("remove checkpoint for {table_name}"))
    }
}
