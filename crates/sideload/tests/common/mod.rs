#![allow(dead_code)]

//! Shared in-memory fakes for the restore end-to-end tests: an importer that
//! models engine/SST semantics (keyed, idempotent ingest), a catalog that
//! answers the statements the core issues, a line-oriented dump parser, and
//! a deterministic KV encoder.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sideload::catalog::{ColumnInfo, DbInfo, SqlCatalog, TableInfo};
use sideload::chunk::MAX_DELIVER_BYTES;
use sideload::importer::{ClosedEngine, Importer, OpenedEngine, SwitchMode, WriteStream};
use sideload::kv::{KvEncoder, KvEncoderBuilder, KvPair, PanickingAllocator};
use sideload::mydump::{ChunkParser, DatabaseMeta, DataFile, ParserBuilder, Row, TableMeta};
use sideload::verification::KvChecksum;
use sideload::worker::Pool;

/// Route crate logs into the test harness output. Safe to call repeatedly.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Importer fake

#[derive(Default)]
pub struct EngineData {
    pub kvs: BTreeMap<Vec<u8>, Vec<u8>>,
    pub closed: bool,
    pub imported: bool,
}

#[derive(Default)]
pub struct ImporterState {
    pub engines: HashMap<(String, usize), EngineData>,
    /// Ingested rows per table. Keyed like SSTs: re-ingesting the same key
    /// overwrites rather than duplicates.
    pub ingested: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    pub switch_modes: Vec<SwitchMode>,
    pub compactions: Vec<i32>,
    pub opened: usize,
    pub unsafe_closed: usize,
    pub imports: usize,
}

#[derive(Clone, Default)]
pub struct MemImporter {
    pub state: Arc<Mutex<ImporterState>>,
}

impl MemImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load an engine with pairs, as if a previous run had written it.
    pub fn seed_engine(&self, table_name: &str, engine_id: usize, pairs: &[KvPair]) {
        let mut state = self.state.lock().unwrap();
        let engine = state
            .engines
            .entry((table_name.to_string(), engine_id))
            .or_default();
        for pair in pairs {
            engine.kvs.insert(pair.key.clone(), pair.val.clone());
        }
        engine.closed = true;
    }

    pub fn ingested_pairs(&self, table_name: &str) -> Vec<KvPair> {
        let state = self.state.lock().unwrap();
        state
            .ingested
            .get(table_name)
            .map(|kvs| {
                kvs.iter()
                    .map(|(key, val)| KvPair {
                        key: key.clone(),
                        val: val.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ingested_checksum(&self, table_name: &str) -> KvChecksum {
        let mut checksum = KvChecksum::default();
        checksum.update(&self.ingested_pairs(table_name));
        checksum
    }
}

struct MemOpenedEngine {
    key: (String, usize),
    state: Arc<Mutex<ImporterState>>,
}

struct MemWriteStream {
    key: (String, usize),
    state: Arc<Mutex<ImporterState>>,
    buffer: Vec<KvPair>,
}

struct MemClosedEngine {
    key: (String, usize),
    state: Arc<Mutex<ImporterState>>,
}

#[async_trait]
impl Importer for MemImporter {
    async fn open_engine(
        &self,
        table_name: &str,
        engine_id: usize,
    ) -> Result<Box<dyn OpenedEngine>> {
        let key = (table_name.to_string(), engine_id);
        let mut state = self.state.lock().unwrap();
        state.engines.entry(key.clone()).or_default();
        state.opened += 1;
        Ok(Box::new(MemOpenedEngine {
            key,
            state: self.state.clone(),
        }))
    }

    async fn unsafe_close_engine(
        &self,
        table_name: &str,
        engine_id: usize,
    ) -> Result<Box<dyn ClosedEngine>> {
        let key = (table_name.to_string(), engine_id);
        let mut state = self.state.lock().unwrap();
        state.engines.entry(key.clone()).or_default().closed = true;
        state.unsafe_closed += 1;
        Ok(Box::new(MemClosedEngine {
            key,
            state: self.state.clone(),
        }))
    }

    async fn switch_mode(&self, mode: SwitchMode) -> Result<()> {
        self.state.lock().unwrap().switch_modes.push(mode);
        Ok(())
    }

    async fn compact(&self, level: i32) -> Result<()> {
        self.state.lock().unwrap().compactions.push(level);
        Ok(())
    }
}

#[async_trait]
impl OpenedEngine for MemOpenedEngine {
    async fn new_write_stream(&self) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(MemWriteStream {
            key: self.key.clone(),
            state: self.state.clone(),
            buffer: Vec::new(),
        }))
    }

    async fn close(&self) -> Result<Box<dyn ClosedEngine>> {
        let mut state = self.state.lock().unwrap();
        let engine = state
            .engines
            .get_mut(&self.key)
            .context("closing an unknown engine")?;
        engine.closed = true;
        Ok(Box::new(MemClosedEngine {
            key: self.key.clone(),
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl WriteStream for MemWriteStream {
    async fn put(&mut self, pairs: &[KvPair]) -> Result<()> {
        let size: usize = pairs.iter().map(KvPair::size).sum();
        if pairs.len() > 1 && size > MAX_DELIVER_BYTES {
            bail!("write batch of {size} bytes exceeds the importer limit");
        }
        self.buffer.extend_from_slice(pairs);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine = state
            .engines
            .get_mut(&self.key)
            .context("writing to an unknown engine")?;
        for pair in self.buffer {
            engine.kvs.insert(pair.key, pair.val);
        }
        Ok(())
    }
}

#[async_trait]
impl ClosedEngine for MemClosedEngine {
    async fn import(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let engine_kvs = state
            .engines
            .get(&self.key)
            .map(|engine| engine.kvs.clone())
            .context("importing an unknown engine")?;
        let table_kvs = state.ingested.entry(self.key.0.clone()).or_default();
        for (key, val) in engine_kvs {
            table_kvs.insert(key, val);
        }
        if let Some(engine) = state.engines.get_mut(&self.key) {
            engine.imported = true;
        }
        state.imports += 1;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.engines.remove(&self.key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog fake

#[derive(Default)]
pub struct CatalogState {
    pub executed: Vec<String>,
    pub init_schemas: Vec<String>,
    pub gc_life_time: String,
}

pub struct MemCatalog {
    pub state: Arc<Mutex<CatalogState>>,
    tables: HashMap<String, DbInfo>,
    importer: MemImporter,
    /// Override the `ADMIN CHECKSUM` answer for one table, to simulate a
    /// server-side mismatch.
    checksum_overrides: Mutex<HashMap<String, (u64, u64, u64)>>,
}

impl MemCatalog {
    pub fn new(importer: MemImporter, db_infos: HashMap<String, DbInfo>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(CatalogState {
                gc_life_time: "10m0s".to_string(),
                ..CatalogState::default()
            })),
            tables: db_infos,
            importer,
            checksum_overrides: Mutex::new(HashMap::new()),
        })
    }

    pub fn override_checksum(&self, table_name: &str, checksum: u64, kvs: u64, bytes: u64) {
        self.checksum_overrides
            .lock()
            .unwrap()
            .insert(table_name.to_string(), (checksum, kvs, bytes));
    }

    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|sql| sql.contains(needle))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SqlCatalog for MemCatalog {
    async fn exec(&self, sql: &str) -> Result<()> {
        self.state.lock().unwrap().executed.push(sql.to_string());
        Ok(())
    }

    async fn query_row(&self, sql: &str) -> Result<Vec<String>> {
        if let Some(table_name) = sql.strip_prefix("ADMIN CHECKSUM TABLE ") {
            let (checksum, kvs, bytes) = {
                let overrides = self.checksum_overrides.lock().unwrap();
                match overrides.get(table_name) {
                    Some(triple) => *triple,
                    None => {
                        let sum = self.importer.ingested_checksum(table_name);
                        (sum.sum(), sum.sum_kvs(), sum.sum_size())
                    }
                }
            };
            let (schema, table) = split_unique_table(table_name);
            return Ok(vec![
                schema,
                table,
                checksum.to_string(),
                kvs.to_string(),
                bytes.to_string(),
            ]);
        }
        if sql.contains("tikv_gc_life_time") {
            return Ok(vec![self.state.lock().unwrap().gc_life_time.clone()]);
        }
        bail!("unexpected query: {sql}")
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        bail!("unexpected multi-row query: {sql}")
    }

    async fn exec_batch(&self, stmts: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.executed.extend(stmts.iter().cloned());
        Ok(())
    }

    async fn init_schema(&self, db: &str, table_schemas: &HashMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.init_schemas.push(db.to_string());
        state
            .executed
            .extend(table_schemas.values().cloned());
        Ok(())
    }

    async fn load_schema_info(
        &self,
        db_metas: &[DatabaseMeta],
    ) -> Result<HashMap<String, DbInfo>> {
        let mut infos = HashMap::new();
        for db_meta in db_metas {
            let db_info = self
                .tables
                .get(&db_meta.name)
                .with_context(|| format!("unknown database {}", db_meta.name))?;
            infos.insert(db_meta.name.clone(), db_info.clone());
        }
        Ok(infos)
    }
}

fn split_unique_table(table_name: &str) -> (String, String) {
    let trimmed = table_name.trim_matches('`');
    match trimmed.split_once("`.`") {
        Some((schema, table)) => (schema.to_string(), table.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Dump parser fake

#[derive(Clone)]
pub struct FileSpec {
    pub columns: Option<Vec<u8>>,
    pub content: String,
}

/// Line-oriented parser: one `(v1,v2,…)` tuple per line, a line reading
/// `BOOM` fails the chunk. Optionally cancels a token after a number of rows
/// to simulate dying mid-chunk.
pub struct MemParserBuilder {
    files: HashMap<PathBuf, FileSpec>,
    cancel_after: Option<(CancellationToken, Arc<AtomicI64>)>,
}

impl MemParserBuilder {
    pub fn new(files: HashMap<PathBuf, FileSpec>) -> Arc<Self> {
        Arc::new(Self {
            files,
            cancel_after: None,
        })
    }

    pub fn with_cancel_after(
        files: HashMap<PathBuf, FileSpec>,
        token: CancellationToken,
        rows: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            files,
            cancel_after: Some((token, Arc::new(AtomicI64::new(rows)))),
        })
    }
}

struct MemParser {
    columns: Option<Vec<u8>>,
    content: Vec<u8>,
    pos: i64,
    row_id: i64,
    cancel_after: Option<(CancellationToken, Arc<AtomicI64>)>,
}

impl ParserBuilder for MemParserBuilder {
    fn open(
        &self,
        path: &Path,
        offset: i64,
        prev_row_id_max: i64,
        _read_block_size: i64,
        _io_workers: Arc<Pool>,
    ) -> Result<Box<dyn ChunkParser>> {
        let spec = self
            .files
            .get(path)
            .with_context(|| format!("no such dump file {}", path.display()))?;
        Ok(Box::new(MemParser {
            columns: spec.columns.clone(),
            content: spec.content.as_bytes().to_vec(),
            pos: offset,
            row_id: prev_row_id_max,
            cancel_after: self.cancel_after.clone(),
        }))
    }
}

impl ChunkParser for MemParser {
    fn pos(&self) -> i64 {
        self.pos
    }

    fn columns(&self) -> Option<Vec<u8>> {
        self.columns.clone()
    }

    fn read_row(&mut self) -> Result<Option<Row>> {
        let start = self.pos as usize;
        if start >= self.content.len() {
            return Ok(None);
        }
        let rest = &self.content[start..];
        let line_len = rest
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(rest.len());
        let line = rest[..line_len].to_vec();
        self.pos += line_len as i64 + i64::from(line_len < rest.len());

        if line == b"BOOM" {
            bail!("syntax error at byte {start}");
        }

        self.row_id += 1;
        if let Some((token, remaining)) = &self.cancel_after {
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                token.cancel();
            }
        }
        Ok(Some(Row {
            row_id: self.row_id,
            row: line,
        }))
    }
}

// ---------------------------------------------------------------------------
// KV encoder fake

/// Deterministic encoder: every `(…)` tuple of the VALUES list becomes one
/// pair keyed by `<table_id>:<tuple>`, so re-encoding the same rows after a
/// resume produces identical pairs.
pub struct MemEncoderBuilder;

impl MemEncoderBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

struct MemEncoder;

impl KvEncoderBuilder for MemEncoderBuilder {
    fn build(
        &self,
        _db_name: &str,
        _table_info: &TableInfo,
        _sql_mode: &str,
        _alloc: Arc<PanickingAllocator>,
    ) -> Result<Arc<dyn KvEncoder>> {
        Ok(Arc::new(MemEncoder))
    }
}

impl KvEncoder for MemEncoder {
    fn encode(&self, sql: &str, table_id: i64) -> Result<Vec<KvPair>> {
        let values = sql
            .split_once(" VALUES ")
            .map(|(_, tail)| tail)
            .ok_or_else(|| anyhow!("statement has no VALUES clause: {sql}"))?;
        let values = values.trim_end_matches(';');

        let mut pairs = Vec::new();
        let mut depth = 0usize;
        let mut tuple_start = 0usize;
        for (i, ch) in values.char_indices() {
            match ch {
                '(' => {
                    if depth == 0 {
                        tuple_start = i;
                    }
                    depth += 1;
                }
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| anyhow!("unbalanced tuple in: {values}"))?;
                    if depth == 0 {
                        let tuple = &values[tuple_start..=i];
                        pairs.push(KvPair {
                            key: format!("{table_id}:{tuple}").into_bytes(),
                            val: tuple.as_bytes().to_vec(),
                        });
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            bail!("unbalanced tuple in: {values}");
        }
        Ok(pairs)
    }
}

/// The pairs the fake encoder would produce for `tuples`, for building
/// expectations in tests.
pub fn expected_pairs(table_id: i64, tuples: &[String]) -> Vec<KvPair> {
    tuples
        .iter()
        .map(|tuple| KvPair {
            key: format!("{table_id}:{tuple}").into_bytes(),
            val: tuple.as_bytes().to_vec(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Fixture plumbing

pub struct Fixture {
    pub importer: MemImporter,
    pub catalog: Arc<MemCatalog>,
    pub parser_builder: Arc<MemParserBuilder>,
    pub encoder_builder: Arc<MemEncoderBuilder>,
    pub db_metas: Vec<DatabaseMeta>,
    pub files: HashMap<PathBuf, FileSpec>,
}

impl Fixture {
    /// A parser builder over the same dump files, without any cancel hook.
    /// Used to restart a run against the same cluster state.
    pub fn plain_parser_builder(&self) -> Arc<MemParserBuilder> {
        MemParserBuilder::new(self.files.clone())
    }
}

/// Describe one table backed by a single in-memory dump file.
pub struct TableFixture {
    pub db: String,
    pub name: String,
    pub table_id: i64,
    pub pk_is_handle: bool,
    pub columns: Vec<String>,
    pub file_columns: Option<String>,
    pub rows: Vec<String>,
}

impl TableFixture {
    pub fn file_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.{}.sql", self.db, self.name))
    }

    pub fn content(&self) -> String {
        self.rows.join("\n")
    }

    pub fn table_name(&self) -> String {
        sideload::catalog::unique_table(&self.db, &self.name)
    }
}

pub fn build_fixture(tables: &[TableFixture]) -> Fixture {
    build_fixture_with_cancel(tables, None)
}

pub fn build_fixture_with_cancel(
    tables: &[TableFixture],
    cancel_after: Option<(CancellationToken, i64)>,
) -> Fixture {
    let mut files = HashMap::new();
    let mut db_tables: HashMap<String, Vec<TableMeta>> = HashMap::new();
    let mut db_infos: HashMap<String, DbInfo> = HashMap::new();

    for table in tables {
        let content = table.content();
        files.insert(
            table.file_path(),
            FileSpec {
                columns: table.file_columns.as_ref().map(|c| c.as_bytes().to_vec()),
                content: content.clone(),
            },
        );
        db_tables
            .entry(table.db.clone())
            .or_default()
            .push(TableMeta {
                db: table.db.clone(),
                name: table.name.clone(),
                schema: format!("CREATE TABLE `{}` (stub)", table.name),
                data_files: vec![DataFile {
                    path: table.file_path(),
                    size: content.len() as i64,
                }],
            });
        db_infos
            .entry(table.db.clone())
            .or_insert_with(|| DbInfo {
                name: table.db.clone(),
                tables: HashMap::new(),
            })
            .tables
            .insert(
                table.name.clone(),
                TableInfo {
                    id: table.table_id,
                    name: table.name.clone(),
                    columns: table
                        .columns
                        .iter()
                        .map(|name| ColumnInfo { name: name.clone() })
                        .collect(),
                    pk_is_handle: table.pk_is_handle,
                    auto_inc_id: 0,
                    create_table_stmt: format!("CREATE TABLE `{}` (stub)", table.name),
                },
            );
    }

    let importer = MemImporter::new();
    let catalog = MemCatalog::new(importer.clone(), db_infos);
    let parser_builder = match cancel_after {
        Some((token, rows)) => MemParserBuilder::with_cancel_after(files.clone(), token, rows),
        None => MemParserBuilder::new(files.clone()),
    };

    let db_metas = db_tables
        .into_iter()
        .map(|(name, tables)| DatabaseMeta { name, tables })
        .collect();

    Fixture {
        importer,
        catalog,
        parser_builder,
        encoder_builder: MemEncoderBuilder::new(),
        db_metas,
        files,
    }
}

/// A config pointing checkpoints at a temp file, with requirement checks off
/// and checkpoints kept for post-run inspection.
pub fn test_config(checkpoint_path: &Path) -> sideload::Config {
    let mut cfg = sideload::Config::default();
    cfg.app.check_requirements = false;
    cfg.app.table_concurrency = 4;
    cfg.app.region_concurrency = 4;
    cfg.app.io_concurrency = 2;
    cfg.source.read_block_size = 16;
    cfg.checkpoint.driver = "file".to_string();
    cfg.checkpoint.dsn = checkpoint_path.display().to_string();
    cfg.checkpoint.keep_after_success = true;
    cfg.cron.switch_mode = std::time::Duration::from_secs(3600);
    cfg.cron.log_progress = std::time::Duration::from_secs(3600);
    cfg
}
