//! SQL catalog contract and the statements the restore core issues through
//! it: schema DDL, `ALTER TABLE … AUTO_INCREMENT`, `ANALYZE TABLE`,
//! `ADMIN CHECKSUM TABLE`, and the GC-lifetime variable dance around the
//! checksum.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::TidbConfig;
use crate::error::is_cancelled;
use crate::mydump::DatabaseMeta;

/// GC lifetime enforced while a checksum runs. The checksum statement can
/// take longer than the cluster's default GC window.
pub const DEFAULT_GC_LIFE_TIME: Duration = Duration::from_secs(100 * 3600);

const SQL_RETRY_COUNT: usize = 3;
const SQL_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ColumnInfo {
    pub name: String,
}

/// Server-resolved table identity.
#[derive(Clone, Debug)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub pk_is_handle: bool,
    pub auto_inc_id: i64,
    pub create_table_stmt: String,
}

#[derive(Clone, Debug, Default)]
pub struct DbInfo {
    pub name: String,
    pub tables: HashMap<String, TableInfo>,
}

/// The target database's SQL surface. The driver lives outside this crate;
/// everything here is composed as statement text and parsed from stringly
/// result rows.
#[async_trait]
pub trait SqlCatalog: Send + Sync {
    async fn exec(&self, sql: &str) -> Result<()>;

    /// Run a query expected to yield exactly one row.
    async fn query_row(&self, sql: &str) -> Result<Vec<String>>;

    async fn query_rows(&self, sql: &str) -> Result<Vec<Vec<String>>>;

    /// Execute the statements atomically: on recovery either all of them are
    /// visible or none.
    async fn exec_batch(&self, stmts: &[String]) -> Result<()>;

    /// `CREATE DATABASE IF NOT EXISTS` plus each table's schema DDL.
    async fn init_schema(&self, db: &str, table_schemas: &HashMap<String, String>) -> Result<()>;

    /// Resolve `TableInfo` for every table named in the dump metadata.
    async fn load_schema_info(
        &self,
        db_metas: &[DatabaseMeta],
    ) -> Result<HashMap<String, DbInfo>>;
}

/// The unique table name in the form `` `db`.`tbl` ``.
pub fn unique_table(db: &str, table: &str) -> String {
    format!("`{db}`.`{table}`")
}

/// Run `sql` with bounded retries. Cancellation aborts immediately;
/// `ADMIN CHECKSUM` and `ALTER` must not go through here.
pub async fn exec_with_retry(catalog: &dyn SqlCatalog, purpose: &str, sql: &str) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=SQL_RETRY_COUNT {
        match catalog.exec(sql).await {
            Ok(()) => return Ok(()),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                tracing::warn!(purpose, attempt, error = ?err, "catalog statement failed");
                last_err = Some(err);
                if attempt < SQL_RETRY_COUNT {
                    tokio::time::sleep(SQL_RETRY_BACKOFF).await;
                }
            }
        }
    }
    match last_err {
        Some(err) => Err(err.context(format!("{purpose} failed after {SQL_RETRY_COUNT} attempts"))),
        None => bail!("{purpose} failed"),
    }
}

/// Retrying variant of `query_row`.
pub async fn query_row_with_retry(
    catalog: &dyn SqlCatalog,
    purpose: &str,
    sql: &str,
) -> Result<Vec<String>> {
    let mut last_err = None;
    for attempt in 1..=SQL_RETRY_COUNT {
        match catalog.query_row(sql).await {
            Ok(row) => return Ok(row),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                tracing::warn!(purpose, attempt, error = ?err, "catalog query failed");
                last_err = Some(err);
                if attempt < SQL_RETRY_COUNT {
                    tokio::time::sleep(SQL_RETRY_BACKOFF).await;
                }
            }
        }
    }
    match last_err {
        Some(err) => Err(err.context(format!("{purpose} failed after {SQL_RETRY_COUNT} attempts"))),
        None => bail!("{purpose} failed"),
    }
}

/// `ALTER TABLE` is deliberately not retried.
pub async fn alter_auto_increment(
    catalog: &dyn SqlCatalog,
    db: &str,
    table: &str,
    incr: i64,
) -> Result<()> {
    let table_name = unique_table(db, table);
    let query = format!("ALTER TABLE {table_name} AUTO_INCREMENT={incr}");
    catalog
        .exec(&query)
        .await
        .with_context(|| format!("alter table auto_increment for {table_name}"))
}

pub async fn analyze_table(catalog: &dyn SqlCatalog, table_name: &str) -> Result<()> {
    let query = format!("ANALYZE TABLE {table_name}");
    exec_with_retry(catalog, "analyze table", &query).await
}

/// Checksum result reported by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteChecksum {
    pub schema: String,
    pub table: String,
    pub checksum: u64,
    pub total_kvs: u64,
    pub total_bytes: u64,
}

/// Run `ADMIN CHECKSUM TABLE` with the GC lifetime raised for the duration.
pub async fn do_checksum(catalog: &dyn SqlCatalog, table_name: &str) -> Result<RemoteChecksum> {
    let ori_gc_life_time = increase_gc_life_time(catalog).await?;

    tracing::info!(table = table_name, "doing remote checksum");
    let query = format!("ADMIN CHECKSUM TABLE {table_name}");
    // Not retried: the statement is too expensive to re-run blindly.
    let result = catalog.query_row(&query).await;

    // Always put the GC lifetime back, even when the checksum failed.
    if let Err(err) = update_gc_life_time(catalog, &ori_gc_life_time).await {
        if !is_cancelled(&err) {
            tracing::error!(table = table_name, error = ?err, "restoring tikv_gc_life_time failed");
        }
    }

    let row = result.with_context(|| format!("admin checksum for {table_name}"))?;
    parse_remote_checksum(&row)
}

fn parse_remote_checksum(row: &[String]) -> Result<RemoteChecksum> {
    if row.len() != 5 {
        bail!("admin checksum returned {} columns, expected 5", row.len());
    }
    Ok(RemoteChecksum {
        schema: row[0].clone(),
        table: row[1].clone(),
        checksum: row[2].parse().context("parse checksum_crc64_xor")?,
        total_kvs: row[3].parse().context("parse total_kvs")?,
        total_bytes: row[4].parse().context("parse total_bytes")?,
    })
}

pub async fn obtain_gc_life_time(catalog: &dyn SqlCatalog) -> Result<String> {
    let row = query_row_with_retry(
        catalog,
        "obtain gc lifetime",
        "SELECT VARIABLE_VALUE FROM mysql.tidb WHERE VARIABLE_NAME = 'tikv_gc_life_time'",
    )
    .await?;
    row.into_iter()
        .next()
        .context("empty tikv_gc_life_time row")
}

pub async fn update_gc_life_time(catalog: &dyn SqlCatalog, life_time: &str) -> Result<()> {
    let query = format!(
        "UPDATE mysql.tidb SET VARIABLE_VALUE = '{life_time}' WHERE VARIABLE_NAME = 'tikv_gc_life_time'"
    );
    exec_with_retry(catalog, "update gc lifetime", &query).await
}

/// Raise the GC lifetime to `DEFAULT_GC_LIFE_TIME` when the current value is
/// smaller or unparseable, returning the original value so it can be
/// restored afterwards.
async fn increase_gc_life_time(catalog: &dyn SqlCatalog) -> Result<String> {
    let ori = obtain_gc_life_time(catalog).await?;

    let needs_increase = match parse_gc_duration(&ori) {
        Some(current) => current < DEFAULT_GC_LIFE_TIME,
        None => true,
    };
    if needs_increase {
        update_gc_life_time(catalog, &format_gc_duration(DEFAULT_GC_LIFE_TIME)).await?;
    }

    Ok(ori)
}

/// Parse the `h`/`m`/`s` duration format the server stores in
/// `tikv_gc_life_time`, e.g. `10m0s` or `100h0m0s`.
fn parse_gc_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    for ch in value.chars() {
        match ch {
            '0'..='9' | '.' => number.push(ch),
            'h' | 'm' | 's' => {
                let amount: f64 = number.parse().ok()?;
                number.clear();
                let secs = match ch {
                    'h' => amount * 3600.0,
                    'm' => amount * 60.0,
                    _ => amount,
                };
                total += Duration::from_secs_f64(secs);
            }
            _ => return None,
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(total)
}

fn format_gc_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Best-effort session tuning before post-processing; failures are logged
/// and ignored.
pub async fn set_session_concurrency_vars(catalog: &dyn SqlCatalog, cfg: &TidbConfig) {
    let query = format!(
        "SET \
         SESSION tidb_build_stats_concurrency = {}, \
         SESSION tidb_distsql_scan_concurrency = {}, \
         SESSION tidb_index_serial_scan_concurrency = {}, \
         SESSION tidb_checksum_table_concurrency = {}",
        cfg.build_stats_concurrency,
        cfg.distsql_scan_concurrency,
        cfg.index_serial_scan_concurrency,
        cfg.checksum_table_concurrency,
    );
    if let Err(err) = exec_with_retry(catalog, "set session concurrency variables", &query).await {
        tracing::warn!(error = ?err, "failed to set session concurrency variables");
    }
}
