//! Runtime configuration. Loading from disk and CLI flags live outside this
//! crate; these structs only define the options and their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub tidb: TidbConfig,
    pub importer: ImporterConfig,
    pub source: SourceConfig,
    pub checkpoint: CheckpointConfig,
    pub cron: CronConfig,
    pub post_restore: PostRestoreConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Tables restored concurrently; caps metadata pressure on the catalog.
    pub table_concurrency: usize,
    /// Chunks restored concurrently; caps parser/encoder memory.
    pub region_concurrency: usize,
    /// Concurrent block reads; caps open file descriptors.
    pub io_concurrency: usize,
    pub check_requirements: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            table_concurrency: 8,
            region_concurrency: 16,
            io_concurrency: 5,
            check_requirements: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TidbConfig {
    pub host: String,
    pub port: u16,
    pub status_port: u16,
    pub pd_addr: String,
    pub sql_mode: String,
    pub build_stats_concurrency: usize,
    pub distsql_scan_concurrency: usize,
    pub index_serial_scan_concurrency: usize,
    pub checksum_table_concurrency: usize,
}

impl Default for TidbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            status_port: 10080,
            pd_addr: "127.0.0.1:2379".to_string(),
            sql_mode: "STRICT_TRANS_TABLES,NO_ENGINE_SUBSTITUTION".to_string(),
            build_stats_concurrency: 20,
            distsql_scan_concurrency: 100,
            index_serial_scan_concurrency: 20,
            checksum_table_concurrency: 16,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    pub addr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Skip issuing schema DDL; the target tables must already exist.
    pub no_schema: bool,
    /// Upper bound on bytes read from the parser per pipeline block.
    pub read_block_size: i64,
    /// Target accumulated bytes per importer engine.
    pub batch_size: i64,
    /// Scale factor for the first engine of each table, so delivery starts
    /// while later engines are still encoding.
    pub batch_import_ratio: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            no_schema: false,
            read_block_size: 64 * 1024,
            batch_size: 100 * (1 << 30),
            batch_import_ratio: 0.75,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enable: bool,
    /// `"file"` or `"mysql"`.
    pub driver: String,
    /// File path for the file driver.
    pub dsn: String,
    /// Schema name for the mysql driver.
    pub schema: String,
    pub keep_after_success: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enable: true,
            driver: "file".to_string(),
            dsn: "sideload_checkpoint.json".to_string(),
            schema: "sideload_checkpoint".to_string(),
            keep_after_success: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Cadence of the import-mode lease renewal.
    pub switch_mode: Duration,
    /// Cadence of the progress report line.
    pub log_progress: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            switch_mode: Duration::from_secs(5 * 60),
            log_progress: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PostRestoreConfig {
    pub checksum: bool,
    pub analyze: bool,
    pub compact: bool,
}

impl Default for PostRestoreConfig {
    fn default() -> Self {
        Self {
            checksum: true,
            analyze: true,
            compact: true,
        }
    }
}
