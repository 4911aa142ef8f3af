//! Client contract for the sideband importer service.
//!
//! The importer groups KV writes into *engines*, one per table batch. An
//! engine is opened, written through short-lived write streams, closed, and
//! imported as a unit; only a closed engine may be imported. Retries and
//! backoff are the importer's own concern, not this crate's.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::kv::KvPair;

/// Compaction level for a whole-cluster rewrite.
pub const FULL_LEVEL_COMPACT: i32 = -1;
/// Compaction level for the opportunistic level-1 pass between imports.
pub const LEVEL1_COMPACT: i32 = 1;

/// Storage-node mode. Import mode disables background compactions while SSTs
/// are being ingested; the lease is renewed periodically and dropped at the
/// end of the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchMode {
    Import,
    Normal,
}

impl fmt::Display for SwitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchMode::Import => f.write_str("import"),
            SwitchMode::Normal => f.write_str("normal"),
        }
    }
}

/// A short-lived channel carrying bounded KV batches into an open engine.
#[async_trait]
pub trait WriteStream: Send {
    async fn put(&mut self, pairs: &[KvPair]) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// An engine accepting writes. `close` seals it; the returned handle is the
/// only way to trigger the actual ingest.
#[async_trait]
pub trait OpenedEngine: Send + Sync {
    async fn new_write_stream(&self) -> Result<Box<dyn WriteStream>>;
    async fn close(&self) -> Result<Box<dyn ClosedEngine>>;
}

/// A sealed engine, ready to be ingested into the storage nodes.
#[async_trait]
pub trait ClosedEngine: Send + Sync {
    async fn import(&self) -> Result<()>;
    async fn cleanup(&self) -> Result<()>;
}

/// The importer service itself.
#[async_trait]
pub trait Importer: Send + Sync {
    async fn open_engine(&self, table_name: &str, engine_id: usize)
        -> Result<Box<dyn OpenedEngine>>;

    /// Rebuild a closed-engine handle from its name alone, without reopening.
    /// Used on resume for engines whose checkpoint already reached `Closed`.
    async fn unsafe_close_engine(
        &self,
        table_name: &str,
        engine_id: usize,
    ) -> Result<Box<dyn ClosedEngine>>;

    async fn switch_mode(&self, mode: SwitchMode) -> Result<()>;

    /// Trigger a compaction at `level` (`FULL_LEVEL_COMPACT` or
    /// `LEVEL1_COMPACT`).
    async fn compact(&self, level: i32) -> Result<()>;
}
