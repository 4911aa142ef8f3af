//! Contracts shared with the external SQL-to-KV encoder library, plus the
//! per-table row-ID allocator.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::catalog::TableInfo;

/// Name of the hidden handle column injected when the primary key is not the
/// row handle.
pub const EXTRA_HANDLE_COLUMN: &str = "_tidb_rowid";

/// A single key/value pair destined for the importer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub val: Vec<u8>,
}

impl KvPair {
    pub fn size(&self) -> usize {
        self.key.len() + self.val.len()
    }
}

/// Row-ID allocator seeded from the table checkpoint's `alloc_base`.
///
/// It never calls back to the database: the parser hands out IDs from each
/// chunk's reservation, and `rebase` only ever raises the base. `alloc`
/// panics on overflow; the panic is lifted to an error at the chunk task
/// boundary.
pub struct PanickingAllocator {
    base: AtomicI64,
}

impl PanickingAllocator {
    pub fn new(base: i64) -> Self {
        Self {
            base: AtomicI64::new(base),
        }
    }

    /// Raise the base to at least `base`. Monotonic.
    pub fn rebase(&self, base: i64) {
        self.base.fetch_max(base, Ordering::SeqCst);
    }

    pub fn base(&self) -> i64 {
        self.base.load(Ordering::SeqCst)
    }

    /// Allocate the next row ID.
    pub fn alloc(&self) -> i64 {
        let prev = self.base.fetch_add(1, Ordering::SeqCst);
        if prev == i64::MAX {
            panic!("row ID allocator overflowed");
        }
        prev + 1
    }
}

/// Turns a batched `INSERT` statement into KV pairs (external library seam).
/// One encoder exists per table; chunk workers borrow it concurrently.
pub trait KvEncoder: Send + Sync {
    fn encode(&self, sql: &str, table_id: i64) -> Result<Vec<KvPair>>;
}

/// Builds one encoder per table, primed with the table's schema DDL and
/// sharing the table's row-ID allocator.
pub trait KvEncoderBuilder: Send + Sync {
    fn build(
        &self,
        db_name: &str,
        table_info: &TableInfo,
        sql_mode: &str,
        alloc: Arc<PanickingAllocator>,
    ) -> Result<Arc<dyn KvEncoder>>;
}
