//! Dump-file layout metadata, chunk/region planning, and the parser contract.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::worker::Pool;

/// One data file of a table, with its on-disk size.
#[derive(Clone, Debug)]
pub struct DataFile {
    pub path: PathBuf,
    pub size: i64,
}

/// Identity and layout of one table in the dump.
#[derive(Clone, Debug)]
pub struct TableMeta {
    pub db: String,
    pub name: String,
    /// `CREATE TABLE` DDL text.
    pub schema: String,
    pub data_files: Vec<DataFile>,
}

#[derive(Clone, Debug)]
pub struct DatabaseMeta {
    pub name: String,
    pub tables: Vec<TableMeta>,
}

/// A byte range of one data file plus its row-ID reservation.
///
/// `offset` advances as the chunk is restored; `prev_row_id_max` tracks the
/// last row ID handed out. Reservations of one table are disjoint and cover
/// `[1, total]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: i64,
    pub end_offset: i64,
    pub prev_row_id_max: i64,
    pub row_id_max: i64,
}

/// A planned chunk, assigned to an importer engine.
#[derive(Clone, Debug)]
pub struct TableRegion {
    pub engine_id: usize,
    pub file: PathBuf,
    pub chunk: Chunk,
}

/// Plan the chunks of one table and group them into engines.
///
/// One chunk per data file. Row-ID reservations are sized by byte length (a
/// row occupies at least one byte, so a reservation always suffices) and
/// assigned cumulatively so they stay disjoint. Engines fill up to
/// `batch_size` accumulated bytes; the first engine is scaled by
/// `batch_import_ratio` so delivery starts while later engines still encode.
pub fn make_table_regions(
    meta: &TableMeta,
    batch_size: i64,
    batch_import_ratio: f64,
) -> Result<Vec<TableRegion>> {
    ensure!(batch_size > 0, "batch size must be positive");
    let ratio = if (0.0..=1.0).contains(&batch_import_ratio) && batch_import_ratio > 0.0 {
        batch_import_ratio
    } else {
        1.0
    };

    let mut regions = Vec::with_capacity(meta.data_files.len());
    let mut prev_row_id_max = 0i64;
    let mut engine_id = 0usize;
    let mut engine_bytes = 0i64;
    let mut engine_target = ((batch_size as f64) * ratio).max(1.0) as i64;

    for file in &meta.data_files {
        if file.size <= 0 {
            continue;
        }
        if engine_bytes >= engine_target {
            engine_id += 1;
            engine_bytes = 0;
            engine_target = batch_size;
        }
        let row_id_max = prev_row_id_max + file.size;
        regions.push(TableRegion {
            engine_id,
            file: file.path.clone(),
            chunk: Chunk {
                offset: 0,
                end_offset: file.size,
                prev_row_id_max,
                row_id_max,
            },
        });
        prev_row_id_max = row_id_max;
        engine_bytes += file.size;
    }

    Ok(regions)
}

/// One parsed row: its assigned row ID and the raw `(v1,v2,…)` tuple text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub row_id: i64,
    pub row: Vec<u8>,
}

/// Streaming parser over one chunk of a dump file (external contract).
///
/// Row IDs are drawn sequentially from the chunk's reservation, starting
/// just above the `prev_row_id_max` the parser was opened with.
pub trait ChunkParser: Send {
    /// Current byte position within the file.
    fn pos(&self) -> i64;

    /// The column list from the file, e.g. `(a,b)`, once it is known.
    fn columns(&self) -> Option<Vec<u8>>;

    /// Read the next row; `None` at end of input.
    fn read_row(&mut self) -> Result<Option<Row>>;
}

/// Opens a parser positioned at `(offset, prev_row_id_max)` of a data file.
/// Block reads inside the parser are gated by the io pool.
pub trait ParserBuilder: Send + Sync {
    fn open(
        &self,
        path: &Path,
        offset: i64,
        prev_row_id_max: i64,
        read_block_size: i64,
        io_workers: Arc<Pool>,
    ) -> Result<Box<dyn ChunkParser>>;
}
