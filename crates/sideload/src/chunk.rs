//! Per-chunk restore pipeline: parse SQL rows, encode them into KV pairs,
//! and stream the pairs into the importer engine.
//!
//! The two stages run concurrently inside one task and meet at a single-slot
//! rendezvous: the producer appends encoded batches and blocks once the
//! pending KV count exceeds `MAX_KV_QUEUE` times the last batch (the KV pairs
//! pin the encoder's buffers, so an unbounded queue would pin unbounded
//! memory); the deliverer swaps the pending batch out, writes it in
//! sub-batches of at most `MAX_DELIVER_BYTES`, and only then advances the
//! chunk checkpoint.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::ChunkCheckpoint;
use crate::coalescer::CheckpointSender;
use crate::controller::Progress;
use crate::error::{is_cancelled, Cancelled};
use crate::importer::OpenedEngine;
use crate::kv::KvPair;
use crate::mydump::{ChunkParser, ParserBuilder};
use crate::table::TableRestore;
use crate::verification::KvChecksum;
use crate::worker::Pool;

/// Back-pressure multiplier on the producer side of the rendezvous.
pub const MAX_KV_QUEUE: usize = 128;
/// Hard per-sub-batch byte limit imposed by the importer.
pub const MAX_DELIVER_BYTES: usize = 31 << 20;

/// Split `total` into consecutive sub-batches whose cumulative size stays
/// within `split_size`. A single pair larger than the limit is emitted as its
/// own sub-batch.
pub fn split_into_delivery_streams(total: &[KvPair], split_size: usize) -> Vec<&[KvPair]> {
    let mut res = Vec::with_capacity(1);
    let mut start = 0;
    let mut cum_size = 0;

    for (j, pair) in total.iter().enumerate() {
        let size = pair.size();
        if start < j && cum_size + size > split_size {
            res.push(&total[start..j]);
            start = j;
            cum_size = 0;
        }
        cum_size += size;
    }

    res.push(&total[start..]);
    res
}

#[derive(Default)]
struct Block {
    encode_completed: bool,
    kvs: Vec<KvPair>,
    checksum: KvChecksum,
    offset: i64,
    row_id: i64,
}

struct Rendezvous {
    state: Mutex<Block>,
    kv_ready: Notify,
    space: Notify,
}

struct Batch {
    kvs: Vec<KvPair>,
    checksum: KvChecksum,
    offset: i64,
    row_id: i64,
    completed: bool,
}

pub(crate) struct ChunkRestore {
    index: usize,
    parser: Box<dyn ChunkParser>,
    chunk: Arc<Mutex<ChunkCheckpoint>>,
}

impl ChunkRestore {
    pub(crate) fn new(
        index: usize,
        chunk: Arc<Mutex<ChunkCheckpoint>>,
        builder: &dyn ParserBuilder,
        read_block_size: i64,
        io_workers: Arc<Pool>,
    ) -> Result<Self> {
        let (path, offset, prev_row_id_max) = {
            let ccp = chunk.lock().expect("chunk checkpoint poisoned");
            (
                ccp.key.path.clone(),
                ccp.chunk.offset,
                ccp.chunk.prev_row_id_max,
            )
        };
        let parser = builder
            .open(&path, offset, prev_row_id_max, read_block_size, io_workers)
            .with_context(|| format!("open chunk parser for {}", path.display()))?;
        Ok(Self {
            index,
            parser,
            chunk,
        })
    }

    /// Run the chunk to completion. Flow: read dump rows, encode to KV,
    /// hand off to the deliverer, stream into the engine, checkpoint.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn restore(
        mut self,
        token: &CancellationToken,
        tr: &TableRestore,
        engine_id: usize,
        engine: &dyn OpenedEngine,
        saver: &CheckpointSender,
        progress: &Progress,
        read_block_size: i64,
    ) -> Result<()> {
        let timer = Instant::now();
        let rendezvous = Rendezvous {
            state: Mutex::new(Block::default()),
            kv_ready: Notify::new(),
            space: Notify::new(),
        };
        let chunk = self.chunk.clone();
        let chunk_key = {
            let ccp = chunk.lock().expect("chunk checkpoint poisoned");
            ccp.key.clone()
        };

        let deliverer = async {
            let mut deliver_dur = Duration::ZERO;
            loop {
                let batch = loop {
                    let notified = rendezvous.kv_ready.notified();
                    {
                        let mut state =
                            rendezvous.state.lock().expect("chunk rendezvous poisoned");
                        if !state.kvs.is_empty() || state.encode_completed {
                            break Batch {
                                kvs: mem::take(&mut state.kvs),
                                checksum: mem::take(&mut state.checksum),
                                offset: state.offset,
                                row_id: state.row_id,
                                completed: state.encode_completed,
                            };
                        }
                    }
                    notified.await;
                };

                if batch.completed && batch.kvs.is_empty() {
                    return Ok(deliver_dur);
                }
                if token.is_cancelled() {
                    return Err(anyhow::Error::new(Cancelled));
                }

                let start = Instant::now();
                let mut stream = engine
                    .new_write_stream()
                    .await
                    .context("open engine write stream")?;

                let mut write_err: Option<anyhow::Error> = None;
                for sub_batch in split_into_delivery_streams(&batch.kvs, MAX_DELIVER_BYTES) {
                    if let Err(err) = stream.put(sub_batch).await {
                        if write_err.is_some() {
                            tracing::warn!(error = ?err, "failed to put write stream");
                        } else {
                            write_err = Some(err);
                        }
                    }
                }
                drop(batch.kvs);

                rendezvous.space.notify_one();
                if let Err(err) = stream.close().await {
                    if write_err.is_some() {
                        tracing::warn!(
                            table = %tr.table_name,
                            engine_id,
                            error = ?err,
                            "failed to close write stream"
                        );
                    } else {
                        write_err = Some(err);
                    }
                }
                deliver_dur += start.elapsed();

                if let Some(err) = write_err {
                    if !is_cancelled(&err) {
                        tracing::error!(
                            table = %tr.table_name,
                            engine_id,
                            error = ?err,
                            "kv delivery failed"
                        );
                    }
                    return Err(err);
                }

                // The write is effective on the importer side, so the chunk
                // checkpoint may advance past it now.
                {
                    let mut ccp = chunk.lock().expect("chunk checkpoint poisoned");
                    ccp.checksum.add(&batch.checksum);
                    ccp.chunk.offset = batch.offset;
                    ccp.chunk.prev_row_id_max = batch.row_id;
                    saver.send(
                        tr.table_name.clone(),
                        crate::checkpoint::CheckpointMerger::Rebase {
                            alloc_base: tr.alloc.base() + 1,
                        },
                    );
                    saver.send(
                        tr.table_name.clone(),
                        crate::checkpoint::CheckpointMerger::Chunk {
                            engine_id,
                            key: ccp.key.clone(),
                            pos: ccp.chunk.offset,
                            row_id: ccp.chunk.prev_row_id_max,
                            checksum: ccp.checksum,
                        },
                    );
                }
            }
        };

        let producer = async {
            let mut read_dur = Duration::ZERO;
            let mut encode_dur = Duration::ZERO;
            let (mut end_offset, row_id_max) = {
                let ccp = chunk.lock().expect("chunk checkpoint poisoned");
                (ccp.chunk.end_offset, ccp.chunk.row_id_max)
            };
            let mut columns_cache: Option<(Vec<u8>, bool)> = {
                let ccp = chunk.lock().expect("chunk checkpoint poisoned");
                ccp.columns
                    .clone()
                    .map(|columns| (columns, ccp.should_include_row_id))
            };

            let mut buffer = Vec::new();
            loop {
                if token.is_cancelled() {
                    return Err(anyhow::Error::new(Cancelled));
                }

                let block_end = end_offset.min(self.parser.pos() + read_block_size);
                if self.parser.pos() >= block_end {
                    break;
                }

                buffer.clear();
                let start = Instant::now();
                let mut sep = b' ';
                let mut last_row_id = 0i64;

                while self.parser.pos() < block_end {
                    match self.parser.read_row() {
                        Ok(Some(row)) => {
                            buffer.push(sep);
                            if sep == b' ' {
                                if columns_cache.is_none() {
                                    let mut ccp =
                                        chunk.lock().expect("chunk checkpoint poisoned");
                                    tr.initialize_columns(self.parser.columns(), &mut ccp);
                                    columns_cache = Some((
                                        ccp.columns.clone().unwrap_or_default(),
                                        ccp.should_include_row_id,
                                    ));
                                }
                                let (columns, _) =
                                    columns_cache.as_ref().expect("columns just initialized");
                                buffer.extend_from_slice(b"INSERT INTO ");
                                buffer.extend_from_slice(tr.table_name.as_bytes());
                                buffer.extend_from_slice(columns);
                                buffer.extend_from_slice(b" VALUES ");
                                sep = b',';
                            }
                            if row.row_id > row_id_max {
                                bail!(
                                    "row ID {} exceeds the chunk reservation (max {})",
                                    row.row_id,
                                    row_id_max
                                );
                            }
                            let include_row_id = columns_cache
                                .as_ref()
                                .map(|(_, include)| *include)
                                .unwrap_or(false);
                            if include_row_id {
                                // Rewrite the trailing `)` to `, <rowID>)`.
                                buffer.extend_from_slice(&row.row[..row.row.len() - 1]);
                                buffer.extend_from_slice(format!(",{})", row.row_id).as_bytes());
                            } else {
                                buffer.extend_from_slice(&row.row);
                            }
                            last_row_id = row.row_id;
                        }
                        Ok(None) => {
                            end_offset = self.parser.pos();
                            let mut ccp = chunk.lock().expect("chunk checkpoint poisoned");
                            ccp.chunk.end_offset = end_offset;
                            break;
                        }
                        Err(err) => return Err(err.context("read dump row")),
                    }
                }
                if sep != b',' {
                    // The block contained no rows.
                    continue;
                }
                buffer.push(b';');
                read_dur += start.elapsed();
                progress.add_bytes_read(buffer.len() as u64);

                let start = Instant::now();
                let statement =
                    std::str::from_utf8(&buffer).context("dump rows are not valid UTF-8")?;
                let mut kvs = match tr.encoder.encode(statement, tr.table_info.id) {
                    Ok(kvs) => kvs,
                    Err(err) => {
                        tracing::error!(error = ?err, "kv encode failed");
                        return Err(err);
                    }
                };
                encode_dur += start.elapsed();

                loop {
                    let notified = rendezvous.space.notified();
                    {
                        let mut state =
                            rendezvous.state.lock().expect("chunk rendezvous poisoned");
                        if state.kvs.len() <= kvs.len().saturating_mul(MAX_KV_QUEUE) {
                            state.checksum.update(&kvs);
                            state.kvs.append(&mut kvs);
                            state.offset = self.parser.pos();
                            state.row_id = last_row_id;
                            rendezvous.kv_ready.notify_one();
                            break;
                        }
                    }
                    notified.await;
                }
            }

            {
                let mut state = rendezvous.state.lock().expect("chunk rendezvous poisoned");
                state.encode_completed = true;
            }
            rendezvous.kv_ready.notify_one();
            Ok((read_dur, encode_dur))
        };

        let ((read_dur, encode_dur), deliver_dur) = tokio::try_join!(producer, deliverer)?;

        tracing::info!(
            table = %tr.table_name,
            engine_id,
            chunk = self.index,
            key = %chunk_key,
            took = ?timer.elapsed(),
            read = ?read_dur,
            encode = ?encode_dur,
            deliver = ?deliver_dur,
            "restored chunk"
        );
        Ok(())
    }
}
