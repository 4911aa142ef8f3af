//! Checkpoint save coalescing.
//!
//! Chunk workers emit checkpoint deltas at a high rate; writing each one
//! individually would hammer the store. A single consumer merges deltas into
//! a per-table diff accumulator, and a one-slot dirty signal wakes the
//! background writer, which swaps the accumulator for an empty one and
//! flushes it in a single `update` call.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::checkpoint::{CheckpointMerger, CheckpointStore, TableCheckpointDiff};

enum Msg {
    Save {
        table_name: String,
        merger: CheckpointMerger,
    },
    Shutdown,
}

/// Cloneable handle used by restore tasks to emit checkpoint deltas.
#[derive(Clone)]
pub struct CheckpointSender {
    tx: mpsc::UnboundedSender<Msg>,
}

impl CheckpointSender {
    pub fn send(&self, table_name: String, merger: CheckpointMerger) {
        if self
            .tx
            .send(Msg::Save { table_name, merger })
            .is_err()
        {
            tracing::error!("checkpoint coalescer is gone, dropping a save");
        }
    }
}

/// The coalescer itself: one consumer task merging saves, one writer task
/// flushing swapped accumulators.
pub struct Coalescer {
    tx: mpsc::UnboundedSender<Msg>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Coalescer {
    pub fn spawn(store: Arc<dyn CheckpointStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let coalesced: Arc<Mutex<HashMap<String, TableCheckpointDiff>>> =
            Arc::new(Mutex::new(HashMap::new()));
        // Capacity 1: the slot is either empty or already armed, never more.
        let (dirty_tx, mut dirty_rx) = mpsc::channel::<()>(1);

        let writer_state = coalesced.clone();
        let writer = tokio::spawn(async move {
            loop {
                let more = dirty_rx.recv().await.is_some();
                let batch = {
                    let mut accum = writer_state.lock().expect("coalescer accumulator poisoned");
                    mem::take(&mut *accum)
                };
                if !batch.is_empty() {
                    if let Err(err) = store.update(&batch).await {
                        tracing::error!(error = ?err, "flushing coalesced checkpoints failed");
                    }
                }
                if !more {
                    return;
                }
            }
        });

        let consumer_state = coalesced;
        let consumer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Save { table_name, merger } => {
                        let mut accum =
                            consumer_state.lock().expect("coalescer accumulator poisoned");
                        merger.merge_into(accum.entry(table_name).or_default());
                        // Arm the dirty slot; a full slot means the writer
                        // already has a pending wake-up covering this delta.
                        let _ = dirty_tx.try_send(());
                    }
                    Msg::Shutdown => break,
                }
            }
            // Dropping dirty_tx lets the writer drain one final time and exit.
        });

        Self {
            tx,
            consumer: Mutex::new(Some(consumer)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn sender(&self) -> CheckpointSender {
        CheckpointSender {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting saves and wait until every accepted delta has been
    /// flushed. Call only after all producers have stopped.
    pub async fn close_and_wait(&self) {
        let _ = self.tx.send(Msg::Shutdown);
        let consumer = self.consumer.lock().expect("coalescer handle poisoned").take();
        if let Some(handle) = consumer {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "checkpoint consumer task failed");
            }
        }
        let writer = self.writer.lock().expect("coalescer handle poisoned").take();
        if let Some(handle) = writer {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "checkpoint writer task failed");
            }
        }
    }
}
