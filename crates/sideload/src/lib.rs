//! Restore orchestration core for bulk-loading SQL dumps into a TiDB/TiKV
//! cluster through the sideband importer service.
//!
//! The pipeline bypasses the database's normal write path: dump files are
//! parsed into rows, rows are encoded into the native key/value format, the
//! pairs are streamed into importer *engines* that write sorted SSTs, and
//! the engines are ingested into the storage nodes. Afterwards each table's
//! auto-increment counter is fixed up, its local checksum is verified
//! against `ADMIN CHECKSUM TABLE`, and statistics are refreshed.
//!
//! Everything that talks to the outside world is a trait: the importer
//! client ([`importer::Importer`]), the SQL catalog ([`catalog::SqlCatalog`]),
//! the dump parser ([`mydump::ChunkParser`]), and the KV encoder
//! ([`kv::KvEncoder`]). The crate owns the orchestration between them:
//! worker pools, the resumable checkpoint engine, the chunk pipeline with
//! its back-pressured rendezvous, and the mode/compaction coordination.

pub mod catalog;
pub mod checkpoint;
pub mod chunk;
pub mod coalescer;
pub mod config;
pub mod controller;
pub mod error;
pub mod importer;
pub mod kv;
pub mod mydump;
pub mod table;
pub mod verification;
pub mod version;
pub mod worker;

pub use config::Config;
pub use controller::RestoreController;
pub use error::Cancelled;
