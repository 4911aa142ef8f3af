//! Commutative KV checksum accumulation.
//!
//! Each delivered KV pair folds into `(xor of crc64(key ∥ value), count,
//! bytes)`. The fold is associative and commutative over disjoint pair sets,
//! so per-chunk accumulators sum in any order to the per-table checksum that
//! is compared against `ADMIN CHECKSUM TABLE` after ingest.

use std::fmt;

use crc64fast_nvme::Digest;
use serde::{Deserialize, Serialize};

use crate::kv::KvPair;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvChecksum {
    checksum: u64,
    total_kvs: u64,
    total_bytes: u64,
}

impl KvChecksum {
    pub fn new(checksum: u64, total_kvs: u64, total_bytes: u64) -> Self {
        Self {
            checksum,
            total_kvs,
            total_bytes,
        }
    }

    /// Fold a sequence of KV pairs into the accumulator.
    pub fn update(&mut self, pairs: &[KvPair]) {
        for pair in pairs {
            let mut digest = Digest::new();
            digest.write(&pair.key);
            digest.write(&pair.val);
            self.checksum ^= digest.sum64();
            self.total_kvs += 1;
            self.total_bytes += pair.size() as u64;
        }
    }

    /// Fold another accumulator into this one.
    pub fn add(&mut self, other: &KvChecksum) {
        self.checksum ^= other.checksum;
        self.total_kvs += other.total_kvs;
        self.total_bytes += other.total_bytes;
    }

    pub fn sum(&self) -> u64 {
        self.checksum
    }

    pub fn sum_kvs(&self) -> u64 {
        self.total_kvs
    }

    pub fn sum_size(&self) -> u64 {
        self.total_bytes
    }
}

impl fmt::Display for KvChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{checksum:{},size:{},kvs:{}}}",
            self.checksum, self.total_bytes, self.total_kvs
        )
    }
}
