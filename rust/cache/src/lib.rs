//! The local half of McCache: a capacity-, size-, and TTL-bounded
//! insertion-ordered map with per-entry coherence metadata, usage metrics,
//! a change-notification callback, and outbound event emission for the
//! multicast engine.
//!
//! `LocalCache` is deliberately not synchronized.  The coherence engine owns
//! every instance behind its single mutex; nothing here blocks or performs
//! I/O beyond pushing onto an unbounded queue.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;

use mccache_error::{ErrorCodes, McCacheError};
use mccache_wire::Checksum;

pub mod clock;
mod local;

pub use local::{CacheOptions, EntryMeta, LocalCache, Origin};

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no entry for key {key}")]
    KeyMissing { key: String },
    #[error("value of {size} bytes exceeds the {limit} byte cache budget")]
    ValueTooLarge { size: usize, limit: usize },
    #[error("stored bytes did not decode: {detail}")]
    Codec { detail: String },
}

impl CacheError {
    pub fn key_missing(key: &[u8]) -> Self {
        CacheError::KeyMissing {
            key: STANDARD_NO_PAD.encode(key),
        }
    }
}

impl McCacheError for CacheError {
    fn code(&self) -> ErrorCodes {
        match self {
            CacheError::KeyMissing { .. } => ErrorCodes::NotFound,
            CacheError::ValueTooLarge { .. } => ErrorCodes::ResourceExhausted,
            CacheError::Codec { .. } => ErrorCodes::DataLoss,
        }
    }
}

/////////////////////////////////////////// Change events //////////////////////////////////////////

/// Why the callback fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// The entry was deleted shortly after it was read.
    Deletion,
    /// The entry was overwritten shortly after it was read.
    Update,
    /// The entry was evicted because a conflicting update exposed divergent
    /// replicas.
    Incoherence,
}

/// Context handed to the change callback.  The callback runs while the
/// engine lock is held: it must not block and must not call back into the
/// cache.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub namespace: String,
    pub key: Vec<u8>,
    /// When the entry was last read.
    pub lkp: u64,
    /// The timestamp of the mutation that triggered the event.
    pub tsm: u64,
    /// Nanoseconds between the last read and the mutation.
    pub elapsed_ns: u64,
    pub prev_crc: Option<Checksum>,
    pub new_crc: Option<Checksum>,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

////////////////////////////////////////////// Metrics /////////////////////////////////////////////

/// Per-cache counters since creation.  `spike_interval_ns` is the moving
/// average of gaps between mutations that landed within five seconds of the
/// previous one.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheMetrics {
    pub lookups: u64,
    pub misses: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub evicts: u64,
    pub spikes: u64,
    pub spike_interval_ns: f64,
    pub entry_count: u64,
    pub total_bytes: u64,
}
