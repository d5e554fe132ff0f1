//! Durable append-only log contract and its file-backed implementation.
//!
//! Keys inside a log are always incremental positive integers, named `idx`.
//! A log allows one writer and multiple concurrent readers at the same time.

mod storage;

use std::path::Path;

use crate::utils::{Logger, VeelaError};

use async_trait::async_trait;

use bytes::Bytes;

pub use storage::FileLogDb;

/// Tunables handed to a log engine at creation/open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDbConfig {
    /// Whether to call `fsync()`/`fdatasync()` before acknowledging appends.
    pub logger_sync: bool,

    /// Simulated per-action latency `base + size * per_byte` in nanosecs;
    /// `None` disables the simulation.
    pub perf_a_b: Option<(u64, u64)>,
}

impl Default for LogDbConfig {
    fn default() -> Self {
        LogDbConfig {
            logger_sync: true,
            perf_a_b: None,
        }
    }
}

/// Durable log engine contract.
#[async_trait]
pub trait LogDb: Send + Sync {
    /// Creates a brand-new log at `path`. The path must not exist yet;
    /// intermediate directories are not created (like `mkdir` without `-p`).
    async fn create(
        me: Logger,
        path: &Path,
        config: &LogDbConfig,
    ) -> Result<Self, VeelaError>
    where
        Self: Sized;

    /// Opens an existing log, failing with `ErrorKind::NotFound` if absent.
    async fn open_if_exists(
        me: Logger,
        path: &Path,
        config: &LogDbConfig,
    ) -> Result<Self, VeelaError>
    where
        Self: Sized;

    /// Returns the range of idx which already hold a value:
    /// `[left_idx, to_append_idx)`, with `to_append_idx >= left_idx > 0`.
    fn current_idx_range(&self) -> (u64, u64);

    /// Reads the value at `idx`; fails if `idx` is out of the current range.
    async fn get_value_by_idx(&self, idx: u64) -> Result<Bytes, VeelaError>;

    /// Appends `values` starting exactly at `append_at_idx` (which must equal
    /// the current `to_append_idx`) and syncs before returning.
    async fn append_and_sync(
        &mut self,
        append_at_idx: u64,
        values: Vec<Bytes>,
    ) -> Result<(), VeelaError> {
        self.append_and_sync_with_watermark(append_at_idx, values, 0)
            .await
    }

    /// Like `append_and_sync`, additionally marking every idx below
    /// `delete_all_idx_less_than` as deletable; physical deletion may happen
    /// asynchronously. A zero watermark means no deletion; an empty `values`
    /// means no append.
    async fn append_and_sync_with_watermark(
        &mut self,
        append_at_idx: u64,
        values: Vec<Bytes>,
        delete_all_idx_less_than: u64,
    ) -> Result<(), VeelaError>;

    /// Closes the log handle.
    async fn close(&mut self) -> Result<(), VeelaError>;
}
