//! File-backed durable log implementation.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use super::{LogDb, LogDbConfig};
use crate::utils::{ErrorKind, Logger, VeelaError};

use async_trait::async_trait;

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Name of the backing file inside a log directory.
const LOG_FILE_NAME: &str = "veela.wal";

/// Name of the scratch file used while reclaiming deleted records.
const COMPACT_FILE_NAME: &str = "veela.wal.compact";

/// Record framed in the backing file. Every frame is a big-endian `u64`
/// length header followed by the msgpack-encoded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum LogRecord {
    /// Value stored at a log idx.
    Value { idx: u64, value: Bytes },

    /// Every idx below `delete_before` has been marked deleted.
    Watermark { delete_before: u64 },
}

/// Action command to the logger. File cursor will be positioned at EOF after
/// every action.
#[derive(Debug)]
enum LogAction {
    /// Read the value at given idx out.
    Read { idx: u64 },

    /// Append values starting at given idx, optionally raising the deletion
    /// watermark (0 means no change).
    Append {
        append_at: u64,
        values: Vec<Bytes>,
        delete_before: u64,
    },
}

// Payload size drives the simulated storage latency.
impl GetSize for LogAction {
    fn get_heap_size(&self) -> usize {
        match self {
            LogAction::Read { .. } => 0,
            LogAction::Append { values, .. } => {
                values.iter().map(|v| v.len()).sum()
            }
        }
    }
}

/// Action result returned by the logger.
#[derive(Debug, PartialEq, Eq)]
enum LogResult {
    /// Value at the requested idx.
    Read { value: Bytes },

    /// Index range after the append.
    Append { range: (u64, u64) },
}

type LogReply = oneshot::Sender<Result<LogResult, VeelaError>>;

/// Durable log stored as a single append-only file inside a directory.
/// All file access is serialized through one logger task, so readers may
/// share the handle while the owner appends.
pub struct FileLogDb {
    /// My logging identity.
    me: Logger,

    /// Sender side of the log channel; `None` once closed.
    tx_log: Option<mpsc::UnboundedSender<(LogAction, LogReply)>>,

    /// Latest `[left_idx, to_append_idx)` published by the logger.
    rx_range: watch::Receiver<(u64, u64)>,

    /// Join handle of the logger task.
    logger_handle: Option<JoinHandle<()>>,
}

/// Backing file state, owned exclusively by the logger task.
struct Backer {
    me: Logger,
    dir: PathBuf,
    file: File,
    file_size: u64,
    sync: bool,

    /// First readable idx.
    left_idx: u64,
    /// Next idx to append at.
    next_idx: u64,
    /// File offset of the frame holding each idx in `[left_idx, next_idx)`.
    offsets: VecDeque<u64>,
    /// Set when deleted frames still occupy space in the file.
    reclaimable: bool,
}

// FileLogDb public API implementation
#[async_trait]
impl LogDb for FileLogDb {
    async fn create(
        me: Logger,
        path: &Path,
        config: &LogDbConfig,
    ) -> Result<Self, VeelaError> {
        // like `mkdir` without `-p`; fails if the path exists
        fs::create_dir(path).await.map_err(|e| {
            let kind = VeelaError::from(e).kind();
            VeelaError::new(
                kind,
                format!("cannot create log dir '{}'", path.display()),
            )
        })?;
        File::create(path.join(LOG_FILE_NAME)).await?;
        pf_info!(me; "created log at '{}'", path.display());

        let backer = Backer::open(me.clone(), path, config.logger_sync).await?;
        Ok(Self::spawn(me, backer, config.perf_a_b))
    }

    async fn open_if_exists(
        me: Logger,
        path: &Path,
        config: &LogDbConfig,
    ) -> Result<Self, VeelaError> {
        if !fs::try_exists(path.join(LOG_FILE_NAME)).await? {
            return Err(VeelaError::new(
                ErrorKind::NotFound,
                format!("log at '{}' does not exist", path.display()),
            ));
        }

        let mut backer =
            Backer::open(me.clone(), path, config.logger_sync).await?;
        backer.replay().await?;
        pf_info!(me; "opened log at '{}' with range [{}, {})",
                     path.display(), backer.left_idx, backer.next_idx);
        Ok(Self::spawn(me, backer, config.perf_a_b))
    }

    fn current_idx_range(&self) -> (u64, u64) {
        *self.rx_range.borrow()
    }

    async fn get_value_by_idx(&self, idx: u64) -> Result<Bytes, VeelaError> {
        match self.do_sync_action(LogAction::Read { idx }).await? {
            LogResult::Read { value } => Ok(value),
            _ => logged_err!(self.me; "unexpected log result type"),
        }
    }

    async fn append_and_sync_with_watermark(
        &mut self,
        append_at_idx: u64,
        values: Vec<Bytes>,
        delete_all_idx_less_than: u64,
    ) -> Result<(), VeelaError> {
        let action = LogAction::Append {
            append_at: append_at_idx,
            values,
            delete_before: delete_all_idx_less_than,
        };
        match self.do_sync_action(action).await? {
            LogResult::Append { range } => {
                pf_trace!(self.me; "appended, range now [{}, {})",
                                   range.0, range.1);
                Ok(())
            }
            _ => logged_err!(self.me; "unexpected log result type"),
        }
    }

    async fn close(&mut self) -> Result<(), VeelaError> {
        if self.tx_log.take().is_none() {
            return Err(VeelaError::new(
                ErrorKind::Closed,
                "log handle already closed",
            ));
        }
        if let Some(handle) = self.logger_handle.take() {
            handle.await?;
        }
        pf_debug!(self.me; "log closed");
        Ok(())
    }
}

impl FileLogDb {
    /// Spawns the logger task over an opened backer.
    fn spawn(me: Logger, backer: Backer, perf_a_b: Option<(u64, u64)>) -> Self {
        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let (tx_range, rx_range) =
            watch::channel((backer.left_idx, backer.next_idx));

        let logger_handle =
            tokio::spawn(Self::logger_thread(backer, rx_log, tx_range, perf_a_b));

        FileLogDb {
            me,
            tx_log: Some(tx_log),
            rx_range,
            logger_handle: Some(logger_handle),
        }
    }

    /// Submits an action and waits for its result.
    async fn do_sync_action(
        &self,
        action: LogAction,
    ) -> Result<LogResult, VeelaError> {
        let Some(tx_log) = self.tx_log.as_ref() else {
            return Err(VeelaError::new(
                ErrorKind::Closed,
                "log handle already closed",
            ));
        };
        let (tx_reply, rx_reply) = oneshot::channel();
        tx_log.send((action, tx_reply))?;
        rx_reply.await?
    }

    /// Logger task function.
    async fn logger_thread(
        mut backer: Backer,
        mut rx_log: mpsc::UnboundedReceiver<(LogAction, LogReply)>,
        tx_range: watch::Sender<(u64, u64)>,
        perf_a_b: Option<(u64, u64)>,
    ) {
        pf_debug!(backer.me; "logger task spawned");

        while let Some((action, tx_reply)) = rx_log.recv().await {
            // if doing performance delay simulation, add delay proportional
            // to payload size before carrying out the action
            if let Some((perf_a, perf_b)) = perf_a_b {
                let delay_ns = perf_a + action.get_size() as u64 * perf_b;
                time::sleep(Duration::from_nanos(delay_ns)).await;
            }

            let res = backer.do_action(action).await;
            if let Err(e) = &res {
                pf_error!(backer.me; "error during logging: {}", e);
            }
            let _ = tx_range.send((backer.left_idx, backer.next_idx));
            if tx_reply.send(res).is_err() {
                pf_warn!(backer.me; "log reply receiver dropped");
            }

            // deleted frames are reclaimed only after the append is acked
            if backer.reclaimable {
                if let Err(e) = backer.reclaim().await {
                    pf_error!(backer.me; "error reclaiming log space: {}", e);
                }
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(backer.me; "logger task exitted");
    }
}

// Backer file operations, only ever run on the logger task
impl Backer {
    /// Opens the backing file inside `dir`, positioned at EOF.
    async fn open(
        me: Logger,
        dir: &Path,
        sync: bool,
    ) -> Result<Self, VeelaError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(LOG_FILE_NAME))
            .await?;
        let file_size = file.seek(SeekFrom::End(0)).await?;
        Ok(Backer {
            me,
            dir: dir.to_path_buf(),
            file,
            file_size,
            sync,
            left_idx: 1,
            next_idx: 1,
            offsets: VecDeque::new(),
            reclaimable: false,
        })
    }

    /// Encodes a record into a length-prefixed frame.
    fn frame(record: &LogRecord) -> Result<Vec<u8>, VeelaError> {
        let record_bytes = encode_to_vec(record)?;
        let mut buf = Vec::with_capacity(8 + record_bytes.len());
        buf.extend_from_slice(&(record_bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(&record_bytes);
        Ok(buf)
    }

    /// Reads out the frame at given offset. Returns `None` if the frame is
    /// incomplete or undecodable, which marks a torn tail.
    async fn read_frame(
        &mut self,
        offset: u64,
    ) -> Result<Option<(LogRecord, u64)>, VeelaError> {
        if self.file_size.saturating_sub(offset) < 8 {
            if offset < self.file_size {
                pf_warn!(self.me; "read header at offset {} out of file bound {}",
                                  offset, self.file_size);
            }
            return Ok(None);
        }

        // read record length header
        self.file.seek(SeekFrom::Start(offset)).await?;
        let record_len = self.file.read_u64().await?;
        let offset_e = match offset
            .checked_add(8)
            .and_then(|o| o.checked_add(record_len))
        {
            Some(offset_e) if offset_e <= self.file_size => offset_e,
            _ => {
                pf_warn!(self.me; "read record invalid length {}", record_len);
                self.file.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
                return Ok(None);
            }
        };

        // read record content
        let mut record_buf: Vec<u8> = vec![0; record_len as usize];
        self.file.read_exact(&mut record_buf[..]).await?;
        self.file.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        match decode_from_slice(&record_buf) {
            Ok(record) => Ok(Some((record, offset_e))),
            Err(e) => {
                pf_warn!(self.me; "undecodable record at offset {}: {}", offset, e);
                Ok(None)
            }
        }
    }

    /// Raises the deletion watermark, dropping index entries below it.
    fn advance_left(&mut self, delete_before: u64) {
        if delete_before <= self.left_idx {
            return;
        }
        while self.left_idx < delete_before && self.left_idx < self.next_idx {
            self.offsets.pop_front();
            self.left_idx += 1;
        }
        if delete_before > self.next_idx {
            self.next_idx = delete_before;
        }
        self.left_idx = delete_before;
        self.reclaimable = true;
    }

    /// Rebuilds the in-memory index by scanning the file from the start,
    /// then truncates a torn tail if any.
    async fn replay(&mut self) -> Result<(), VeelaError> {
        let mut offset = 0;
        while let Some((record, end_offset)) = self.read_frame(offset).await? {
            match record {
                LogRecord::Value { idx, .. } => {
                    if idx != self.next_idx {
                        return logged_err!(self.me, ErrorKind::CorruptState;
                                           "record idx {} found where {} expected",
                                           idx, self.next_idx);
                    }
                    self.offsets.push_back(offset);
                    self.next_idx += 1;
                }
                LogRecord::Watermark { delete_before } => {
                    self.advance_left(delete_before);
                }
            }
            offset = end_offset;
        }

        if offset < self.file_size {
            pf_warn!(self.me; "truncating torn log tail at offset {} (size {})",
                              offset, self.file_size);
            self.file.set_len(offset).await?;
            self.file.seek(SeekFrom::End(0)).await?;
            self.file.sync_all().await?;
            self.file_size = offset;
        }
        Ok(())
    }

    /// Carry out the given action on logger.
    async fn do_action(
        &mut self,
        action: LogAction,
    ) -> Result<LogResult, VeelaError> {
        match action {
            LogAction::Read { idx } => self.read_value(idx).await,
            LogAction::Append {
                append_at,
                values,
                delete_before,
            } => self.append_values(append_at, values, delete_before).await,
        }
    }

    async fn read_value(&mut self, idx: u64) -> Result<LogResult, VeelaError> {
        if idx < self.left_idx || idx >= self.next_idx {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                format!(
                    "idx {} out of range [{}, {})",
                    idx, self.left_idx, self.next_idx
                ),
            ));
        }
        let offset = self.offsets[(idx - self.left_idx) as usize];
        match self.read_frame(offset).await? {
            Some((LogRecord::Value { idx: got, value }, _)) if got == idx => {
                Ok(LogResult::Read { value })
            }
            _ => logged_err!(self.me, ErrorKind::CorruptState;
                             "frame at offset {} does not hold idx {}",
                             offset, idx),
        }
    }

    async fn append_values(
        &mut self,
        append_at: u64,
        values: Vec<Bytes>,
        delete_before: u64,
    ) -> Result<LogResult, VeelaError> {
        if append_at != self.next_idx {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                format!(
                    "append at idx {} but next idx is {}",
                    append_at, self.next_idx
                ),
            ));
        }
        let new_next = self.next_idx + values.len() as u64;
        if delete_before > new_next {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                format!(
                    "deletion watermark {} beyond next idx {}",
                    delete_before, new_next
                ),
            ));
        }

        // value frames first, then the watermark frame, all in one write
        let mut buf = Vec::new();
        let mut frame_offsets = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            frame_offsets.push(self.file_size + buf.len() as u64);
            buf.extend(Self::frame(&LogRecord::Value {
                idx: append_at + i as u64,
                value,
            })?);
        }
        if delete_before > self.left_idx {
            buf.extend(Self::frame(&LogRecord::Watermark { delete_before })?);
        }

        self.file.write_all(&buf).await?;
        if self.sync {
            self.file.sync_data().await?;
        }
        self.file_size += buf.len() as u64;

        self.offsets.extend(frame_offsets);
        self.next_idx = new_next;
        self.advance_left(delete_before);
        Ok(LogResult::Append {
            range: (self.left_idx, self.next_idx),
        })
    }

    /// Physically drops deleted frames by rewriting the live tail behind a
    /// fresh watermark frame into a scratch file, then renaming it over the
    /// backing file. The scratch handle becomes the backing handle, so
    /// nothing can fail once the rename took effect.
    async fn reclaim(&mut self) -> Result<(), VeelaError> {
        self.reclaimable = false;
        let live_from = self.offsets.front().copied().unwrap_or(self.file_size);
        let head = Self::frame(&LogRecord::Watermark {
            delete_before: self.left_idx,
        })?;

        let mut tail = vec![0; (self.file_size - live_from) as usize];
        self.file.seek(SeekFrom::Start(live_from)).await?;
        self.file.read_exact(&mut tail[..]).await?;
        self.file.seek(SeekFrom::End(0)).await?; // recover cursor to EOF

        let scratch_path = self.dir.join(COMPACT_FILE_NAME);
        let mut scratch = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&scratch_path)
            .await?;
        scratch.write_all(&head).await?;
        scratch.write_all(&tail).await?;
        scratch.sync_all().await?;
        let new_size = scratch.seek(SeekFrom::End(0)).await?;
        debug_assert_eq!(new_size, (head.len() + tail.len()) as u64);

        fs::rename(&scratch_path, self.dir.join(LOG_FILE_NAME)).await?;

        let head_len = head.len() as u64;
        for offset in self.offsets.iter_mut() {
            *offset = *offset - live_from + head_len;
        }
        pf_debug!(self.me; "reclaimed {} bytes of deleted records",
                           self.file_size.saturating_sub(new_size));
        self.file = scratch;
        self.file_size = new_size;
        Ok(())
    }
}
