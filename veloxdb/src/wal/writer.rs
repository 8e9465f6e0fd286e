//! Per-log-group write-ahead log writer, per spec.md §4.7.
//!
//! Callers never touch the file directly: `append` just encodes the item and
//! drops it on an intake queue, returning immediately. A single background
//! thread per writer drains that queue and performs the actual sector-aligned
//! writes, so a slow disk only ever stalls the writer's own worker, never the
//! transaction manager thread that called `append`. The accumulation buffer
//! between the queue and the file is kept in a sector-aligned scratch buffer:
//! the last partial sector of each write is retained rather than flushed, and
//! folded into the next write instead of ever issuing a misaligned one.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use fs4::FileExt;
use log::{debug, error, trace, warn};

use crate::concurrency::align_alloc::{AlignedAllocator, AlignedBuffer};
use crate::concurrency::event_pool::Event;
use crate::concurrency::job_queue::{JobQueue, Keyed};
use crate::error::{CResult, Error};
use crate::model::LogGroupId;
use crate::store::object::CommitVersion;
use crate::txn::manager::CommitBarrier;
use crate::wal::file::{decode_block, encode_block, random_marker, FileHeader, Marker, HEADER_PAD};
use crate::wal::semaphore::SnapshotSemaphore;
use crate::wal::file::LogItem;

pub fn log_path(dir: &Path, name: &str, index: u8) -> PathBuf {
    dir.join(format!("{name}_{index}.vxl"))
}

pub fn snapshot_path(dir: &Path, name: &str, index: u8) -> PathBuf {
    dir.join(format!("{name}_{index}.vxs"))
}

struct OpenFile {
    file: File,
    header: FileHeader,
    index: u8,
    offset: u64,
}

fn open_or_create(path: &Path, sector_size: u32, index: u8, timestamp: u32) -> CResult<OpenFile> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let is_new = !path.exists();
    let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    file.try_lock_exclusive()?;
    let header = if is_new {
        let header = FileHeader::new(random_marker(), sector_size, timestamp);
        file.write_all(&header.encode())?;
        file.sync_all()?;
        header
    } else {
        let mut buf = vec![0u8; HEADER_PAD];
        file.read_exact(&mut buf)?;
        FileHeader::decode(&buf)?
    };
    let offset = file.metadata()?.len().max(HEADER_PAD as u64);
    Ok(OpenFile { file, header, index, offset })
}

/// Discovers or creates the `(file_0, file_1)` pair for a log group and
/// returns whichever has the newer timestamp as "active" (spec.md §4.9
/// step 1-2, the subset of the restorer's discovery this writer needs to
/// resume appending).
fn discover_pair(dir: &Path, name: &str, sector_size: u32) -> CResult<(OpenFile, OpenFile)> {
    let f0 = open_or_create(&log_path(dir, name, 0), sector_size, 0, 0)?;
    let f1 = open_or_create(&log_path(dir, name, 1), sector_size, 1, 0)?;
    Ok((f0, f1))
}

/// Rounds `value` up to the next multiple of `align`.
fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

fn round_down(value: u64, align: u64) -> u64 {
    value / align * align
}

/// The sector-aligned write cursor for one log file: `scratch` holds the
/// genuine (unpadded) bytes from `scratch_base` up to the file's logical
/// length, so the last partial sector of a prior write is never lost to the
/// next one's zero-padding.
struct WriteCursor {
    scratch: AlignedBuffer,
    scratch_base: u64,
}

impl WriteCursor {
    /// Primes the cursor for a file whose logical length is `offset`,
    /// reading back whatever partial-sector tail already exists on disk so
    /// a reopened writer doesn't clobber bytes a prior process wrote.
    fn open(file: &mut File, offset: u64, sector_size: u32, allocator: &AlignedAllocator) -> CResult<Self> {
        let sector_size = sector_size as u64;
        let scratch_base = round_down(offset, sector_size);
        let tail_len = (offset - scratch_base) as usize;
        let mut scratch = allocator.alloc(tail_len);
        if tail_len > 0 {
            file.seek(SeekFrom::Start(scratch_base))?;
            file.read_exact(scratch.as_mut_slice())?;
        }
        Ok(WriteCursor { scratch, scratch_base })
    }

    fn fresh(allocator: &AlignedAllocator) -> Self {
        WriteCursor {
            scratch: allocator.alloc(0),
            scratch_base: HEADER_PAD as u64,
        }
    }

    /// Combines the retained scratch tail with `new_bytes`, writes the
    /// result padded up to a sector boundary, and retains the new tail
    /// (the bytes past the last full sector) as scratch for next time.
    /// Returns the new logical end-of-file offset.
    fn write(&mut self, file: &mut File, new_bytes: &[u8], sector_size: u32, allocator: &AlignedAllocator) -> CResult<u64> {
        let sector_size = sector_size as u64;
        let combined_len = self.scratch.len() + new_bytes.len();
        let mut physical = allocator.alloc(round_up(combined_len as u64, sector_size) as usize);
        let buf = physical.as_mut_slice();
        buf[..self.scratch.len()].copy_from_slice(self.scratch.as_slice());
        buf[self.scratch.len()..combined_len].copy_from_slice(new_bytes);
        for b in &mut buf[combined_len..] {
            *b = 0;
        }

        file.seek(SeekFrom::Start(self.scratch_base))?;
        file.write_all(buf)?;
        file.sync_data()?;

        let new_end = self.scratch_base + combined_len as u64;
        let new_scratch_base = round_down(new_end, sector_size);
        let tail_len = (new_end - new_scratch_base) as usize;
        let mut tail = allocator.alloc(tail_len);
        let tail_start_in_combined = (new_scratch_base - self.scratch_base) as usize;
        tail.as_mut_slice().copy_from_slice(&buf[tail_start_in_combined..combined_len]);

        allocator.recycle(std::mem::replace(&mut self.scratch, tail));
        allocator.recycle(physical);
        self.scratch_base = new_scratch_base;
        Ok(new_end)
    }
}

struct WriterState {
    active: OpenFile,
    standby_index: u8,
    accumulated: Vec<u8>,
    cursor: WriteCursor,
}

/// One unit of work handed to the writer's background thread.
enum WalJob {
    Append { bytes: Vec<u8>, barrier: Option<Arc<CommitBarrier>> },
    Flush { done: Arc<Event> },
    Shutdown,
}

impl Keyed for WalJob {
    // A single writer has a single background thread draining the queue in
    // order, so a constant key (plain FIFO) is all that's needed.
    fn group_key(&self) -> u64 {
        0
    }
}

struct WriterCore {
    dir: PathBuf,
    name: String,
    sector_size: u32,
    block_target_size: u32,
    max_file_size: u64,
    state: Mutex<WriterState>,
    allocator: AlignedAllocator,
}

impl WriterCore {
    /// Runs one append job against the active file: buffers the item, seals
    /// a block once the accumulation target is reached, and rotates once the
    /// file has grown past its configured maximum. Called only from the
    /// writer's background thread.
    fn ingest(&self, bytes: &[u8]) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        state.accumulated.extend_from_slice(bytes);
        if state.accumulated.len() as u32 >= self.block_target_size {
            self.flush_locked(&mut state)?;
        }
        if state.active.offset >= self.max_file_size {
            self.rotate_locked(&mut state)?;
        }
        Ok(())
    }

    fn flush(&self) -> CResult<()> {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WriterState) -> CResult<()> {
        if state.accumulated.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut state.accumulated);
        let block = encode_block(&state.active.header.marker, &payload);
        let new_offset = state.cursor.write(&mut state.active.file, &block, self.sector_size, &self.allocator)?;
        state.active.offset = new_offset;
        trace!("wal[{}:{}] flushed block of {} bytes, offset now {}", self.name, state.active.index, block.len(), new_offset);
        Ok(())
    }

    /// Rotates to the standby file with a fresh timestamp (spec.md §4.7
    /// steps 2-3). Snapshot production/activation is driven separately by
    /// `request_snapshot`.
    fn rotate_locked(&self, state: &mut WriterState) -> CResult<()> {
        self.flush_locked(state)?;
        let new_index = state.standby_index;
        let new_timestamp = state.active.header.timestamp + 1;
        let mut new_file = open_or_create(&log_path(&self.dir, &self.name, new_index), self.sector_size, new_index, new_timestamp)?;
        let header = FileHeader::new(random_marker(), self.sector_size, new_timestamp);
        new_file.file.set_len(HEADER_PAD as u64)?;
        new_file.file.seek(SeekFrom::Start(0))?;
        new_file.file.write_all(&header.encode())?;
        new_file.file.sync_all()?;
        new_file.header = header;
        new_file.offset = HEADER_PAD as u64;
        let old_index = state.active.index;
        state.standby_index = old_index;
        state.active = new_file;
        state.cursor = WriteCursor::fresh(&self.allocator);
        debug!("wal[{}] rotated to file {}", self.name, new_index);
        Ok(())
    }
}

pub struct WalWriter {
    pub group: LogGroupId,
    core: Arc<WriterCore>,
    pub semaphore: SnapshotSemaphore,
    intake: Arc<JobQueue<WalJob>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn spawn_worker(core: Arc<WriterCore>, intake: Arc<JobQueue<WalJob>>, name: String) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("veloxdb-wal-{name}"))
        .spawn(move || loop {
            match intake.dequeue() {
                WalJob::Append { bytes, barrier } => {
                    if let Err(err) = core.ingest(&bytes) {
                        error!("wal[{name}] append failed: {err}");
                        if err.is_fatal() {
                            error!("wal[{name}] fatal error, writer thread shutting down");
                            if let Some(barrier) = barrier {
                                barrier.complete_one();
                            }
                            break;
                        }
                    }
                    if let Some(barrier) = barrier {
                        barrier.complete_one();
                    }
                }
                WalJob::Flush { done } => {
                    if let Err(err) = core.flush() {
                        warn!("wal[{name}] flush failed: {err}");
                    }
                    done.signal_all();
                }
                WalJob::Shutdown => break,
            }
        })
        .expect("failed to spawn wal writer thread")
}

impl WalWriter {
    pub fn open(
        group: LogGroupId,
        dir: PathBuf,
        name: impl Into<String>,
        sector_size: u32,
        block_target_size: u32,
        max_file_size: u64,
    ) -> CResult<Self> {
        let name = name.into();
        let (f0, f1) = discover_pair(&dir, &name, sector_size)?;
        let (mut active, standby_index) = if f1.header.timestamp >= f0.header.timestamp {
            (f1, f0.index)
        } else {
            (f0, f1.index)
        };
        let allocator = AlignedAllocator::new(sector_size as usize);
        let cursor = WriteCursor::open(&mut active.file, active.offset, sector_size, &allocator)?;
        let core = Arc::new(WriterCore {
            dir,
            name: name.clone(),
            sector_size,
            block_target_size,
            max_file_size,
            state: Mutex::new(WriterState {
                active,
                standby_index,
                accumulated: Vec::new(),
                cursor,
            }),
            allocator,
        });
        let intake = Arc::new(JobQueue::new(1024));
        let worker = spawn_worker(core.clone(), intake.clone(), name);
        Ok(WalWriter {
            group,
            core,
            semaphore: SnapshotSemaphore::new(),
            intake,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Encodes `item` and hands it to the background worker's intake queue;
    /// returns once queued, not once durable. Used by tests and by code that
    /// doesn't need per-item completion signaling; `append_with_barrier` is
    /// used by the transaction manager's commit path.
    pub fn append(&self, item: &LogItem) -> CResult<()> {
        self.intake.enqueue(WalJob::Append { bytes: item.encode(), barrier: None });
        Ok(())
    }

    /// Same as `append`, but completes `barrier` only once the worker
    /// thread has actually ingested the item (spec.md §4.6's async-commit
    /// barrier is resolved by durability, not by enqueueing).
    pub fn append_with_barrier(&self, item: &LogItem, barrier: Arc<CommitBarrier>) {
        self.intake.enqueue(WalJob::Append {
            bytes: item.encode(),
            barrier: Some(barrier),
        });
    }

    /// Blocks until every item queued before this call is durable on disk.
    pub fn flush(&self) -> CResult<()> {
        let done = Arc::new(Event::default());
        self.intake.enqueue(WalJob::Flush { done: done.clone() });
        done.wait();
        Ok(())
    }

    /// Produces a snapshot covering the current endpoint, rotates onto a
    /// fresh log file, then marks that file `hasSnapshot=true` once the
    /// snapshot is durable (spec.md §4.7 steps 1-6).
    pub fn request_snapshot(&self, at_version: CommitVersion, write_snapshot: impl FnOnce(CommitVersion, &Path) -> CResult<()>) -> CResult<()> {
        if !self.semaphore.enter() {
            return Err(Error::DatabaseBusy("snapshot rotation blocked".into()));
        }
        let result = self.request_snapshot_inner(at_version, write_snapshot);
        self.semaphore.exit();
        result
    }

    fn request_snapshot_inner(&self, at_version: CommitVersion, write_snapshot: impl FnOnce(CommitVersion, &Path) -> CResult<()>) -> CResult<()> {
        // Drain the intake queue first so nothing still pending gets
        // rotated out from under it by the synchronous steps below.
        self.flush()?;

        let mut state = self.core.state.lock().unwrap();
        let previous_active_index = state.active.index;
        self.core.rotate_locked(&mut state)?;
        let new_index = state.active.index;
        drop(state);

        let snapshot_file = snapshot_path(&self.core.dir, &self.core.name, new_index);
        write_snapshot(at_version, &snapshot_file)?;

        let mut state = self.core.state.lock().unwrap();
        state.active.header.has_snapshot = true;
        let encoded = state.active.header.encode();
        state.active.file.seek(SeekFrom::Start(0))?;
        state.active.file.write_all(&encoded)?;
        state.active.file.sync_all()?;
        drop(state);

        let old_snapshot = snapshot_path(&self.core.dir, &self.core.name, previous_active_index);
        if old_snapshot.exists() {
            std::fs::remove_file(old_snapshot)?;
        }
        debug!("wal[{}] snapshot produced at version {}", self.core.name, at_version);
        Ok(())
    }

    /// Reads every block of the currently active file back out, used by
    /// tests to verify durability without a full restore pass.
    pub fn read_active_items(&self) -> CResult<Vec<LogItem>> {
        let state = self.core.state.lock().unwrap();
        let mut file = state.active.file.try_clone()?;
        let marker = state.active.header.marker;
        drop(state);
        read_items_from(&mut file, &marker)
    }

    pub fn active_index(&self) -> u8 {
        self.core.state.lock().unwrap().active.index
    }

    pub fn active_has_snapshot(&self) -> bool {
        self.core.state.lock().unwrap().active.header.has_snapshot
    }

    pub fn active_snapshot_path(&self) -> PathBuf {
        snapshot_path(&self.core.dir, &self.core.name, self.active_index())
    }

    pub fn snapshot_path_for(&self, index: u8) -> PathBuf {
        snapshot_path(&self.core.dir, &self.core.name, index)
    }

    /// Reads the items of the standby (currently inactive) file, used by the
    /// restorer when the active file's predecessor still holds unapplied
    /// log items (spec.md §4.9 step 4).
    pub fn read_standby_items(&self) -> CResult<Vec<LogItem>> {
        let standby_index = self.core.state.lock().unwrap().standby_index;
        read_file_items(&log_path(&self.core.dir, &self.core.name, standby_index))
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.intake.enqueue(WalJob::Shutdown);
            if let Some(handle) = self.worker.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

/// Opens `path` read-only and decodes every item in it, for a file not
/// currently held open by this process (the standby log file).
pub fn read_file_items(path: &Path) -> CResult<Vec<LogItem>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut header_buf = vec![0u8; HEADER_PAD];
    file.read_exact(&mut header_buf)?;
    let header = FileHeader::decode(&header_buf)?;
    read_items_from(&mut file, &header.marker)
}

/// Reads every item out of every block in `file`, starting just past the
/// header, stopping at the first incomplete trailing block (an in-progress
/// write at crash time).
pub fn read_items_from(file: &mut File, marker: &Marker) -> CResult<Vec<LogItem>> {
    file.seek(SeekFrom::Start(HEADER_PAD as u64))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut offset = 0usize;
    let mut items = Vec::new();
    while offset < buf.len() {
        match decode_block(&buf[offset..], marker) {
            Ok((payload, consumed)) => {
                let mut item_offset = 0usize;
                while item_offset < payload.len() {
                    let (item, used) = LogItem::decode(&payload[item_offset..])?;
                    item_offset += used;
                    items.push(item);
                }
                offset += consumed;
            }
            Err(_) => break,
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(version: u64, groups: u8) -> LogItem {
        LogItem {
            commit_version: version,
            local_term: 0,
            global_term: 0,
            affected_log_groups: groups,
            lsn: version,
            changeset: Some(vec![1, 2, 3]),
        }
    }

    #[test]
    fn append_then_flush_then_read_back() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 64, 1 << 30).unwrap();
        writer.append(&item(1, 1)).unwrap();
        writer.append(&item(2, 1)).unwrap();
        writer.flush().unwrap();
        let items = writer.read_active_items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].commit_version, 1);
        assert_eq!(items[1].commit_version, 2);
    }

    #[test]
    fn reopen_picks_newer_timestamp_as_active() {
        let dir = tempdir().unwrap();
        {
            let writer = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 1, 1 << 30).unwrap();
            writer.append(&item(1, 1)).unwrap();
            writer.flush().unwrap();
        }
        let reopened = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 1, 1 << 30).unwrap();
        let items = reopened.read_active_items().unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn reopen_after_partial_sector_preserves_prior_bytes() {
        let dir = tempdir().unwrap();
        {
            let writer = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 8, 1 << 30).unwrap();
            writer.append(&item(1, 1)).unwrap();
            writer.flush().unwrap();
        }
        {
            let writer = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 8, 1 << 30).unwrap();
            writer.append(&item(2, 1)).unwrap();
            writer.flush().unwrap();
        }
        let reopened = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 8, 1 << 30).unwrap();
        let items = reopened.read_active_items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].commit_version, 1);
        assert_eq!(items[1].commit_version, 2);
    }

    #[test]
    fn append_with_barrier_completes_only_once_durable() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::open(0, dir.path().to_path_buf(), "master", 512, 64, 1 << 30).unwrap();
        let barrier = CommitBarrier::new(1);
        writer.append_with_barrier(&item(1, 1), barrier.clone());
        barrier.wait();
        let items = writer.read_active_items().unwrap();
        assert_eq!(items.len(), 1);
    }
}
