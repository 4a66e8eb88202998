use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::io_service::{IoService, WriteRequest};
use crate::common::{
    validate_page_size, Result, Semaphore, StoreError, DEFAULT_MAX_IN_FLIGHT_WRITES,
    FILE_HEADER_SIZE,
};

const HEADER: u64 = FILE_HEADER_SIZE as u64;

/// PagedFile owns one logical file split into fixed-size pages, preceded by
/// a reserved header region. Every offset in its API is logical: position 0
/// is the first byte after the header.
///
/// Readers and writers take the file lock shared, so writes to different
/// offsets run in parallel. Structural operations (synch, shrink, close,
/// delete, rename, replace) take it exclusively and first wait until every
/// batch write in flight has completed.
pub struct PagedFile {
    path: RwLock<PathBuf>,
    page_size: usize,
    /// `None` while the file is closed
    file: RwLock<Option<Arc<File>>>,
    /// Logical size, header excluded
    size: AtomicU64,
    /// Completed writes not yet made durable by `synch`
    dirty_counter: Arc<AtomicU64>,
    /// Bounds the number of batch writes in flight
    admission: Arc<Semaphore>,
    max_in_flight_writes: usize,
    io: Arc<IoService>,
}

impl PagedFile {
    pub fn new<P: AsRef<Path>>(path: P, page_size: usize, io: Arc<IoService>) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            path: RwLock::new(path.as_ref().to_path_buf()),
            page_size,
            file: RwLock::new(None),
            size: AtomicU64::new(0),
            dirty_counter: Arc::new(AtomicU64::new(0)),
            admission: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT_WRITES)),
            max_in_flight_writes: DEFAULT_MAX_IN_FLIGHT_WRITES,
            io,
        })
    }

    /// Overrides the bound on outstanding batch writes. Only meaningful
    /// before the first batch is submitted.
    pub fn with_max_in_flight_writes(mut self, max_in_flight_writes: usize) -> Self {
        let max_in_flight_writes = max_in_flight_writes.max(1);
        self.admission = Arc::new(Semaphore::new(max_in_flight_writes));
        self.max_in_flight_writes = max_in_flight_writes;
        self
    }

    /// Creates the file on disk with a zeroed header. Fails if it exists.
    pub fn create(&self) -> Result<()> {
        let mut guard = self.file.write();
        let path = self.path.read().clone();
        let name = file_name(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StoreError::FileAlreadyExists(name.clone()),
                _ => StoreError::file_io(&name, 0, e),
            })?;

        write_fully(&file, &name, &[0u8; FILE_HEADER_SIZE], 0)?;

        self.size.store(0, Ordering::Release);
        self.dirty_counter.store(1, Ordering::Release);
        *guard = Some(Arc::new(file));

        info!(file = %name, page_size = self.page_size, "paged file created");
        Ok(())
    }

    /// Opens an existing file.
    ///
    /// A header shorter than `FILE_HEADER_SIZE` is zero-filled. A trailing
    /// partial page is cut off, leaving only whole pages.
    pub fn open(&self) -> Result<()> {
        let mut guard = self.file.write();
        let path = self.path.read().clone();

        let (file, size) = self.open_handle(&path)?;
        self.size.store(size, Ordering::Release);
        *guard = Some(Arc::new(file));

        info!(file = %file_name(&path), size, "paged file opened");
        Ok(())
    }

    fn open_handle(&self, path: &Path) -> Result<(File, u64)> {
        let name = file_name(path);
        if !path.exists() {
            return Err(StoreError::FileNotFound(name));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::file_io(&name, 0, e))?;

        let mut physical = file
            .metadata()
            .map_err(|e| StoreError::file_io(&name, 0, e))?
            .len();

        if physical < HEADER {
            write_fully(&file, &name, &[0u8; FILE_HEADER_SIZE], 0)?;
            self.dirty_counter.fetch_add(1, Ordering::AcqRel);
            physical = HEADER;
        }

        let data_len = physical - HEADER;
        let tail = data_len % self.page_size as u64;
        let size = data_len - tail;
        if tail != 0 {
            warn!(
                file = %name,
                physical_size = physical,
                truncated_bytes = tail,
                "file ends with a partially written page, truncating to the last full page"
            );
            file.set_len(HEADER + size)
                .map_err(|e| StoreError::file_io(&name, HEADER + size, e))?;
            self.dirty_counter.fetch_add(1, Ordering::AcqRel);
        }

        Ok((file, size))
    }

    /// Reads `buffer.len()` bytes at `offset`. Bytes past the physical end
    /// are zero-filled unless `throw_on_eof` is set.
    pub fn read(&self, offset: u64, buffer: &mut [u8], throw_on_eof: bool) -> Result<()> {
        let guard = self.file.read();
        let file = self.opened(&guard)?;
        self.check_position(offset, buffer.len())?;

        let mut done = 0;
        while done < buffer.len() {
            let position = HEADER + offset + done as u64;
            match file.read_at(&mut buffer[done..], position) {
                Ok(0) => {
                    if throw_on_eof {
                        return Err(StoreError::UnexpectedEof {
                            file: self.name(),
                            offset: offset + done as u64,
                        });
                    }
                    buffer[done..].fill(0);
                    break;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StoreError::file_io(&self.name(), offset + done as u64, e)),
            }
        }
        Ok(())
    }

    /// Writes `data` at `offset`, looping until every byte is transferred.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let guard = self.file.read();
        let file = self.opened(&guard)?;
        self.check_position(offset, data.len())?;

        write_fully(file, &self.name(), data, HEADER + offset)?;
        self.dirty_counter.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Submits every `(offset, buffer)` pair to the I/O service and returns
    /// a handle that resolves once all of them completed. Buffers in the
    /// batch are written in no particular order.
    pub fn write_batch(&self, buffers: Vec<(u64, Bytes)>) -> Result<WriteBatch> {
        let guard = self.file.read();
        let file = self.opened(&guard)?;
        for (offset, data) in &buffers {
            self.check_position(*offset, data.len())?;
        }

        let name: Arc<str> = Arc::from(self.name());
        let (sender, receiver) = unbounded();
        let mut pending = 0;

        for (offset, data) in buffers {
            self.admission.acquire(None)?;
            let request = WriteRequest {
                file: Arc::clone(file),
                file_name: Arc::clone(&name),
                position: HEADER + offset,
                data,
                completion: sender.clone(),
                admission: Arc::clone(&self.admission),
                dirty_counter: Arc::clone(&self.dirty_counter),
            };
            if let Err(e) = self.io.submit(request) {
                self.admission.release(1);
                return Err(e);
            }
            pending += 1;
        }

        debug!(file = %name, buffers = pending, "batch write submitted");
        Ok(WriteBatch {
            file_name: name.to_string(),
            pending,
            completions: receiver,
        })
    }

    /// Grows the logical size by `len` bytes and returns the offset of the
    /// new region. The file is physically extended on the first write.
    pub fn allocate_space(&self, len: u64) -> Result<u64> {
        let guard = self.file.read();
        self.opened(&guard)?;
        Ok(self.size.fetch_add(len, Ordering::AcqRel))
    }

    /// Truncates the file to `new_size` logical bytes.
    pub fn shrink(&self, new_size: u64) -> Result<()> {
        let guard = self.file.write();
        let file = self.opened(&guard)?;
        let current = self.size.load(Ordering::Acquire);
        if new_size > current {
            return Err(StoreError::OutOfRange {
                file: self.name(),
                offset: new_size,
                size: current,
            });
        }
        self.wait_in_flight_writes()?;

        file.set_len(HEADER + new_size)
            .map_err(|e| StoreError::file_io(&self.name(), new_size, e))?;
        self.size.store(new_size, Ordering::Release);
        self.dirty_counter.fetch_add(1, Ordering::AcqRel);
        debug!(file = %self.name(), from = current, to = new_size, "paged file shrunk");
        Ok(())
    }

    /// Forces completed writes to stable storage with a single flush.
    pub fn synch(&self) -> Result<()> {
        let guard = self.file.write();
        let file = self.opened(&guard)?;
        self.wait_in_flight_writes()?;
        self.sync_locked(file)
    }

    fn sync_locked(&self, file: &File) -> Result<()> {
        let pending = self.dirty_counter.load(Ordering::Acquire);
        if pending > 0 {
            file.sync_data()
                .map_err(|e| StoreError::file_io(&self.name(), 0, e))?;
            self.dirty_counter.fetch_sub(pending, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Flushes and closes the file. Closing a closed file is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.write();
        if let Some(file) = guard.as_ref() {
            self.wait_in_flight_writes()?;
            self.sync_locked(file)?;
            *guard = None;
            info!(file = %self.name(), "paged file closed");
        }
        Ok(())
    }

    /// Closes the file without flushing and removes it from disk.
    pub fn delete(&self) -> Result<()> {
        let mut guard = self.file.write();
        if guard.is_some() {
            self.wait_in_flight_writes()?;
        }
        *guard = None;

        let path = self.path.read().clone();
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::file_io(&file_name(&path), 0, e))?;
        }
        self.size.store(0, Ordering::Release);
        self.dirty_counter.store(0, Ordering::Release);
        info!(file = %file_name(&path), "paged file deleted");
        Ok(())
    }

    /// Moves the file to `new_path`. An open file stays open.
    pub fn rename_to<P: AsRef<Path>>(&self, new_path: P) -> Result<()> {
        let guard = self.file.write();
        if guard.is_some() {
            self.wait_in_flight_writes()?;
        }

        let new_path = new_path.as_ref().to_path_buf();
        let mut path = self.path.write();
        fs::rename(&*path, &new_path).map_err(|e| StoreError::file_io(&file_name(&path), 0, e))?;
        info!(from = %path.display(), to = %new_path.display(), "paged file renamed");
        *path = new_path;
        Ok(())
    }

    /// Replaces the content of this file with a copy of the file at
    /// `source`, then reopens it.
    pub fn replace_content_with<P: AsRef<Path>>(&self, source: P) -> Result<()> {
        let mut guard = self.file.write();
        if guard.is_some() {
            self.wait_in_flight_writes()?;
        }
        *guard = None;

        let path = self.path.read().clone();
        let source = source.as_ref();
        fs::copy(source, &path).map_err(|e| StoreError::file_io(&file_name(source), 0, e))?;

        self.dirty_counter.store(0, Ordering::Release);
        let (file, size) = self.open_handle(&path)?;
        self.size.store(size, Ordering::Release);
        *guard = Some(Arc::new(file));

        info!(file = %file_name(&path), source = %source.display(), size, "paged file content replaced");
        Ok(())
    }

    /// Logical size in bytes, header excluded.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pages_count(&self) -> u64 {
        self.size() / self.page_size as u64
    }

    pub fn dirty_counter(&self) -> u64 {
        self.dirty_counter.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    pub fn exists(&self) -> bool {
        self.path.read().exists()
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn name(&self) -> String {
        file_name(&self.path.read())
    }

    fn opened<'a>(&self, guard: &'a Option<Arc<File>>) -> Result<&'a Arc<File>> {
        guard.as_ref().ok_or_else(|| StoreError::FileClosed(self.name()))
    }

    fn check_position(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.size.load(Ordering::Acquire);
        if offset >= size || offset + len as u64 > size {
            return Err(StoreError::OutOfRange {
                file: self.name(),
                offset,
                size,
            });
        }
        Ok(())
    }

    /// Must be called with the file lock held exclusively: no new batch can
    /// be submitted, so holding every permit means nothing is in flight.
    fn wait_in_flight_writes(&self) -> Result<()> {
        self.admission.acquire_many(self.max_in_flight_writes, None)?;
        self.admission.release(self.max_in_flight_writes);
        Ok(())
    }
}

/// Handle of a submitted batch write.
pub struct WriteBatch {
    file_name: String,
    pending: usize,
    completions: Receiver<Result<()>>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Blocks until every buffer of the batch completed. A failed buffer
    /// does not stop its siblings; the first failure is returned.
    pub fn wait(self) -> Result<()> {
        let mut first_error = None;
        for _ in 0..self.pending {
            let result = match self.completions.recv() {
                Ok(result) => result,
                Err(_) => Err(StoreError::IoServiceShutdown),
            };
            if let Err(e) = result {
                debug!(file = %self.file_name, error = %e, "batch buffer failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn write_fully(file: &File, name: &str, data: &[u8], position: u64) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        match file.write_at(&data[done..], position + done as u64) {
            Ok(0) => {
                let e = std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned zero bytes");
                return Err(StoreError::file_io(name, position + done as u64, e));
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(StoreError::file_io(name, position + done as u64, e)),
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
