use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::common::{Result, Semaphore, StoreError};

/// One buffer of a batch write, addressed by its physical file position.
pub(crate) struct WriteRequest {
    pub(crate) file: Arc<File>,
    pub(crate) file_name: Arc<str>,
    /// Position in the underlying file (header already added)
    pub(crate) position: u64,
    /// Remaining bytes to transfer
    pub(crate) data: Bytes,
    /// Batch completion channel, one message per buffer
    pub(crate) completion: Sender<Result<()>>,
    /// In-flight limit of the owning file, released on completion
    pub(crate) admission: Arc<Semaphore>,
    /// Dirty counter of the owning file, bumped on successful completion
    pub(crate) dirty_counter: Arc<AtomicU64>,
}

impl WriteRequest {
    fn complete(self, result: Result<()>) {
        if result.is_ok() {
            self.dirty_counter.fetch_add(1, Ordering::AcqRel);
        }
        self.admission.release(1);
        // The batch handle may already be gone; nothing waits for the result then.
        let _ = self.completion.send(result);
    }
}

/// IoService runs the worker threads that execute batch writes for every
/// paged file sharing it. Completions are delivered on the worker threads,
/// never on the submitting thread.
pub struct IoService {
    request_sender: Sender<WriteRequest>,
    request_receiver: Receiver<WriteRequest>,
    /// Guards submission against a concurrent shutdown
    running: RwLock<bool>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoService {
    /// Creates an IoService and spawns `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = unbounded::<WriteRequest>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let resubmit = sender.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("pagestore-io-{}", index))
                .spawn(move || Self::run_worker(receiver, resubmit, shutdown))?;
            workers.push(handle);
        }

        info!(threads = workers.len(), "io service started");

        Ok(Self {
            request_sender: sender,
            request_receiver: receiver,
            running: RwLock::new(true),
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    pub(crate) fn submit(&self, request: WriteRequest) -> Result<()> {
        let running = self.running.read();
        if !*running {
            return Err(StoreError::IoServiceShutdown);
        }
        self.request_sender
            .send(request)
            .map_err(|_| StoreError::IoServiceShutdown)
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Stops accepting requests, lets the workers drain the queue and joins
    /// them. Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }

        self.shutdown.store(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }

        while let Ok(request) = self.request_receiver.try_recv() {
            request.complete(Err(StoreError::IoServiceShutdown));
        }
        info!("io service stopped");
    }

    fn run_worker(
        receiver: Receiver<WriteRequest>,
        resubmit: Sender<WriteRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                while let Ok(request) = receiver.try_recv() {
                    Self::process_request(request, &resubmit);
                }
                break;
            }

            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => Self::process_request(request, &resubmit),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Executes one write. A partial transfer is resubmitted with the
    /// remaining bytes at the advanced position.
    fn process_request(request: WriteRequest, resubmit: &Sender<WriteRequest>) {
        Self::execute(request, resubmit, |file, data, position| file.write_at(data, position))
    }

    fn execute<W>(request: WriteRequest, resubmit: &Sender<WriteRequest>, write: W)
    where
        W: FnOnce(&File, &[u8], u64) -> std::io::Result<usize>,
    {
        match write(&request.file, &request.data, request.position) {
            Ok(0) => {
                let error = std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                );
                let err = StoreError::file_io(&request.file_name, request.position, error);
                request.complete(Err(err));
            }
            Ok(written) if written < request.data.len() => {
                trace!(
                    file = %request.file_name,
                    position = request.position,
                    written,
                    remaining = request.data.len() - written,
                    "partial write, resubmitting"
                );
                let rest = WriteRequest {
                    position: request.position + written as u64,
                    data: request.data.slice(written..),
                    ..request
                };
                if let Err(failed) = resubmit.send(rest) {
                    failed.0.complete(Err(StoreError::IoServiceShutdown));
                }
            }
            Ok(_) => request.complete(Ok(())),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if let Err(failed) = resubmit.send(request) {
                    failed.0.complete(Err(StoreError::IoServiceShutdown));
                }
            }
            Err(e) => {
                debug!(file = %request.file_name, position = request.position, error = %e, "batch write failed");
                let err = StoreError::file_io(&request.file_name, request.position, e);
                request.complete(Err(err));
            }
        }
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;
    use tempfile::NamedTempFile;

    fn request(
        file: &Arc<File>,
        position: u64,
        data: &[u8],
        completion: &Sender<Result<()>>,
        admission: &Arc<Semaphore>,
        dirty: &Arc<AtomicU64>,
    ) -> WriteRequest {
        WriteRequest {
            file: Arc::clone(file),
            file_name: Arc::from("test"),
            position,
            data: Bytes::copy_from_slice(data),
            completion: completion.clone(),
            admission: Arc::clone(admission),
            dirty_counter: Arc::clone(dirty),
        }
    }

    #[test]
    fn test_io_service_executes_writes() {
        let temp_file = NamedTempFile::new().unwrap();
        let file = Arc::new(temp_file.reopen().unwrap());
        let service = IoService::new(2).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(2);
        let admission = Arc::new(Semaphore::new(0));
        let dirty = Arc::new(AtomicU64::new(0));

        service
            .submit(request(&file, 0, b"hello", &tx, &admission, &dirty))
            .unwrap();
        service
            .submit(request(&file, 5, b"world", &tx, &admission, &dirty))
            .unwrap();

        rx.recv().unwrap().unwrap();
        rx.recv().unwrap().unwrap();

        let mut buf = [0u8; 10];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"helloworld");
        assert_eq!(dirty.load(Ordering::Acquire), 2);
        assert_eq!(admission.available_permits(), 2);
    }

    #[test]
    fn test_failed_buffer_releases_admission_and_siblings_complete() {
        let temp_file = NamedTempFile::new().unwrap();
        let writable = Arc::new(temp_file.reopen().unwrap());
        let read_only = Arc::new(File::open(temp_file.path()).unwrap());
        let service = IoService::new(2).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let admission = Arc::new(Semaphore::new(0));
        let dirty = Arc::new(AtomicU64::new(0));

        service
            .submit(request(&read_only, 0, b"fail", &tx, &admission, &dirty))
            .unwrap();
        service
            .submit(request(&writable, 4, b"ok-1", &tx, &admission, &dirty))
            .unwrap();
        service
            .submit(request(&writable, 8, b"ok-2", &tx, &admission, &dirty))
            .unwrap();

        let results: Vec<Result<()>> = (0..3).map(|_| rx.recv().unwrap()).collect();
        let failures = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::FileIo { .. }))));
        assert_eq!(admission.available_permits(), 3);
        assert_eq!(dirty.load(Ordering::Acquire), 2);

        let mut buf = [0u8; 8];
        writable.read_at(&mut buf, 4).unwrap();
        assert_eq!(&buf, b"ok-1ok-2");
    }

    #[test]
    fn test_partial_write_resubmits_remaining_bytes() {
        let temp_file = NamedTempFile::new().unwrap();
        let file = Arc::new(temp_file.reopen().unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let (resubmit, resubmitted) = crossbeam_channel::unbounded();
        let admission = Arc::new(Semaphore::new(0));
        let dirty = Arc::new(AtomicU64::new(0));

        let first = request(&file, 100, b"abcdefgh", &tx, &admission, &dirty);
        IoService::execute(first, &resubmit, |file, data, position| {
            file.write_at(&data[..3], position)
        });

        assert!(rx.try_recv().is_err());
        assert_eq!(admission.available_permits(), 0);
        let rest = resubmitted.try_recv().unwrap();
        assert_eq!(rest.position, 103);
        assert_eq!(&rest.data[..], b"defgh");

        IoService::process_request(rest, &resubmit);
        rx.recv().unwrap().unwrap();
        assert!(resubmitted.try_recv().is_err());
        assert_eq!(admission.available_permits(), 1);
        assert_eq!(dirty.load(Ordering::Acquire), 1);

        let mut buf = [0u8; 8];
        file.read_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn test_io_service_rejects_after_shutdown() {
        let temp_file = NamedTempFile::new().unwrap();
        let file = Arc::new(temp_file.reopen().unwrap());
        let service = IoService::new(1).unwrap();
        service.shutdown();
        assert!(!service.is_running());

        let (tx, _rx) = crossbeam_channel::bounded(1);
        let admission = Arc::new(Semaphore::new(0));
        let dirty = Arc::new(AtomicU64::new(0));
        let result = service.submit(request(&file, 0, b"late", &tx, &admission, &dirty));
        assert!(matches!(result, Err(StoreError::IoServiceShutdown)));

        // second shutdown is a no-op
        service.shutdown();
    }
}
