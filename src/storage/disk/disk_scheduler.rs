use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::common::{PageId, Result, SiloError, PAGE_SIZE};

use super::DiskManager;

/// A disk I/O request processed by the scheduler's worker thread.
///
/// Requests own their page buffer. Reads hand the filled buffer back
/// through the completion channel; writes consume theirs.
pub enum DiskRequest {
    Read {
        page_id: PageId,
        done: std::sync::mpsc::Sender<Result<Box<[u8; PAGE_SIZE]>>>,
    },
    Write {
        page_id: PageId,
        data: Box<[u8; PAGE_SIZE]>,
        done: std::sync::mpsc::Sender<Result<()>>,
    },
}

/// DiskScheduler manages a background worker thread that processes disk I/O
/// requests. The request queue is a single FIFO channel, so requests for the
/// same page id complete in the order they were scheduled.
pub struct DiskScheduler {
    /// The disk manager for actual I/O operations
    disk_manager: Arc<DiskManager>,
    /// Channel sender for queuing requests
    request_sender: Sender<DiskRequest>,
    /// Flag to signal shutdown
    shutdown: Arc<AtomicBool>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates a new DiskScheduler with the given DiskManager.
    /// Spawns a background worker thread to process requests.
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = unbounded::<DiskRequest>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let dm_clone = Arc::clone(&disk_manager);
        let shutdown_clone = Arc::clone(&shutdown);

        let worker_handle = thread::spawn(move || {
            Self::start_worker_thread(dm_clone, receiver, shutdown_clone);
        });

        Self {
            disk_manager,
            request_sender: sender,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    /// Enqueues a disk request. Never blocks; safe to call while holding
    /// the pool latch.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        self.request_sender
            .send(request)
            .map_err(|e| SiloError::DiskScheduler(format!("failed to schedule request: {}", e)))
    }

    /// Schedules a read and waits for the filled page buffer.
    pub fn schedule_read_sync(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.schedule(DiskRequest::Read { page_id, done: tx })?;
        rx.recv()
            .map_err(|e| SiloError::DiskScheduler(format!("read completion lost: {}", e)))?
    }

    /// Schedules a write of an owned buffer; returns a receiver for the
    /// completion result.
    pub fn schedule_write(
        &self,
        page_id: PageId,
        data: Box<[u8; PAGE_SIZE]>,
    ) -> Result<std::sync::mpsc::Receiver<Result<()>>> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.schedule(DiskRequest::Write {
            page_id,
            data,
            done: tx,
        })?;
        Ok(rx)
    }

    /// Schedules a write and waits for completion.
    pub fn schedule_write_sync(&self, page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Result<()> {
        let rx = self.schedule_write(page_id, data)?;
        rx.recv()
            .map_err(|e| SiloError::DiskScheduler(format!("write completion lost: {}", e)))?
    }

    /// The background worker thread function.
    /// Processes requests from the queue until shutdown is signaled.
    fn start_worker_thread(
        disk_manager: Arc<DiskManager>,
        receiver: Receiver<DiskRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                // Drain remaining requests before exiting
                while let Ok(request) = receiver.try_recv() {
                    Self::process_request(&disk_manager, request);
                }
                break;
            }

            match receiver.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(request) => {
                    Self::process_request(&disk_manager, request);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    // Continue loop, check shutdown flag
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }
    }

    /// Processes a single disk request.
    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, done } => {
                let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
                let result = disk_manager.read_page(page_id, &mut buf[..]).map(|_| buf);
                let _ = done.send(result);
            }
            DiskRequest::Write {
                page_id,
                data,
                done,
            } => {
                let result = disk_manager.write_page(page_id, &data[..]);
                let _ = done.send(result);
            }
        }
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
