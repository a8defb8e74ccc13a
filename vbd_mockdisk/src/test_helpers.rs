// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process dispatch substrate for exercising [`BlockDevice`] backends.
//!
//! [`SimTransport`] stands in for the real driver: it registers devices,
//! runs a pool of worker threads that deliver queued requests to the
//! backend's callbacks, and records every response the backend sends so
//! tests can assert on correlation, status, and payload. Removal is
//! graceful and idempotent: queued requests are still delivered after a
//! removal request, and a second removal reports
//! [`RemoveError::NotFound`].

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use vbd_backend::BlockDevice;
use vbd_backend::DeviceProperties;
use vbd_backend::DiskHandle;
use vbd_backend::RemoveError;
use vbd_backend::SendError;
use vbd_backend::Transport;
use vbd_backend::TransportError;
use vbd_protocol::IoResponse;
use vbd_protocol::UnmapDescriptor;

const COMPLETION_WAIT: Duration = Duration::from_secs(5);

/// A request as submitted by a test, before dispatch.
#[derive(Clone, Debug)]
pub enum SimRequest {
    /// Deliver a read callback. The transport allocates a zeroed buffer of
    /// exactly `block_count` blocks, so untouched regions are observable.
    Read {
        /// Correlation handle, unique per outstanding request.
        handle: u64,
        /// First block of the range.
        block_address: u64,
        /// Number of blocks in the range.
        block_count: u32,
        /// Bypass any caching layer.
        force_unit_access: bool,
    },
    /// Deliver a write callback carrying `data`.
    Write {
        /// Correlation handle, unique per outstanding request.
        handle: u64,
        /// The payload to write.
        data: Vec<u8>,
        /// First block of the range.
        block_address: u64,
        /// Number of blocks in the range.
        block_count: u32,
        /// Bypass any caching layer.
        force_unit_access: bool,
    },
    /// Deliver a flush callback.
    Flush {
        /// Correlation handle, unique per outstanding request.
        handle: u64,
        /// First block of the range.
        block_address: u64,
        /// Number of blocks in the range.
        block_count: u32,
    },
    /// Deliver an unmap callback.
    Unmap {
        /// Correlation handle, unique per outstanding request.
        handle: u64,
        /// The ranges to discard.
        descriptors: Vec<UnmapDescriptor>,
    },
}

/// A response recorded by the transport, paired with its payload bytes.
#[derive(Clone, Debug)]
pub struct Completion {
    /// The response record as sent by the backend.
    pub response: IoResponse,
    /// Copy of the payload that accompanied the response.
    pub data: Vec<u8>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<SimRequest>,
    removing: bool,
}

struct SimDisk {
    properties: DeviceProperties,
    // Weak so a dropped backend is not kept alive by its registration; the
    // real driver holds an opaque context pointer, not ownership.
    backend: Weak<dyn BlockDevice>,
    queue: Mutex<QueueState>,
    queue_cv: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completions: Mutex<Vec<Completion>>,
    completions_cv: Condvar,
    fail_sends: AtomicBool,
    exited_workers: AtomicUsize,
}

/// In-process transport simulation.
pub struct SimTransport {
    disks: Mutex<HashMap<u64, Arc<SimDisk>>>,
    next_id: AtomicU64,
}

impl SimTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn disk(&self, handle: &DiskHandle) -> Option<Arc<SimDisk>> {
        self.disks.lock().get(&handle.id()).cloned()
    }

    /// Queues a request for dispatch to the device's backend.
    ///
    /// # Panics
    ///
    /// Panics if the disk is unknown or a removal has already been
    /// requested; the real driver stops delivering new requests at that
    /// point, so a test doing this is broken.
    pub fn submit(&self, disk: &DiskHandle, request: SimRequest) {
        let disk = self.disk(disk).expect("submit to an unknown disk");
        let mut queue = disk.queue.lock();
        assert!(!queue.removing, "submit to a disk that is being removed");
        queue.pending.push_back(request);
        disk.queue_cv.notify_one();
    }

    /// Maps the disk handle back to its backend, as a callback would.
    pub fn context(&self, disk: &DiskHandle) -> Option<Arc<dyn BlockDevice>> {
        self.disk(disk)?.backend.upgrade()
    }

    /// The properties the device was registered with.
    pub fn properties(&self, disk: &DiskHandle) -> Option<DeviceProperties> {
        Some(self.disk(disk)?.properties.clone())
    }

    /// Returns true once removal of the disk has been requested.
    pub fn is_removing(&self, disk: &DiskHandle) -> bool {
        self.disk(disk).is_some_and(|d| d.queue.lock().removing)
    }

    /// Makes every subsequent send for the disk fail, simulating a driver
    /// that has begun tearing the device down.
    pub fn fail_sends(&self, disk: &DiskHandle, fail: bool) {
        if let Some(disk) = self.disk(disk) {
            disk.fail_sends.store(fail, Ordering::SeqCst);
        }
    }

    /// Waits for the completion correlated with `handle`.
    ///
    /// # Panics
    ///
    /// Panics if no completion arrives within a generous timeout, so a lost
    /// response fails the test instead of hanging it.
    pub fn wait_completion(&self, disk: &DiskHandle, handle: u64) -> Completion {
        let disk = self.disk(disk).expect("wait on an unknown disk");
        let deadline = Instant::now() + COMPLETION_WAIT;
        let mut completions = disk.completions.lock();
        loop {
            if let Some(completion) = completions.iter().find(|c| c.response.handle == handle) {
                return completion.clone();
            }
            if disk
                .completions_cv
                .wait_until(&mut completions, deadline)
                .timed_out()
            {
                panic!("timed out waiting for completion of request {handle:#x}");
            }
        }
    }

    /// Snapshot of every completion recorded so far, in arrival order.
    pub fn completions(&self, disk: &DiskHandle) -> Vec<Completion> {
        self.disk(disk)
            .map(|d| d.completions.lock().clone())
            .unwrap_or_default()
    }

    /// Number of dispatch workers that have exited their loop cleanly.
    ///
    /// Lets tests confirm that every worker wound down, including one that
    /// ended up running the backend's teardown from inside a dispatch.
    pub fn exited_workers(&self, disk: &DiskHandle) -> usize {
        self.disk(disk)
            .map_or(0, |d| d.exited_workers.load(Ordering::SeqCst))
    }
}

fn worker_loop(disk: &SimDisk) {
    loop {
        let request = {
            let mut queue = disk.queue.lock();
            loop {
                if let Some(request) = queue.pending.pop_front() {
                    break request;
                }
                if queue.removing {
                    return;
                }
                disk.queue_cv.wait(&mut queue);
            }
        };
        dispatch(disk, request);
    }
}

fn dispatch(disk: &SimDisk, request: SimRequest) {
    let Some(backend) = disk.backend.upgrade() else {
        tracing::warn!("dropping a request for a backend that no longer exists");
        return;
    };
    let block_size = disk.properties.block_size as usize;
    match request {
        SimRequest::Read {
            handle,
            block_address,
            block_count,
            force_unit_access,
        } => {
            let mut buf = vec![0u8; block_count as usize * block_size];
            backend.read(handle, &mut buf, block_address, block_count, force_unit_access);
        }
        SimRequest::Write {
            handle,
            data,
            block_address,
            block_count,
            force_unit_access,
        } => {
            backend.write(handle, &data, block_address, block_count, force_unit_access);
        }
        SimRequest::Flush {
            handle,
            block_address,
            block_count,
        } => {
            backend.flush(handle, block_address, block_count);
        }
        SimRequest::Unmap {
            handle,
            descriptors,
        } => {
            backend.unmap(handle, &descriptors);
        }
    }
}

impl Transport for SimTransport {
    fn create_disk(
        &self,
        properties: DeviceProperties,
        backend: Arc<dyn BlockDevice>,
    ) -> Result<DiskHandle, TransportError> {
        properties.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let disk = Arc::new(SimDisk {
            properties,
            backend: Arc::downgrade(&backend),
            queue: Mutex::new(QueueState::default()),
            queue_cv: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            completions_cv: Condvar::new(),
            fail_sends: AtomicBool::new(false),
            exited_workers: AtomicUsize::new(0),
        });
        self.disks.lock().insert(id, disk);
        Ok(DiskHandle::new(id))
    }

    fn start_dispatcher(&self, disk: &DiskHandle, workers: usize) -> Result<(), TransportError> {
        let sim = self.disk(disk).ok_or(TransportError::UnknownDisk(*disk))?;
        let mut joinable = sim.workers.lock();
        if !joinable.is_empty() {
            return Err(TransportError::DispatcherRunning);
        }
        for i in 0..workers {
            let sim = sim.clone();
            let worker = std::thread::Builder::new()
                .name(format!("vbd-io-{i}"))
                .spawn(move || {
                    worker_loop(&sim);
                    sim.exited_workers.fetch_add(1, Ordering::SeqCst);
                })
                .map_err(|err| TransportError::Failed(err.to_string()))?;
            joinable.push(worker);
        }
        Ok(())
    }

    fn wait_dispatcher(&self, disk: &DiskHandle) -> Result<(), TransportError> {
        let sim = self.disk(disk).ok_or(TransportError::UnknownDisk(*disk))?;
        let workers = std::mem::take(&mut *sim.workers.lock());
        let current = std::thread::current().id();
        for worker in workers {
            // A worker whose dispatch ended up dropping the last backend
            // reference runs the teardown itself and cannot join its own
            // thread. Detach it; it exits on its own once the queue drains.
            if worker.thread().id() == current {
                continue;
            }
            worker
                .join()
                .map_err(|_| TransportError::Failed("dispatch worker panicked".to_string()))?;
        }
        Ok(())
    }

    fn remove(&self, disk: &DiskHandle) -> Result<(), RemoveError> {
        let sim = self.disk(disk).ok_or(RemoveError::NotFound)?;
        let mut queue = sim.queue.lock();
        if queue.removing {
            // Idempotent teardown: a second removal reports the device gone.
            return Err(RemoveError::NotFound);
        }
        queue.removing = true;
        sim.queue_cv.notify_all();
        Ok(())
    }

    fn send_response(
        &self,
        disk: &DiskHandle,
        response: &IoResponse,
        data: &[u8],
    ) -> Result<(), SendError> {
        let sim = self
            .disk(disk)
            .ok_or_else(|| SendError::Failed("unknown disk".to_string()))?;
        if sim.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Disconnected);
        }
        let mut completions = sim.completions.lock();
        completions.push(Completion {
            response: *response,
            data: data.to_vec(),
        });
        sim.completions_cv.notify_all();
        Ok(())
    }
}
