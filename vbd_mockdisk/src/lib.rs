// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A mock virtual block device backend for validating the vbd transport
//! layer without a real storage medium.
//!
//! [`MockDiskDaemon`] registers itself with a [`Transport`] and answers
//! Read/Write/Flush/Unmap callbacks with deterministic synthetic responses:
//! reads are filled with [`READ_FILL_BYTE`], writes and unmap descriptors are
//! captured byte-for-byte in an append-only [`RequestLog`], and a test-set
//! mock status is reflected in every response unless a bounds overflow
//! overrides it. The daemon simulates exactly one logical disk.
//!
//! Known gap, preserved on purpose: unmap descriptors are logged verbatim and
//! never range-checked. Whether descriptor validation belongs here or in the
//! transport is unresolved, so the observed behavior is kept.

#![forbid(unsafe_code)]

mod handler;
pub mod req_log;
mod response;
pub mod test_helpers;

pub use req_log::LogEntry;
pub use req_log::RequestLog;

use anyhow::Context;
use parking_lot::Mutex;
use parking_lot::RwLock;
use response::ResponseSink;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use vbd_backend::BlockDevice;
use vbd_backend::DeviceFlags;
use vbd_backend::DeviceProperties;
use vbd_backend::DiskHandle;
use vbd_backend::NaaIdentifier;
use vbd_backend::RemoveError;
use vbd_backend::Transport;
use vbd_protocol::IoStatus;

/// Byte value used to fill every successful read.
pub const READ_FILL_BYTE: u8 = 0x2a;

/// Owner name the daemon reports at registration.
pub const OWNER_NAME: &str = "vbd-mockdisk";

/// Pre-start configuration for a [`MockDiskDaemon`].
///
/// All fields are committed into [`DeviceProperties`] when the daemon starts
/// and have no effect afterwards.
#[derive(Clone, Debug)]
pub struct MockDiskConfig {
    /// Instance name registered with the transport.
    pub instance_name: String,
    /// Logical block size in bytes.
    pub block_size: u32,
    /// Total addressable capacity in blocks.
    pub block_count: u64,
    /// Register the device as read-only.
    pub read_only: bool,
    /// Advertise a cache: enables the flush and FUA capability flags.
    pub cache_enabled: bool,
    /// Register a randomly generated serial number instead of letting the
    /// transport derive one.
    pub use_custom_serial: bool,
    /// Register a randomly generated NAA identifier.
    pub use_custom_naa_identifier: bool,
    /// Number of dispatch worker threads the transport should run.
    pub io_req_workers: usize,
}

impl Default for MockDiskConfig {
    fn default() -> Self {
        Self {
            instance_name: "vbd-mockdisk-0".to_string(),
            block_size: 512,
            block_count: 1 << 16,
            read_only: false,
            cache_enabled: true,
            use_custom_serial: false,
            use_custom_naa_identifier: false,
            io_req_workers: 4,
        }
    }
}

/// Lifecycle of a daemon instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, not yet registered with the transport.
    Created,
    /// Registered and dispatching.
    Started,
    /// Removal requested; in-flight callbacks are still being answered.
    ShuttingDown,
    /// All dispatch activity has ceased.
    Terminated,
}

/// The mock block device backend.
///
/// Construct with [`MockDiskDaemon::new`], wrap in an [`Arc`], and call
/// [`start`](Self::start). The transport's workers then drive the
/// [`BlockDevice`] callbacks concurrently; the controlling test inspects the
/// [`RequestLog`] and steers responses through
/// [`set_mock_status`](Self::set_mock_status).
pub struct MockDiskDaemon {
    config: MockDiskConfig,
    transport: Arc<dyn Transport>,
    disk: RwLock<Option<DiskHandle>>,
    sink: OnceLock<ResponseSink>,
    // Single writer (the controlling test), read by handler callbacks.
    mock_status: RwLock<IoStatus>,
    log: RequestLog,
    terminating: Arc<AtomicBool>,
    // Guards the remove / wait-for-drain / mark-terminated sequence. Never
    // held while workers process individual I/O callbacks.
    state: Mutex<LifecycleState>,
    // Used at start to hand the transport a strong callback reference.
    weak_self: Weak<MockDiskDaemon>,
}

impl MockDiskDaemon {
    /// Creates a daemon that will register with `transport` when started.
    pub fn new(transport: Arc<dyn Transport>, config: MockDiskConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            transport,
            disk: RwLock::new(None),
            sink: OnceLock::new(),
            mock_status: RwLock::new(IoStatus::SUCCESS),
            log: RequestLog::new(),
            terminating: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(LifecycleState::Created),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers the device and activates the dispatcher.
    ///
    /// Registration or dispatcher failures are setup errors fatal to the
    /// harness, surfaced with context for the test framework.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        anyhow::ensure!(
            *state == LifecycleState::Created,
            "daemon already started"
        );

        let properties = self.device_properties()?;
        tracing::debug!(?properties, "registering mock disk");

        let backend: Arc<dyn BlockDevice> = self
            .weak_self
            .upgrade()
            .context("daemon not held by an Arc")?;
        let disk = self
            .transport
            .create_disk(properties, backend)
            .context("failed to register the mock disk")?;
        *self.disk.write() = Some(disk);
        if self
            .sink
            .set(ResponseSink::new(
                self.transport.clone(),
                disk,
                self.terminating.clone(),
            ))
            .is_err()
        {
            self.rollback_registration(disk);
            anyhow::bail!("response sink already initialized");
        }

        if let Err(err) = self
            .transport
            .start_dispatcher(&disk, self.config.io_req_workers)
        {
            self.rollback_registration(disk);
            return Err(err).context("failed to start the dispatcher");
        }

        *state = LifecycleState::Started;
        tracing::info!(
            instance = %self.config.instance_name,
            block_size = self.config.block_size,
            block_count = self.config.block_count,
            "mock disk started"
        );
        Ok(())
    }

    /// Requests graceful removal and blocks until dispatch has drained.
    ///
    /// Idempotent: invoking shutdown on an already-terminated (or never
    /// started) daemon is a no-op. Concurrent shutdowns serialize on the
    /// state lock; only one performs the removal.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if !matches!(
            *state,
            LifecycleState::Started | LifecycleState::ShuttingDown
        ) {
            return Ok(());
        }
        let Some(disk) = *self.disk.read() else {
            return Ok(());
        };

        // Flag first, so in-flight callbacks racing against the removal can
        // classify subsequent send failures as expected.
        self.terminating.store(true, Ordering::SeqCst);
        *state = LifecycleState::ShuttingDown;

        // The device keeps answering queued callbacks until the transport
        // signals disconnection on its own.
        match self.transport.remove(&disk) {
            Ok(()) | Err(RemoveError::NotFound) => {}
            Err(err) => {
                return Err(err).context("failed to request removal of the mock disk");
            }
        }

        self.transport
            .wait_dispatcher(&disk)
            .context("failed waiting for the dispatcher to stop")?;

        *state = LifecycleState::Terminated;
        tracing::info!(instance = %self.config.instance_name, "mock disk terminated");
        Ok(())
    }

    /// Blocks until the transport confirms all dispatch activity has ceased.
    pub fn wait(&self) -> anyhow::Result<()> {
        let Some(disk) = *self.disk.read() else {
            return Ok(());
        };
        self.transport
            .wait_dispatcher(&disk)
            .context("failed waiting for the dispatcher to stop")
    }

    /// Marks termination as in progress without initiating a removal.
    ///
    /// Used when the controlling test knows teardown has started elsewhere
    /// and subsequent send failures should be treated as expected.
    pub fn notify_termination_in_progress(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    /// The transport handle for the registered disk, if started.
    pub fn disk_handle(&self) -> Option<DiskHandle> {
        *self.disk.read()
    }

    /// Current lifecycle state.
    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// The request log, for test assertions.
    pub fn request_log(&self) -> &RequestLog {
        &self.log
    }

    /// The configuration this daemon was created with.
    pub fn config(&self) -> &MockDiskConfig {
        &self.config
    }

    /// Sets the simulated device status applied to subsequent responses.
    ///
    /// Intended to be called from the controlling test thread between
    /// operations, never from within a handler.
    pub fn set_mock_status(&self, status: IoStatus) {
        *self.mock_status.write() = status;
    }

    /// The currently configured mock status.
    pub fn mock_status(&self) -> IoStatus {
        *self.mock_status.read()
    }

    /// Removes a registration left behind by a failed start, so nothing
    /// dangles in the transport once the daemon is dropped.
    fn rollback_registration(&self, disk: DiskHandle) {
        if let Err(err) = self.transport.remove(&disk) {
            tracing::error!(error = %err, "failed to roll back a partial registration");
        }
        *self.disk.write() = None;
    }

    pub(crate) fn sink(&self) -> &ResponseSink {
        self.sink
            .get()
            .expect("I/O callback delivered before start")
    }

    /// Builds the registration-time properties from the configuration.
    fn device_properties(&self) -> anyhow::Result<DeviceProperties> {
        let serial_number = if self.config.use_custom_serial {
            Some(random_serial()?)
        } else {
            None
        };
        let naa_identifier = if self.config.use_custom_naa_identifier {
            Some(random_naa_identifier()?)
        } else {
            None
        };
        let properties = DeviceProperties {
            instance_name: self.config.instance_name.clone(),
            owner: OWNER_NAME.to_string(),
            serial_number,
            naa_identifier,
            block_size: self.config.block_size,
            block_count: self.config.block_count,
            max_unmap_desc_count: 1,
            flags: DeviceFlags {
                read_only: self.config.read_only,
                unmap_supported: true,
                flush_supported: self.config.cache_enabled,
                fua_supported: self.config.cache_enabled,
            },
        };
        properties.validate()?;
        Ok(properties)
    }
}

impl Drop for MockDiskDaemon {
    fn drop(&mut self) {
        // Destruction of a started daemon performs the full shutdown
        // sequence so no dangling registration survives the object.
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "shutdown during drop failed");
        }
        *self.disk.write() = None;
    }
}

fn random_serial() -> anyhow::Result<String> {
    let mut hi = [0u8; 4];
    let mut lo = [0u8; 4];
    getrandom::fill(&mut hi)
        .and_then(|()| getrandom::fill(&mut lo))
        .map_err(|err| anyhow::anyhow!("failed to generate a serial number: {err}"))?;
    Ok(format!(
        "{:08x}-{:08x}",
        u32::from_le_bytes(hi),
        u32::from_le_bytes(lo)
    ))
}

fn random_naa_identifier() -> anyhow::Result<NaaIdentifier> {
    let mut data = [0u8; 16];
    getrandom::fill(&mut data[1..])
        .map_err(|err| anyhow::anyhow!("failed to generate an NAA identifier: {err}"))?;
    data[0] = 0x60;
    Ok(NaaIdentifier(data))
}
