// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backend abstractions for the virtual block device transport.
//!
//! A backend implements [`BlockDevice`] and registers itself with a
//! [`Transport`] together with its [`DeviceProperties`]. The transport then
//! owns dispatch: its worker threads invoke the backend's callbacks, and the
//! backend answers by calling [`Transport::send_response`] with the request's
//! correlation handle. The backend never initiates traffic on its own.

#![forbid(unsafe_code)]

use std::sync::Arc;
use thiserror::Error;
use vbd_protocol::IoResponse;
use vbd_protocol::UnmapDescriptor;

/// Maximum instance name length in bytes.
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum owner name length in bytes.
pub const MAX_OWNER_LENGTH: usize = 16;

/// A device NAA identifier, used when the backend wants to advertise a custom
/// world-wide identifier instead of a transport-generated one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NaaIdentifier(pub [u8; 16]);

/// Capability flags committed at registration time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceFlags {
    /// The device rejects writes.
    pub read_only: bool,
    /// The device accepts unmap requests.
    pub unmap_supported: bool,
    /// The device accepts flush requests.
    pub flush_supported: bool,
    /// The device honors the force-unit-access flag on reads and writes.
    pub fua_supported: bool,
}

/// Static properties of a registered device.
///
/// Immutable once passed to [`Transport::create_disk`].
#[derive(Clone, Debug)]
pub struct DeviceProperties {
    /// Human-readable instance name, unique per transport.
    pub instance_name: String,
    /// The registering component's name.
    pub owner: String,
    /// Optional custom serial number. If absent, the transport derives one.
    pub serial_number: Option<String>,
    /// Optional custom NAA identifier.
    pub naa_identifier: Option<NaaIdentifier>,
    /// Logical block size in bytes.
    pub block_size: u32,
    /// Total addressable capacity in blocks.
    pub block_count: u64,
    /// Maximum number of descriptors accepted in a single unmap request.
    pub max_unmap_desc_count: u32,
    /// Capability flags.
    pub flags: DeviceFlags,
}

impl DeviceProperties {
    /// Validates the device geometry and identifier lengths.
    pub fn validate(&self) -> Result<(), InvalidProperties> {
        if self.block_size == 0 {
            return Err(InvalidProperties::ZeroBlockSize);
        }
        if self.block_count == 0 {
            return Err(InvalidProperties::EmptyDisk);
        }
        if (self.block_size as u64)
            .checked_mul(self.block_count)
            .is_none()
        {
            return Err(InvalidProperties::CapacityOverflow {
                block_size: self.block_size,
                block_count: self.block_count,
            });
        }
        if self.instance_name.len() > MAX_NAME_LENGTH {
            return Err(InvalidProperties::NameTooLong);
        }
        if self.owner.len() > MAX_OWNER_LENGTH {
            return Err(InvalidProperties::OwnerTooLong);
        }
        Ok(())
    }

    /// Total capacity in bytes.
    ///
    /// Only meaningful for properties that passed [`Self::validate`].
    pub fn capacity_in_bytes(&self) -> u64 {
        self.block_size as u64 * self.block_count
    }
}

/// Invalid [`DeviceProperties`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidProperties {
    /// Zero block size.
    #[error("block size must be nonzero")]
    ZeroBlockSize,
    /// Zero block count.
    #[error("block count must be nonzero")]
    EmptyDisk,
    /// The total capacity does not fit the addressable range.
    #[error("capacity overflow: {block_count} blocks of {block_size} bytes")]
    CapacityOverflow {
        /// Logical block size in bytes.
        block_size: u32,
        /// Total capacity in blocks.
        block_count: u64,
    },
    /// The instance name exceeds [`MAX_NAME_LENGTH`].
    #[error("instance name longer than {MAX_NAME_LENGTH} bytes")]
    NameTooLong,
    /// The owner name exceeds [`MAX_OWNER_LENGTH`].
    #[error("owner name longer than {MAX_OWNER_LENGTH} bytes")]
    OwnerTooLong,
}

/// Opaque handle identifying a registered device for the lifetime of its
/// registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiskHandle(u64);

impl DiskHandle {
    /// Creates a handle from a transport-assigned id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The transport-assigned id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The callback table a backend registers with the transport.
///
/// The transport's worker threads invoke these concurrently and in arbitrary
/// per-handle order; implementations synchronize their own shared state. Each
/// callback is responsible for eventually sending exactly one response
/// carrying the same handle and request type.
pub trait BlockDevice: Send + Sync {
    /// Reads `block_count` blocks starting at `block_address` into `buf`.
    ///
    /// `buf` is sized by the transport to exactly `block_count` blocks.
    fn read(
        &self,
        handle: u64,
        buf: &mut [u8],
        block_address: u64,
        block_count: u32,
        force_unit_access: bool,
    );

    /// Writes `block_count` blocks starting at `block_address` from `buf`.
    fn write(
        &self,
        handle: u64,
        buf: &[u8],
        block_address: u64,
        block_count: u32,
        force_unit_access: bool,
    );

    /// Flushes cached writes covering the given block range.
    fn flush(&self, handle: u64, block_address: u64, block_count: u32);

    /// Discards the contents of the described block ranges.
    fn unmap(&self, handle: u64, descriptors: &[UnmapDescriptor]);
}

/// The dispatch substrate a backend registers with.
pub trait Transport: Send + Sync {
    /// Registers a device, committing `properties` and associating `backend`
    /// as the callback target for the returned handle.
    fn create_disk(
        &self,
        properties: DeviceProperties,
        backend: Arc<dyn BlockDevice>,
    ) -> Result<DiskHandle, TransportError>;

    /// Activates `workers` dispatch threads for the device.
    fn start_dispatcher(&self, disk: &DiskHandle, workers: usize) -> Result<(), TransportError>;

    /// Blocks until all dispatch activity for the device has ceased.
    ///
    /// May be invoked from a dispatch worker when teardown is triggered by
    /// the last backend reference dropping mid-callback; implementations
    /// must not attempt to join the calling thread.
    fn wait_dispatcher(&self, disk: &DiskHandle) -> Result<(), TransportError>;

    /// Requests graceful disconnection of the device.
    ///
    /// The device keeps receiving queued callbacks until the transport
    /// signals disconnection on its own. Removing an already-removed device
    /// returns [`RemoveError::NotFound`], which callers treat as success.
    fn remove(&self, disk: &DiskHandle) -> Result<(), RemoveError>;

    /// Transmits a response, with `data` as its payload.
    fn send_response(
        &self,
        disk: &DiskHandle,
        response: &IoResponse,
        data: &[u8],
    ) -> Result<(), SendError>;
}

/// Registration or dispatcher failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Rejected device properties.
    #[error(transparent)]
    InvalidProperties(#[from] InvalidProperties),
    /// The handle does not name a registered device.
    #[error("device {0:?} is not registered")]
    UnknownDisk(DiskHandle),
    /// The dispatcher was already started for this device.
    #[error("dispatcher already running")]
    DispatcherRunning,
    /// Other transport failure.
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Device removal failure.
#[derive(Debug, Error)]
pub enum RemoveError {
    /// The device was not registered, or removal was already requested.
    #[error("device not found")]
    NotFound,
    /// Other removal failure.
    #[error("removal failed: {0}")]
    Failed(String),
}

/// Response transmission failure.
#[derive(Debug, Error)]
pub enum SendError {
    /// The transport rejected the send because the device is being removed.
    #[error("disk is disconnecting")]
    Disconnected,
    /// Other transmission failure.
    #[error("send failed: {0}")]
    Failed(String),
}
