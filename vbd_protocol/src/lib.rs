// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-level types shared between the virtual block device transport and its
//! backends: request and response records, the simulated device status, and
//! the unmap descriptor layout.

#![forbid(unsafe_code)]

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Maximum number of payload bytes the transport will move in a single
/// request or response.
pub const MAX_TRANSFER_LENGTH: u32 = 2 * 1024 * 1024;

/// The kind of I/O request delivered to a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Read a contiguous block range.
    Read,
    /// Write a contiguous block range.
    Write,
    /// Flush any cached writes covering a block range.
    Flush,
    /// Discard the contents of one or more block ranges.
    Unmap,
}

/// SCSI-style sense key identifying the class of a simulated device error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SenseKey(pub u8);

impl SenseKey {
    /// No error.
    pub const NO_SENSE: Self = Self(0x00);
    /// The request was invalid for the device's current state or geometry.
    pub const ILLEGAL_REQUEST: Self = Self(0x05);
}

/// SCSI-style additional sense code qualifying a [`SenseKey`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdditionalSenseCode(pub u8);

impl AdditionalSenseCode {
    /// No additional information.
    pub const NONE: Self = Self(0x00);
    /// The logical block address is outside the addressable range.
    pub const ILLEGAL_BLOCK: Self = Self(0x21);
}

/// Simulated device-level status carried by a response.
///
/// This is data, not an error type: backends encode synthetic failure
/// conditions here and deliver them through the normal response path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoStatus {
    /// The sense key for this status.
    pub sense_key: SenseKey,
    /// The additional sense code qualifying `sense_key`.
    pub asc: AdditionalSenseCode,
}

impl IoStatus {
    /// A successful completion.
    pub const SUCCESS: Self = Self {
        sense_key: SenseKey::NO_SENSE,
        asc: AdditionalSenseCode::NONE,
    };

    /// The status reported when a request addresses blocks past the end of
    /// the device.
    pub const fn overflow() -> Self {
        Self {
            sense_key: SenseKey::ILLEGAL_REQUEST,
            asc: AdditionalSenseCode::ILLEGAL_BLOCK,
        }
    }

    /// Returns true if this status reports no error.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// The type-specific portion of an [`IoRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestCmd {
    /// Read or write parameters.
    Rw {
        /// First block of the range.
        block_address: u64,
        /// Number of blocks in the range.
        block_count: u32,
        /// Bypass any caching layer for this request.
        force_unit_access: bool,
    },
    /// Flush parameters.
    Flush {
        /// First block of the range.
        block_address: u64,
        /// Number of blocks in the range.
        block_count: u32,
    },
    /// Unmap parameters. The descriptors travel out of band as a payload.
    Unmap {
        /// Number of unmap descriptors in the payload.
        count: u32,
    },
}

/// An inbound I/O request.
///
/// The handle is an opaque correlation id chosen by the transport, unique per
/// outstanding request, and must be echoed unchanged in the matching
/// response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoRequest {
    /// Correlation id for this request.
    pub handle: u64,
    /// The operation being requested.
    pub request_type: RequestType,
    /// Type-specific parameters.
    pub cmd: RequestCmd,
}

/// An outbound response to an [`IoRequest`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoResponse {
    /// Correlation id of the originating request.
    pub handle: u64,
    /// Must match the originating request's type.
    pub request_type: RequestType,
    /// Completion status.
    pub status: IoStatus,
}

/// A single unmap range, in the transport's wire layout.
#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnmapDescriptor {
    /// First block of the range to discard.
    pub block_address: u64,
    /// Number of blocks to discard.
    pub block_count: u32,
    /// Reserved, must be zero.
    pub reserved: u32,
}

impl UnmapDescriptor {
    /// Creates a descriptor covering `block_count` blocks starting at
    /// `block_address`.
    pub fn new(block_address: u64, block_count: u32) -> Self {
        Self {
            block_address,
            block_count,
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_status_is_not_success() {
        assert!(IoStatus::SUCCESS.is_success());
        assert!(!IoStatus::overflow().is_success());
        assert_eq!(IoStatus::overflow().sense_key, SenseKey::ILLEGAL_REQUEST);
        assert_eq!(IoStatus::overflow().asc, AdditionalSenseCode::ILLEGAL_BLOCK);
    }

    #[test]
    fn unmap_descriptor_layout() {
        assert_eq!(size_of::<UnmapDescriptor>(), 16);
        let desc = UnmapDescriptor::new(0x1122334455667788, 0x99aabbcc);
        let bytes = desc.as_bytes();
        assert_eq!(&bytes[..8], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x99aabbccu32.to_le_bytes());
        assert_eq!(&bytes[12..], &[0; 4]);
    }
}
