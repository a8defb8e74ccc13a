// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! I/O callback implementations for the mock disk.
//!
//! All four operations share the same shape: validate preconditions, log the
//! request, compute the response status, send the response. The bounds check
//! overrides any configured mock status; unmap descriptors are deliberately
//! logged without range validation (see the crate docs).

use crate::MockDiskDaemon;
use crate::READ_FILL_BYTE;
use vbd_backend::BlockDevice;
use vbd_protocol::IoRequest;
use vbd_protocol::IoStatus;
use vbd_protocol::MAX_TRANSFER_LENGTH;
use vbd_protocol::RequestCmd;
use vbd_protocol::RequestType;
use vbd_protocol::UnmapDescriptor;
use zerocopy::IntoBytes;

/// Returns true if the block range falls outside the device.
///
/// An address computation that overflows is out of bounds by definition.
fn out_of_bounds(total_blocks: u64, block_address: u64, block_count: u32) -> bool {
    block_address
        .checked_add(block_count as u64)
        .is_none_or(|end| end > total_blocks)
}

impl MockDiskDaemon {
    /// Asserts the transfer-size precondition for data-carrying requests.
    ///
    /// A violation means the transport passed a request larger than it
    /// advertised it would, which is a setup bug, not a simulated error.
    fn checked_transfer_len(&self, block_count: u32) -> usize {
        let block_size = self.config().block_size as u64;
        assert_ne!(block_size, 0, "device registered with zero block size");
        let len = block_size * block_count as u64;
        assert!(
            len <= MAX_TRANSFER_LENGTH as u64,
            "transport delivered an oversized request: {len} bytes"
        );
        len as usize
    }

    /// Computes the response status for a bounds-checked range operation.
    ///
    /// The boolean reports whether the range overflowed the device. An
    /// in-bounds request reflects the configured mock status, which a test
    /// may have set to any value, including the overflow status itself.
    fn range_status(&self, block_address: u64, block_count: u32) -> (IoStatus, bool) {
        if out_of_bounds(self.config().block_count, block_address, block_count) {
            // TODO: consider moving this check into the transport.
            (IoStatus::overflow(), true)
        } else {
            (self.mock_status(), false)
        }
    }
}

impl BlockDevice for MockDiskDaemon {
    fn read(
        &self,
        handle: u64,
        buf: &mut [u8],
        block_address: u64,
        block_count: u32,
        force_unit_access: bool,
    ) {
        let len = self.checked_transfer_len(block_count);
        assert_eq!(buf.len(), len, "transport sized the read buffer wrong");
        tracing::trace!(handle, block_address, block_count, force_unit_access, "read");

        self.request_log().add_entry(
            IoRequest {
                handle,
                request_type: RequestType::Read,
                cmd: RequestCmd::Rw {
                    block_address,
                    block_count,
                    force_unit_access,
                },
            },
            None,
        );

        let (status, overflow) = self.range_status(block_address, block_count);
        // On overflow the buffer is deliberately left untouched, not
        // zero-filled.
        if !overflow {
            buf.fill(READ_FILL_BYTE);
        }

        self.sink().send(handle, RequestType::Read, status, buf);
    }

    fn write(
        &self,
        handle: u64,
        buf: &[u8],
        block_address: u64,
        block_count: u32,
        force_unit_access: bool,
    ) {
        let len = self.checked_transfer_len(block_count);
        assert_eq!(buf.len(), len, "transport sized the write buffer wrong");
        tracing::trace!(handle, block_address, block_count, force_unit_access, "write");

        // The payload is logged even when the write is about to be rejected
        // for bounds overflow, so tests can always assert what was sent.
        self.request_log().add_entry(
            IoRequest {
                handle,
                request_type: RequestType::Write,
                cmd: RequestCmd::Rw {
                    block_address,
                    block_count,
                    force_unit_access,
                },
            },
            Some(buf.to_vec()),
        );

        let (status, _) = self.range_status(block_address, block_count);

        // The buffer is echoed back only for symmetry with the transport's
        // response shape; it carries no meaning for writes.
        self.sink().send(handle, RequestType::Write, status, buf);
    }

    fn flush(&self, handle: u64, block_address: u64, block_count: u32) {
        tracing::trace!(handle, block_address, block_count, "flush");

        self.request_log().add_entry(
            IoRequest {
                handle,
                request_type: RequestType::Flush,
                cmd: RequestCmd::Flush {
                    block_address,
                    block_count,
                },
            },
            None,
        );

        let (status, _) = self.range_status(block_address, block_count);
        self.sink().send(handle, RequestType::Flush, status, &[]);
    }

    fn unmap(&self, handle: u64, descriptors: &[UnmapDescriptor]) {
        tracing::trace!(handle, count = descriptors.len(), "unmap");

        self.request_log().add_entry(
            IoRequest {
                handle,
                request_type: RequestType::Unmap,
                cmd: RequestCmd::Unmap {
                    count: descriptors.len() as u32,
                },
            },
            Some(descriptors.as_bytes().to_vec()),
        );

        // TODO: validate unmap descriptors.

        self.sink()
            .send(handle, RequestType::Unmap, self.mock_status(), &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_math() {
        assert!(!out_of_bounds(100, 99, 1));
        assert!(out_of_bounds(100, 99, 2));
        assert!(out_of_bounds(100, 100, 1));
        assert!(!out_of_bounds(100, 0, 100));
        assert!(out_of_bounds(100, u64::MAX, 1));
        assert!(!out_of_bounds(u64::MAX, u64::MAX - 1, 1));
    }
}
