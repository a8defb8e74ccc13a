// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outbound response path.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use vbd_backend::DiskHandle;
use vbd_backend::Transport;
use vbd_protocol::IoResponse;
use vbd_protocol::IoStatus;
use vbd_protocol::MAX_TRANSFER_LENGTH;
use vbd_protocol::RequestType;

/// Wraps the transport's response channel for one registered disk.
///
/// Enforces the transfer-length invariant and reconciles send failures with
/// an in-progress termination: once teardown has started, the transport may
/// legitimately reject sends against the disk being removed, so those
/// failures are suppressed. Any other send failure is a fatal harness error.
pub(crate) struct ResponseSink {
    transport: Arc<dyn Transport>,
    disk: DiskHandle,
    terminating: Arc<AtomicBool>,
}

impl ResponseSink {
    pub fn new(
        transport: Arc<dyn Transport>,
        disk: DiskHandle,
        terminating: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            disk,
            terminating,
        }
    }

    /// Sends a response correlated with `handle`, carrying `data` as its
    /// payload.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the maximum transfer length (the handler must
    /// never construct such a response), or if transmission fails while no
    /// termination is in progress.
    pub fn send(&self, handle: u64, request_type: RequestType, status: IoStatus, data: &[u8]) {
        assert!(
            data.len() <= MAX_TRANSFER_LENGTH as usize,
            "response payload of {} bytes exceeds the maximum transfer length",
            data.len()
        );

        let response = IoResponse {
            handle,
            request_type,
            status,
        };
        match self.transport.send_response(&self.disk, &response, data) {
            Ok(()) => {}
            Err(err) if self.terminating.load(Ordering::SeqCst) => {
                tracing::debug!(handle, error = %err, "suppressed send failure during teardown");
            }
            Err(err) => panic!("unable to send response for request {handle:#x}: {err}"),
        }
    }
}
