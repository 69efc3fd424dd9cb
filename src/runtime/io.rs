//! I/O step executor.
//!
//! Moves bytes between a non-blocking stream and a round buffer, resuming
//! from wherever the previous attempt stopped. The readiness backend is
//! edge-triggered, so an attempt keeps issuing calls until the transfer
//! completes or the kernel reports `WouldBlock`; stopping earlier could
//! leave readiness unreported.

use std::io::{self, Read, Write};
use tracing::trace;

/// Outcome of one transfer attempt.
#[derive(Debug)]
pub enum Transfer {
    /// `progress` reached the target.
    Complete,
    /// No progress possible right now; re-register and retry later.
    WouldBlock,
    /// Orderly shutdown by the peer with bytes still outstanding.
    PeerClosed,
    /// Any other I/O error.
    Fatal(io::Error),
}

/// Receive into `buf[*progress..target]`.
///
/// `progress` is advanced by every byte received, including on
/// `WouldBlock`, so the next call picks up where this one stopped.
pub fn attempt_receive<R: Read + ?Sized>(
    source: &mut R,
    buf: &mut [u8],
    target: usize,
    progress: &mut usize,
) -> Transfer {
    debug_assert!(target <= buf.len(), "target exceeds buffer");
    while *progress < target {
        match source.read(&mut buf[*progress..target]) {
            Ok(0) => return Transfer::PeerClosed,
            Ok(n) => {
                *progress += n;
                trace!(n, progress = *progress, target, "recv");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Transfer::WouldBlock,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Transfer::Fatal(e),
        }
    }
    Transfer::Complete
}

/// Send `buf[*progress..target]`.
///
/// Would-block on the send side suspends exactly like the receive side.
pub fn attempt_send<W: Write + ?Sized>(
    sink: &mut W,
    buf: &[u8],
    target: usize,
    progress: &mut usize,
) -> Transfer {
    debug_assert!(target <= buf.len(), "target exceeds buffer");
    while *progress < target {
        match sink.write(&buf[*progress..target]) {
            Ok(0) => return Transfer::PeerClosed,
            Ok(n) => {
                *progress += n;
                trace!(n, progress = *progress, target, "send");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Transfer::WouldBlock,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Transfer::Fatal(e),
        }
    }
    Transfer::Complete
}
