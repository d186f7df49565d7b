//! Mesh layer error kinds
//!
//! Errors are latched as the node's last-error indicator and surfaced as
//! `Result` values. Recoverable conditions (missed polls, individual write
//! failures, expired offers) are consumed by the retry/backoff logic and
//! never reach the caller.

use std::fmt;

/// Errors that can occur in mesh addressing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshError {
    /// Radio or network layer refused to initialize
    FailedInit,
    /// Operation requires a joined node (or an initialized master)
    NotConfigured,
    /// Caller supplied an out-of-range parameter
    InvalidParam,
    /// Radio has unread data; renewal refused until drained
    PendingData,
    /// No neighbor answered the discovery poll
    PollFail,
    /// A contact was found but never produced an address offer
    NoResponse,
    /// Network layer refused the write
    FailedWrite,
    /// Address lookup at the master did not complete
    FailedAddrLookup,
    /// Address offer was missing, zero, or meant for another node
    FailedAddrRequest,
    /// Confirmation to the master could not be delivered
    FailedAddrConfirm,
    /// Master has no binding for the requested id or address
    NotFound,
    /// Operation exceeded its deadline
    Timeout,
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::FailedInit => write!(f, "radio/network initialization failed"),
            MeshError::NotConfigured => write!(f, "node has no mesh address"),
            MeshError::InvalidParam => write!(f, "invalid parameter"),
            MeshError::PendingData => write!(f, "radio has pending data"),
            MeshError::PollFail => write!(f, "no poll response from any neighbor"),
            MeshError::NoResponse => write!(f, "no address offer received"),
            MeshError::FailedWrite => write!(f, "network write failed"),
            MeshError::FailedAddrLookup => write!(f, "address lookup failed"),
            MeshError::FailedAddrRequest => write!(f, "address request rejected"),
            MeshError::FailedAddrConfirm => write!(f, "address confirmation failed"),
            MeshError::NotFound => write!(f, "no such binding at master"),
            MeshError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for MeshError {}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;
