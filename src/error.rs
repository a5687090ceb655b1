//! Error types for vpn-core

use crate::adapter::ConnectError;
use crate::guard::GuardError;

#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    /// A session is already live; disconnect first
    #[error("already connected")]
    AlreadyConnected,
    /// No live session to operate on
    #[error("not connected")]
    NotConnected,
    /// Another connect/disconnect/retry sequence is in flight
    #[error("operation in progress")]
    OperationInProgress,
    /// Secret provider failure; never retried
    #[error("credential error: {0}")]
    Credential(String),
    /// Adapter handshake failure, translated at the adapter boundary
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),
    /// Privileged firewall/routing/DNS operation failed; always terminal
    /// for the current attempt
    #[error("network guard error: {0}")]
    Guard(#[from] GuardError),
    /// Reconnect ceiling exhausted
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },
    /// In-flight connect abandoned because disconnect was requested;
    /// the handshake result is discarded
    #[error("connect cancelled by disconnect request")]
    Cancelled,
    /// Configuration invalid or unreadable
    #[error("configuration error: {0}")]
    Config(String),
    /// Profile failed adapter validation before any process was spawned
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VpnError {
    /// Whether the orchestrator's reconnect policy may retry after this
    /// error. Only transient transport failures qualify; auth and guard
    /// failures are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VpnError::Connect(ConnectError::Timeout { .. })
                | VpnError::Connect(ConnectError::Unreachable { .. })
        )
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
