//! The common contract every protocol backend is normalized into

use async_trait::async_trait;
use std::time::Duration;

use crate::profile::{ConnectionProfile, Protocol, ServerEndpoint};
use crate::secrets::CredentialHandle;

/// Handle to an established tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    /// Tunnel network interface (e.g. "tun0", "ppp0")
    pub interface: String,
    /// Server the tunnel terminates at
    pub server: ServerEndpoint,
}

/// Adapter-reported tunnel health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Healthy,
    Degraded,
    Down,
}

/// Connect failures, translated from raw backend behavior at the adapter
/// boundary. The orchestrator's retry policy keys off the variant, never
/// off backend detail.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("authentication rejected by server")]
    AuthRejected,
    #[error("server unreachable: {endpoint}")]
    Unreachable { endpoint: String },
    #[error("handshake timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error("backend unavailable: {backend}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("protocol negotiation failed: {detail}")]
    ProtocolNegotiationFailed { detail: String },
}

/// Common interface that all protocol adapters must implement. Each
/// variant (OpenVPN, SSTP, L2TP, PPTP) delegates to its external backend;
/// only the contract is core.
///
/// Timeout discipline: `connect` and `disconnect` are bounded by the
/// orchestrator via `tokio::time::timeout` and must be safe to abandon
/// mid-flight. An adapter must release its backend process in `Drop` even
/// if `disconnect` was never awaited to completion.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol this adapter speaks
    fn protocol(&self) -> Protocol;

    /// Check if the backend software is installed and usable
    async fn is_available(&self) -> bool;

    /// Version of the underlying backend software
    async fn version(&self) -> Option<String>;

    /// Validate a profile before anything is spawned.
    /// Returns an explanation when the profile cannot work for this protocol.
    fn validate(&self, profile: &ConnectionProfile) -> Result<(), String>;

    /// Drive the backend's connect sequence. The credential handle is
    /// borrowed for the duration of the call and dropped by the caller
    /// right after, whatever the outcome.
    async fn connect(
        &mut self,
        profile: &ConnectionProfile,
        credentials: Option<&CredentialHandle>,
    ) -> Result<TunnelHandle, ConnectError>;

    /// Tear the tunnel down, best-effort. The orchestrator proceeds with
    /// guard teardown regardless of the result.
    async fn disconnect(&mut self) -> Result<(), ConnectError>;

    /// Current link health, used by the reconnect trigger
    async fn link_health(&self) -> LinkHealth;

    /// Tunnel interface name, if one exists
    fn interface_name(&self) -> Option<String>;
}

/// Factory type for creating protocol adapters; boxed so embedders and
/// tests can close over their own backend configuration
pub type AdapterFactory = Box<dyn Fn() -> Box<dyn ProtocolAdapter> + Send + Sync>;
