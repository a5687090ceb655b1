//! vpn-core - VPN Connection Orchestration Library
//!
//! Async connection-management core for multi-protocol VPN clients:
//! - Protocol adapters (OpenVPN, SSTP, L2TP/IPsec, PPTP) behind one contract
//! - Connection state machine with retry/backoff and automatic reconnect
//! - Network guard: kill switch and DNS leak protection with crash recovery
//! - Tunnel metrics and health probing driving the reconnect decision
//!
//! Platform UIs and daemons embed [`Orchestrator`] and subscribe to its
//! state events; everything OS-specific lives behind the adapter and
//! firewall-backend traits.

pub mod error;
pub mod config;
pub mod profile;
pub mod secrets;
pub mod retry;
pub mod events;
pub mod metrics;
pub mod adapter;
pub mod guard;
pub mod orchestrator;

// Re-export commonly used types
pub use error::{VpnError, VpnResult};
pub use config::{CoreConfig, HealthSettings, RetrySettings, TimeoutSettings};
pub use profile::{
    AuthMode, ConnectionProfile, DnsPolicy, KillSwitchPolicy, Protocol, ServerEndpoint,
};
pub use secrets::{CredentialHandle, MemorySecretProvider, SecretProvider};
pub use events::StateEvent;
pub use metrics::{LatencyStats, MetricsSnapshot};
pub use adapter::{
    AdapterRegistry, ConnectError, LinkHealth, ProtocolAdapter, TunnelHandle,
};
pub use guard::{GuardError, GuardPhase, GuardRule, GuardRuleSet, NetworkGuard};
pub use orchestrator::{ConnectionState, Orchestrator, SessionStatus};
