//! Protocol adapters
//!
//! Normalizes four structurally different VPN backends into one
//! connection contract the orchestrator can drive:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │     Orchestrator (state machine)    │
//! └──────────────┬──────────────────────┘
//!                │ ProtocolAdapter
//!    ┌───────────┼───────────┬──────────┐
//!    │           │           │          │
//!    ▼           ▼           ▼          ▼
//! ┌──────┐   ┌──────┐   ┌──────┐   ┌──────┐
//! │ OVPN │   │ SSTP │   │ L2TP │   │ PPTP │  <- backend shims
//! └──────┘   └──────┘   └──────┘   └──────┘
//! ```
//!
//! Each shim delegates the wire protocol to its external backend binary;
//! the contract, the error translation, and the timeout discipline are
//! what this module owns. Adapters are created by factories registered
//! per protocol tag, so tests can substitute scripted implementations.

pub mod common;
pub mod contract;
pub mod l2tp;
pub mod openvpn;
pub mod pptp;
pub mod sstp;

use std::collections::HashMap;

use crate::profile::Protocol;

pub use contract::{AdapterFactory, ConnectError, LinkHealth, ProtocolAdapter, TunnelHandle};

/// Registry mapping each protocol tag to its adapter factory
pub struct AdapterRegistry {
    factories: HashMap<Protocol, AdapterFactory>,
}

impl AdapterRegistry {
    /// Empty registry; callers register what they support
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registry with all four built-in shims
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(Protocol::OpenVpn, openvpn::create_adapter);
        registry.register(Protocol::Sstp, sstp::create_adapter);
        registry.register(Protocol::L2tp, l2tp::create_adapter);
        registry.register(Protocol::Pptp, pptp::create_adapter);
        registry
    }

    pub fn register<F>(&mut self, protocol: Protocol, factory: F)
    where
        F: Fn() -> Box<dyn ProtocolAdapter> + Send + Sync + 'static,
    {
        tracing::debug!("Registering adapter for {}", protocol);
        self.factories.insert(protocol, Box::new(factory));
    }

    pub fn supports(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }

    /// Instantiate a fresh adapter for one connection attempt
    pub fn create(&self, protocol: Protocol) -> Option<Box<dyn ProtocolAdapter>> {
        self.factories.get(&protocol).map(|factory| factory())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin_adapters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_all_protocols() {
        let registry = AdapterRegistry::with_builtin_adapters();
        for protocol in [Protocol::OpenVpn, Protocol::Sstp, Protocol::L2tp, Protocol::Pptp] {
            assert!(registry.supports(protocol));
            let adapter = registry.create(protocol).unwrap();
            assert_eq!(adapter.protocol(), protocol);
        }
    }

    #[test]
    fn empty_registry_creates_nothing() {
        let registry = AdapterRegistry::new();
        assert!(!registry.supports(Protocol::OpenVpn));
        assert!(registry.create(Protocol::OpenVpn).is_none());
    }
}
