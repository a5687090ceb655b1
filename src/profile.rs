//! Connection profiles
//!
//! A `ConnectionProfile` is the immutable description of one VPN server
//! the client can connect to: which protocol to speak, where the server
//! lives, how to authenticate, and which DNS and kill-switch policies
//! apply while the tunnel is (or should be) up. Profiles are created by
//! the caller and never mutated; the orchestrator holds exactly one per
//! live session.

use serde::{Deserialize, Serialize};

/// Supported tunnel protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    OpenVpn,
    Sstp,
    L2tp,
    Pptp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenVpn => "openvpn",
            Protocol::Sstp => "sstp",
            Protocol::L2tp => "l2tp",
            Protocol::Pptp => "pptp",
        }
    }

    /// Default server port for the protocol's handshake
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::OpenVpn => 1194,
            Protocol::Sstp => 443,
            Protocol::L2tp => 1701,
            Protocol::Pptp => 1723,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VPN server endpoint (host plus handshake port)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How the adapter authenticates against the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AuthMode {
    /// Username/password looked up through the secret provider
    Password { username: String },
    /// Client certificate + key files on disk
    Certificate { ca_cert: String, client_cert: String, client_key: String },
    /// Pre-shared key looked up through the secret provider (L2TP/IPsec)
    PresharedKey,
}

/// Where DNS queries go while the tunnel is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "servers")]
pub enum DnsPolicy {
    /// Use resolvers pushed by the tunnel
    Tunnel,
    /// Use an explicit resolver list, reached via the tunnel
    Custom(Vec<String>),
    /// Leave host DNS configuration untouched
    Inherit,
}

/// Kill-switch behavior when the tunnel is not protecting traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchPolicy {
    /// Lockdown stays engaged on failure until explicitly released
    Strict,
    /// Lockdown is removed when a connection attempt ends in failure
    Permissive,
    /// No lockdown at all; pre-VPN connectivity always available
    Off,
}

/// Immutable description of one VPN connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Profile identifier, used as the secret-provider lookup key
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub protocol: Protocol,
    /// Candidate endpoints; adapters use the first, remaining entries are
    /// fallbacks for future attempts
    pub endpoints: Vec<ServerEndpoint>,
    pub auth: AuthMode,
    #[serde(default = "default_dns_policy")]
    pub dns: DnsPolicy,
    #[serde(default = "default_kill_switch")]
    pub kill_switch: KillSwitchPolicy,
}

fn default_dns_policy() -> DnsPolicy {
    DnsPolicy::Tunnel
}

fn default_kill_switch() -> KillSwitchPolicy {
    KillSwitchPolicy::Strict
}

impl ConnectionProfile {
    /// The endpoint the next connect attempt should target
    pub fn primary_endpoint(&self) -> Option<&ServerEndpoint> {
        self.endpoints.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> ConnectionProfile {
        ConnectionProfile {
            id: "work-vpn".to_string(),
            name: "Work VPN".to_string(),
            protocol: Protocol::OpenVpn,
            endpoints: vec![ServerEndpoint::new("vpn.example.com", 1194)],
            auth: AuthMode::Password { username: "alice".to_string() },
            dns: DnsPolicy::Tunnel,
            kill_switch: KillSwitchPolicy::Strict,
        }
    }

    #[test]
    fn protocol_default_ports() {
        assert_eq!(Protocol::OpenVpn.default_port(), 1194);
        assert_eq!(Protocol::Sstp.default_port(), 443);
        assert_eq!(Protocol::L2tp.default_port(), 1701);
        assert_eq!(Protocol::Pptp.default_port(), 1723);
    }

    #[test]
    fn profile_round_trips_through_json() {
        let profile = sample_profile();
        let json = serde_json::to_string(&profile).unwrap();
        let back: ConnectionProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }

    #[test]
    fn dns_and_kill_switch_default_when_omitted() {
        let json = r#"{
            "id": "p1",
            "name": "P1",
            "protocol": "sstp",
            "endpoints": [{"host": "vpn.example.com", "port": 443}],
            "auth": {"mode": "password", "username": "bob"}
        }"#;
        let profile: ConnectionProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.dns, DnsPolicy::Tunnel);
        assert_eq!(profile.kill_switch, KillSwitchPolicy::Strict);
    }

    #[test]
    fn primary_endpoint_is_first() {
        let mut profile = sample_profile();
        profile.endpoints.push(ServerEndpoint::new("backup.example.com", 1194));
        assert_eq!(profile.primary_endpoint().unwrap().host, "vpn.example.com");
    }
}
