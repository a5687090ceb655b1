//! Guard rule sets
//!
//! Rule sets are built here as ordered, declarative directives; the
//! platform backend translates them into actual firewall state. Keeping
//! construction separate from installation lets the leak invariant be
//! checked without touching the OS.

use serde::{Deserialize, Serialize};

use crate::profile::{DnsPolicy, KillSwitchPolicy, ServerEndpoint};

/// One firewall/routing directive, ordered first-match within a set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum GuardRule {
    /// Permit loopback traffic
    AllowLoopback,
    /// Permit egress to one host:port (VPN handshake exemption)
    AllowEndpoint { host: String, port: u16 },
    /// Permit egress only through the named tunnel interface
    AllowInterface { interface: String },
    /// Force DNS to the given resolvers, reached via the tunnel
    RedirectDns { servers: Vec<String> },
    /// Block all remaining egress
    DenyAllEgress,
}

/// Which shape of protection a rule set implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardPhase {
    /// No rules installed
    Inactive,
    /// Pre-connect lockdown: only loopback and handshake traffic
    Lockdown,
    /// Tunnel up: only loopback and tunnel-interface traffic
    Narrowed,
}

/// The ordered directives currently (or about to be) installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRuleSet {
    pub phase: GuardPhase,
    pub rules: Vec<GuardRule>,
}

impl GuardRuleSet {
    pub fn empty() -> Self {
        Self { phase: GuardPhase::Inactive, rules: Vec::new() }
    }

    /// Pre-connect lockdown: deny everything except loopback and the
    /// handshake endpoints. With the kill switch off, nothing is
    /// installed and pre-VPN connectivity remains available.
    pub fn lockdown(policy: KillSwitchPolicy, endpoints: &[ServerEndpoint]) -> Self {
        if policy == KillSwitchPolicy::Off {
            return Self { phase: GuardPhase::Lockdown, rules: Vec::new() };
        }

        let mut rules = vec![GuardRule::AllowLoopback];
        for endpoint in endpoints {
            rules.push(GuardRule::AllowEndpoint {
                host: endpoint.host.clone(),
                port: endpoint.port,
            });
        }
        rules.push(GuardRule::DenyAllEgress);

        Self { phase: GuardPhase::Lockdown, rules }
    }

    /// Tunnel-only egress after the tunnel interface exists. The
    /// handshake endpoint stays exempt so rekeys and keepalives keep
    /// flowing outside the tunnel itself.
    pub fn tunnel_only(
        policy: KillSwitchPolicy,
        interface: &str,
        endpoints: &[ServerEndpoint],
        dns: &DnsPolicy,
    ) -> Self {
        if policy == KillSwitchPolicy::Off {
            return Self { phase: GuardPhase::Narrowed, rules: Vec::new() };
        }

        let mut rules = vec![GuardRule::AllowLoopback];
        for endpoint in endpoints {
            rules.push(GuardRule::AllowEndpoint {
                host: endpoint.host.clone(),
                port: endpoint.port,
            });
        }
        rules.push(GuardRule::AllowInterface { interface: interface.to_string() });

        match dns {
            DnsPolicy::Tunnel => {
                // Resolvers pushed by the tunnel live behind the tunnel
                // interface, already covered by AllowInterface
            }
            DnsPolicy::Custom(servers) => {
                rules.push(GuardRule::RedirectDns { servers: servers.clone() });
            }
            DnsPolicy::Inherit => {}
        }

        rules.push(GuardRule::DenyAllEgress);

        Self { phase: GuardPhase::Narrowed, rules }
    }

    /// True when the set leaves non-loopback egress open outside the
    /// tunnel and the handshake exemptions. Used to assert the leak
    /// invariant in tests.
    pub fn permits_unguarded_egress(&self) -> bool {
        !self.rules.contains(&GuardRule::DenyAllEgress)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<ServerEndpoint> {
        vec![ServerEndpoint::new("vpn.example.com", 1194)]
    }

    #[test]
    fn lockdown_denies_everything_but_loopback_and_handshake() {
        let set = GuardRuleSet::lockdown(KillSwitchPolicy::Strict, &endpoints());
        assert_eq!(set.phase, GuardPhase::Lockdown);
        assert_eq!(set.rules.first(), Some(&GuardRule::AllowLoopback));
        assert_eq!(set.rules.last(), Some(&GuardRule::DenyAllEgress));
        assert!(set.rules.contains(&GuardRule::AllowEndpoint {
            host: "vpn.example.com".to_string(),
            port: 1194,
        }));
        assert!(!set.permits_unguarded_egress());
    }

    #[test]
    fn kill_switch_off_installs_nothing() {
        let set = GuardRuleSet::lockdown(KillSwitchPolicy::Off, &endpoints());
        assert!(set.is_empty());
        assert!(set.permits_unguarded_egress());
    }

    #[test]
    fn narrowed_set_allows_only_tunnel_interface() {
        let set = GuardRuleSet::tunnel_only(
            KillSwitchPolicy::Strict,
            "tun0",
            &endpoints(),
            &DnsPolicy::Tunnel,
        );
        assert_eq!(set.phase, GuardPhase::Narrowed);
        assert!(set.rules.contains(&GuardRule::AllowInterface { interface: "tun0".to_string() }));
        assert!(!set.permits_unguarded_egress());
    }

    #[test]
    fn custom_dns_policy_adds_redirect() {
        let set = GuardRuleSet::tunnel_only(
            KillSwitchPolicy::Strict,
            "tun0",
            &endpoints(),
            &DnsPolicy::Custom(vec!["10.8.0.1".to_string()]),
        );
        assert!(set
            .rules
            .contains(&GuardRule::RedirectDns { servers: vec!["10.8.0.1".to_string()] }));
    }

    #[test]
    fn rule_set_round_trips_through_json() {
        let set = GuardRuleSet::lockdown(KillSwitchPolicy::Permissive, &endpoints());
        let json = serde_json::to_string(&set).unwrap();
        let back: GuardRuleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
