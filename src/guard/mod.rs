//! Network guard: kill switch and DNS-leak protection
//!
//! The guard owns the only code path allowed to mutate host firewall,
//! routing, and DNS configuration for this application. Its lifecycle is
//! lockdown (pre-connect, deny-all except handshake) -> narrow (tunnel-up,
//! tunnel-only egress) -> teardown, with every installed rule set
//! persisted to disk so a crashed instance's stale rules can be cleared
//! on the next startup.
//!
//! All mutation runs under one process-wide mutex: concurrent
//! lockdown/narrow/teardown calls racing each other would open a window
//! of unprotected connectivity.

pub mod platform;
pub mod rules;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::profile::{DnsPolicy, KillSwitchPolicy, ServerEndpoint};

pub use platform::FirewallBackend;
pub use rules::{GuardPhase, GuardRule, GuardRuleSet};

const STATE_FILE: &str = "guard-rules.json";

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    #[error("failed to install rules: {0}")]
    RuleInstall(String),
    #[error("failed to remove rules: {0}")]
    RuleRemove(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("cannot narrow: no lockdown in place")]
    NotLocked,
    #[error("failed to persist guard state: {0}")]
    StatePersistence(String),
}

/// On-disk record of the rules this process installed, enough to
/// uninstall them after a crash without the original profile
#[derive(Debug, Serialize, Deserialize)]
struct PersistedGuardState {
    pid: u32,
    installed_at: DateTime<Utc>,
    rule_set: GuardRuleSet,
}

struct GuardInner {
    rule_set: GuardRuleSet,
    recovery_checked: bool,
}

/// Firewall/routing guard implementing the kill switch
pub struct NetworkGuard {
    backend: Box<dyn FirewallBackend>,
    state_path: PathBuf,
    // The safety-critical critical section: one mutation at a time,
    // process-wide
    inner: Mutex<GuardInner>,
}

impl NetworkGuard {
    /// Create a guard using the platform firewall backend
    pub fn new(state_dir: &Path) -> Self {
        Self::with_backend(state_dir, platform::default_backend())
    }

    /// Create a guard with an explicit backend (tests, embedders)
    pub fn with_backend(state_dir: &Path, backend: Box<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            state_path: state_dir.join(STATE_FILE),
            inner: Mutex::new(GuardInner {
                rule_set: GuardRuleSet::empty(),
                recovery_checked: false,
            }),
        }
    }

    /// Current phase (non-blocking best effort; `Inactive` while a
    /// mutation holds the lock)
    pub async fn phase(&self) -> GuardPhase {
        self.inner.lock().await.rule_set.phase
    }

    /// Snapshot of the installed rule set
    pub async fn current_rules(&self) -> GuardRuleSet {
        self.inner.lock().await.rule_set.clone()
    }

    /// Detect and clear rules left behind by a previous crashed instance.
    /// Runs at most once per guard; also invoked implicitly by the first
    /// `lockdown`.
    pub async fn recover_stale(&self) -> Result<(), GuardError> {
        let mut inner = self.inner.lock().await;
        self.recover_stale_locked(&mut inner).await
    }

    async fn recover_stale_locked(&self, inner: &mut GuardInner) -> Result<(), GuardError> {
        if inner.recovery_checked {
            return Ok(());
        }
        inner.recovery_checked = true;

        if !self.state_path.exists() {
            return Ok(());
        }

        match self.read_state().await {
            Ok(stale) => {
                warn!(
                    "Found stale guard rules from pid {} (installed {}), clearing",
                    stale.pid, stale.installed_at
                );
                self.backend.clear().await?;
                self.remove_state().await;
                info!("Stale guard rules cleared");
            }
            Err(e) => {
                // Unreadable state still means rules may exist; clear anyway
                warn!("Unreadable guard state file ({}), clearing firewall footprint", e);
                self.backend.clear().await?;
                self.remove_state().await;
            }
        }
        Ok(())
    }

    /// Install the pre-connect lockdown. Idempotent: a second call
    /// without an intervening `teardown` returns the installed set
    /// unchanged. Called from `Narrowed` (reconnect path) it re-tightens
    /// back to lockdown rules.
    pub async fn lockdown(
        &self,
        policy: KillSwitchPolicy,
        endpoints: &[ServerEndpoint],
    ) -> Result<GuardRuleSet, GuardError> {
        let mut inner = self.inner.lock().await;
        self.recover_stale_locked(&mut inner).await?;

        let rule_set = GuardRuleSet::lockdown(policy, endpoints);

        // No-op only when the installed lockdown matches the request;
        // different endpoints need their handshake exemptions re-installed
        if inner.rule_set.phase == GuardPhase::Lockdown && inner.rule_set == rule_set {
            debug!("Lockdown already in place, keeping existing rules");
            return Ok(inner.rule_set.clone());
        }

        self.backend.apply(&rule_set).await?;
        self.persist_state(&rule_set).await?;
        inner.rule_set = rule_set.clone();

        info!("Guard lockdown installed ({} rules)", rule_set.rules.len());
        Ok(rule_set)
    }

    /// Replace lockdown with tunnel-only egress plus DNS redirection.
    /// Only valid after a lockdown; the tunnel interface must exist.
    pub async fn narrow_to_tunnel(
        &self,
        policy: KillSwitchPolicy,
        interface: &str,
        endpoints: &[ServerEndpoint],
        dns: &DnsPolicy,
    ) -> Result<GuardRuleSet, GuardError> {
        let mut inner = self.inner.lock().await;

        if inner.rule_set.phase == GuardPhase::Inactive {
            return Err(GuardError::NotLocked);
        }

        let rule_set = GuardRuleSet::tunnel_only(policy, interface, endpoints, dns);
        self.backend.apply(&rule_set).await?;
        self.persist_state(&rule_set).await?;
        inner.rule_set = rule_set.clone();

        info!("Guard narrowed to tunnel {} ({} rules)", interface, rule_set.rules.len());
        Ok(rule_set)
    }

    /// Remove every rule this process installed. Safe to call repeatedly;
    /// a no-op once inactive.
    pub async fn teardown(&self) -> Result<(), GuardError> {
        let mut inner = self.inner.lock().await;

        if inner.rule_set.phase == GuardPhase::Inactive && !self.state_path.exists() {
            debug!("Guard already inactive");
            return Ok(());
        }

        self.backend.clear().await?;
        self.remove_state().await;
        inner.rule_set = GuardRuleSet::empty();

        info!("Guard rules fully removed");
        Ok(())
    }

    async fn persist_state(&self, rule_set: &GuardRuleSet) -> Result<(), GuardError> {
        let state = PersistedGuardState {
            pid: std::process::id(),
            installed_at: Utc::now(),
            rule_set: rule_set.clone(),
        };

        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| GuardError::StatePersistence(e.to_string()))?;

        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GuardError::StatePersistence(e.to_string()))?;
        }
        tokio::fs::write(&self.state_path, json)
            .await
            .map_err(|e| GuardError::StatePersistence(e.to_string()))?;
        Ok(())
    }

    async fn read_state(&self) -> Result<PersistedGuardState, GuardError> {
        let content = tokio::fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| GuardError::StatePersistence(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| GuardError::StatePersistence(e.to_string()))
    }

    async fn remove_state(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.state_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove guard state file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Records apply/clear calls instead of touching the OS
    #[derive(Clone, Default)]
    struct RecordingBackend {
        log: Arc<StdMutex<Vec<String>>>,
        installed: Arc<StdMutex<Option<GuardRuleSet>>>,
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        async fn apply(&self, rules: &GuardRuleSet) -> Result<(), GuardError> {
            self.log.lock().unwrap().push(format!("apply:{:?}", rules.phase));
            *self.installed.lock().unwrap() = Some(rules.clone());
            Ok(())
        }

        async fn clear(&self) -> Result<(), GuardError> {
            self.log.lock().unwrap().push("clear".to_string());
            *self.installed.lock().unwrap() = None;
            Ok(())
        }
    }

    /// Backend whose installs always fail
    struct FailingBackend;

    #[async_trait]
    impl FirewallBackend for FailingBackend {
        async fn apply(&self, _rules: &GuardRuleSet) -> Result<(), GuardError> {
            Err(GuardError::RuleInstall("nft returned exit code 1".to_string()))
        }

        async fn clear(&self) -> Result<(), GuardError> {
            Ok(())
        }
    }

    fn endpoints() -> Vec<ServerEndpoint> {
        vec![ServerEndpoint::new("vpn.example.com", 1194)]
    }

    fn guard_with_recorder(dir: &Path) -> (NetworkGuard, RecordingBackend) {
        let backend = RecordingBackend::default();
        let guard = NetworkGuard::with_backend(dir, Box::new(backend.clone()));
        (guard, backend)
    }

    #[tokio::test]
    async fn lockdown_installs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, backend) = guard_with_recorder(dir.path());

        let set = guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();
        assert_eq!(set.phase, GuardPhase::Lockdown);
        assert!(!set.permits_unguarded_egress());
        assert!(dir.path().join(STATE_FILE).exists());
        assert_eq!(backend.log.lock().unwrap().as_slice(), &["apply:Lockdown"]);
    }

    #[tokio::test]
    async fn repeated_lockdown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, backend) = guard_with_recorder(dir.path());

        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();
        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();

        // Only one apply despite two calls
        assert_eq!(backend.log.lock().unwrap().iter().filter(|e| e.starts_with("apply")).count(), 1);
    }

    #[tokio::test]
    async fn lockdown_reinstalls_for_different_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, backend) = guard_with_recorder(dir.path());

        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();

        // A different server needs its own handshake exemption; the
        // stale lockdown must be replaced, not kept
        let other = vec![ServerEndpoint::new("vpn2.example.com", 443)];
        let set = guard.lockdown(KillSwitchPolicy::Strict, &other).await.unwrap();
        assert!(set.rules.contains(&GuardRule::AllowEndpoint {
            host: "vpn2.example.com".to_string(),
            port: 443,
        }));
        assert!(!set.rules.iter().any(|r| matches!(
            r,
            GuardRule::AllowEndpoint { host, .. } if host == "vpn.example.com"
        )));
        assert_eq!(backend.log.lock().unwrap().iter().filter(|e| e.starts_with("apply")).count(), 2);

        // Same endpoints again stays a no-op
        guard.lockdown(KillSwitchPolicy::Strict, &other).await.unwrap();
        assert_eq!(backend.log.lock().unwrap().iter().filter(|e| e.starts_with("apply")).count(), 2);
    }

    #[tokio::test]
    async fn narrow_requires_lockdown() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_recorder(dir.path());

        let err = guard
            .narrow_to_tunnel(KillSwitchPolicy::Strict, "tun0", &endpoints(), &DnsPolicy::Tunnel)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::NotLocked));
    }

    #[tokio::test]
    async fn narrow_replaces_lockdown_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, backend) = guard_with_recorder(dir.path());

        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();
        let set = guard
            .narrow_to_tunnel(KillSwitchPolicy::Strict, "tun0", &endpoints(), &DnsPolicy::Tunnel)
            .await
            .unwrap();

        assert_eq!(set.phase, GuardPhase::Narrowed);
        let installed = backend.installed.lock().unwrap().clone().unwrap();
        assert!(installed.rules.contains(&GuardRule::AllowInterface { interface: "tun0".into() }));
        assert!(!installed.permits_unguarded_egress());
    }

    #[tokio::test]
    async fn relockdown_from_narrowed_retightens() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_recorder(dir.path());

        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();
        guard
            .narrow_to_tunnel(KillSwitchPolicy::Strict, "tun0", &endpoints(), &DnsPolicy::Tunnel)
            .await
            .unwrap();

        let set = guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();
        assert_eq!(set.phase, GuardPhase::Lockdown);
        assert!(!set.rules.iter().any(|r| matches!(r, GuardRule::AllowInterface { .. })));
    }

    #[tokio::test]
    async fn teardown_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_recorder(dir.path());

        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();
        guard.teardown().await.unwrap();
        assert_eq!(guard.phase().await, GuardPhase::Inactive);
        assert!(!dir.path().join(STATE_FILE).exists());

        // Second call is a safe no-op
        guard.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_install_propagates_and_leaves_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let guard = NetworkGuard::with_backend(dir.path(), Box::new(FailingBackend));

        let err = guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap_err();
        assert!(matches!(err, GuardError::RuleInstall(_)));
        assert_eq!(guard.phase().await, GuardPhase::Inactive);
    }

    #[tokio::test]
    async fn stale_rules_cleared_before_new_install() {
        let dir = tempfile::tempdir().unwrap();

        // Simulate a crashed instance: write a state file directly
        let stale = PersistedGuardState {
            pid: 999_999,
            installed_at: Utc::now(),
            rule_set: GuardRuleSet::lockdown(KillSwitchPolicy::Strict, &endpoints()),
        };
        std::fs::write(
            dir.path().join(STATE_FILE),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let (guard, backend) = guard_with_recorder(dir.path());
        guard.lockdown(KillSwitchPolicy::Strict, &endpoints()).await.unwrap();

        // Old rules cleared before the new set is applied, never overlapping
        let log = backend.log.lock().unwrap();
        assert_eq!(log.as_slice(), &["clear", "apply:Lockdown"]);
    }

    #[tokio::test]
    async fn kill_switch_off_skips_rule_install_but_tracks_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, backend) = guard_with_recorder(dir.path());

        let set = guard.lockdown(KillSwitchPolicy::Off, &endpoints()).await.unwrap();
        assert!(set.is_empty());
        assert_eq!(guard.phase().await, GuardPhase::Lockdown);

        let installed = backend.installed.lock().unwrap().clone().unwrap();
        assert!(installed.is_empty());
    }
}
