//! Crash-recovery tests for the network guard: a new instance finding
//! rules persisted by a previous (crashed) one must clear them before
//! installing anything of its own.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use vpn_core::guard::{FirewallBackend, GuardError, GuardPhase, GuardRuleSet, NetworkGuard};
use vpn_core::{KillSwitchPolicy, ServerEndpoint};

#[derive(Clone, Default)]
struct RecordingBackend {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingBackend {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirewallBackend for RecordingBackend {
    async fn apply(&self, rules: &GuardRuleSet) -> Result<(), GuardError> {
        self.log.lock().unwrap().push(format!("apply:{:?}", rules.phase));
        Ok(())
    }

    async fn clear(&self) -> Result<(), GuardError> {
        self.log.lock().unwrap().push("clear".to_string());
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn endpoints() -> Vec<ServerEndpoint> {
    vec![ServerEndpoint::new("203.0.113.4", 1194)]
}

fn state_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("guard-rules.json")
}

#[tokio::test]
async fn stale_rules_cleared_before_the_next_install() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::default();

    // First instance installs a lockdown and "crashes": dropped with its
    // state file and firewall footprint left behind
    {
        let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
        guard
            .lockdown(KillSwitchPolicy::Strict, &endpoints())
            .await
            .unwrap();
        assert!(state_file(&dir).exists());
    }

    // Second instance on the same state dir must clear the stale
    // footprint before applying its own rules
    let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
    guard
        .lockdown(KillSwitchPolicy::Strict, &endpoints())
        .await
        .unwrap();

    assert_eq!(
        backend.log(),
        vec!["apply:Lockdown", "clear", "apply:Lockdown"]
    );
    assert_eq!(guard.phase().await, GuardPhase::Lockdown);
    assert!(state_file(&dir).exists());
}

#[tokio::test]
async fn startup_recovery_clears_orphaned_rules() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::default();

    {
        let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
        guard
            .lockdown(KillSwitchPolicy::Strict, &endpoints())
            .await
            .unwrap();
    }

    let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
    guard.recover_stale().await.unwrap();

    assert_eq!(backend.log(), vec!["apply:Lockdown", "clear"]);
    assert_eq!(guard.phase().await, GuardPhase::Inactive);
    assert!(!state_file(&dir).exists());
}

#[tokio::test]
async fn recovery_without_state_file_touches_nothing() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::default();

    let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
    guard.recover_stale().await.unwrap();

    assert!(backend.log().is_empty());
}

#[tokio::test]
async fn corrupt_state_file_still_clears_the_footprint() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(state_file(&dir), "not json at all")
        .await
        .unwrap();

    let backend = RecordingBackend::default();
    let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
    guard.recover_stale().await.unwrap();

    assert_eq!(backend.log(), vec!["clear"]);
    assert!(!state_file(&dir).exists());
}

#[tokio::test]
async fn recovery_runs_at_most_once_per_instance() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    {
        let seed = RecordingBackend::default();
        let guard = NetworkGuard::with_backend(dir.path(), Box::new(seed));
        guard
            .lockdown(KillSwitchPolicy::Strict, &endpoints())
            .await
            .unwrap();
    }

    let backend = RecordingBackend::default();
    let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend.clone()));
    guard.recover_stale().await.unwrap();
    guard.recover_stale().await.unwrap();
    guard
        .lockdown(KillSwitchPolicy::Strict, &endpoints())
        .await
        .unwrap();

    // One clear for the stale file, then the fresh install; the repeat
    // recover and the lockdown's implicit check are no-ops
    assert_eq!(backend.log(), vec!["clear", "apply:Lockdown"]);
}

#[tokio::test]
async fn persisted_state_describes_the_installed_rules() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::default();
    let guard = NetworkGuard::with_backend(dir.path(), Box::new(backend));

    guard
        .lockdown(KillSwitchPolicy::Strict, &endpoints())
        .await
        .unwrap();

    let content = tokio::fs::read_to_string(state_file(&dir)).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(json["pid"], u64::from(std::process::id()));
    assert!(json["rule_set"]["rules"].is_array());

    guard.teardown().await.unwrap();
    assert!(!state_file(&dir).exists());
}
