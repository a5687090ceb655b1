//! Connection orchestrator
//!
//! The state machine tying everything together. It owns exactly one
//! adapter instance at a time, drives the network guard through its
//! lockdown/narrow/teardown lifecycle, consumes metrics to decide on
//! reconnection, and exposes the lifecycle API callers see.
//!
//! Transition discipline: one connect/disconnect/retry sequence in
//! flight at a time, serialized by the session mutex. A caller hitting a
//! busy orchestrator gets `OperationInProgress` immediately instead of
//! queuing. A disconnect during an in-flight connect flips the cancel
//! flag; the connect observes it at its next await point, discards the
//! handshake, and settles the guard.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterRegistry, ConnectError, LinkHealth, ProtocolAdapter, TunnelHandle};
use crate::config::CoreConfig;
use crate::error::{VpnError, VpnResult};
use crate::events::{EventBus, StateEvent};
use crate::guard::NetworkGuard;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::profile::{AuthMode, ConnectionProfile, KillSwitchPolicy};
use crate::retry::BackoffSchedule;
use crate::secrets::{CredentialHandle, SecretProvider};

/// Lifecycle states. `Failed` is not a resting state: a terminal failure
/// lands in `Disconnected` with the cause carried as `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Locking,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// Non-blocking view of the current session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub profile_id: Option<String>,
    pub interface: Option<String>,
    pub server: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub metrics: Option<MetricsSnapshot>,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            profile_id: None,
            interface: None,
            server: None,
            connected_since: None,
            retry_count: 0,
            metrics: None,
            last_error: None,
        }
    }
}

/// The one live session; exists only while non-Disconnected
struct Session {
    id: Uuid,
    profile: ConnectionProfile,
    adapter: Box<dyn ProtocolAdapter>,
    tunnel: TunnelHandle,
    collector: MetricsCollector,
    monitor: JoinHandle<()>,
}

struct Inner {
    config: CoreConfig,
    registry: AdapterRegistry,
    guard: Arc<NetworkGuard>,
    secrets: Arc<dyn SecretProvider>,
    events: EventBus,
    session: Mutex<Option<Session>>,
    status: StdRwLock<SessionStatus>,
    metrics_rx: StdRwLock<Option<watch::Receiver<Option<MetricsSnapshot>>>>,
    cancel: watch::Sender<bool>,
}

/// Unified lifecycle API over the protocol adapters, network guard, and
/// metrics collector
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator with the built-in adapters and the platform firewall
    /// backend
    pub fn new(config: CoreConfig, secrets: Arc<dyn SecretProvider>) -> Self {
        let guard = Arc::new(NetworkGuard::new(&config.paths.state_dir));
        Self::with_parts(config, AdapterRegistry::with_builtin_adapters(), guard, secrets)
    }

    /// Orchestrator with explicit adapters and guard (embedders, tests)
    pub fn with_parts(
        config: CoreConfig,
        registry: AdapterRegistry,
        guard: Arc<NetworkGuard>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                guard,
                secrets,
                events: EventBus::default(),
                session: Mutex::new(None),
                status: StdRwLock::new(SessionStatus::idle()),
                metrics_rx: StdRwLock::new(None),
                cancel,
            }),
        }
    }

    /// Subscribe to state-change events. At-least-once per transition;
    /// duplicates of the same state must be tolerated.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }

    /// Non-blocking state + latest metrics snapshot
    pub fn status(&self) -> SessionStatus {
        let mut status = self.inner.status.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(rx) = self.inner.metrics_rx.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            status.metrics = rx.borrow().clone();
        }
        status
    }

    /// Clear any stale guard rules left by a previous crashed instance.
    /// Also happens implicitly on the first lockdown.
    pub async fn recover(&self) -> VpnResult<()> {
        self.inner.guard.recover_stale().await?;
        Ok(())
    }

    /// Explicit override releasing a strict-policy lockdown left engaged
    /// after a failed session
    pub async fn release_guard(&self) -> VpnResult<()> {
        let slot = self.inner.session.try_lock().map_err(|_| VpnError::OperationInProgress)?;
        if slot.is_some() {
            return Err(VpnError::AlreadyConnected);
        }
        self.inner.guard.teardown().await?;
        info!("Guard lockdown released by explicit override");
        Ok(())
    }

    /// Establish a connection for `profile`:
    /// Disconnected -> Locking -> Connecting -> Connected.
    pub async fn connect(&self, profile: ConnectionProfile) -> VpnResult<()> {
        let mut slot = self
            .inner
            .session
            .try_lock()
            .map_err(|_| VpnError::OperationInProgress)?;
        if slot.is_some() {
            return Err(VpnError::AlreadyConnected);
        }

        info!("Connect requested: {} ({})", profile.name, profile.protocol);
        let policy = profile.kill_switch;
        self.set_state(ConnectionState::Locking, None);

        if let Err(e) = self.inner.guard.lockdown(policy, &profile.endpoints).await {
            error!("Pre-connect lockdown failed: {}", e);
            // Nothing may be left half-installed
            let _ = self.inner.guard.teardown().await;
            self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
            return Err(e.into());
        }

        // Still Locking: profile validation and credential resolution
        // both settle before subscribers ever see Connecting
        let credentials = match self.prepare_attempt(&profile).await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("Pre-connect preparation failed: {}", e);
                self.settle_failure(&profile).await;
                self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Connecting, None);

        let mut schedule = BackoffSchedule::new(&self.inner.config.retry);
        loop {
            match self.attempt_once(&profile, credentials.as_ref()).await {
                Ok((adapter, handle)) => {
                    return self.promote(&mut slot, &profile, adapter, handle).await;
                }
                Err(VpnError::Cancelled) => {
                    return self.settle_cancelled().await;
                }
                Err(e) if e.is_retryable() => match schedule.next_delay() {
                    Some(delay) => {
                        warn!("Connect attempt failed ({}), retrying in {:?}", e, delay);
                        self.set_retry_count(schedule.attempts());
                        self.set_state(ConnectionState::Reconnecting, Some(e.to_string()));
                        if self.cancellable_sleep(delay).await.is_err() {
                            return self.settle_cancelled().await;
                        }
                        self.set_state(ConnectionState::Connecting, None);
                    }
                    None => {
                        let attempts = schedule.attempts();
                        warn!("Connect retries exhausted after {} attempts", attempts);
                        self.settle_failure(&profile).await;
                        let err = VpnError::MaxRetriesExceeded { attempts };
                        self.set_state(ConnectionState::Disconnected, Some(err.to_string()));
                        return Err(err);
                    }
                },
                Err(e) => {
                    error!("Connect failed: {}", e);
                    self.settle_failure(&profile).await;
                    self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// Tear down the current session: valid from any non-Disconnected
    /// state, reaches Disconnected even if the adapter is unresponsive.
    pub async fn disconnect(&self) -> VpnResult<()> {
        match self.inner.session.try_lock() {
            Ok(mut slot) => match slot.take() {
                Some(session) => {
                    self.do_disconnect(session).await;
                    Ok(())
                }
                None => Err(VpnError::NotConnected),
            },
            Err(_) => {
                // A connect or retry sequence is in flight: cancel it and
                // wait for it to settle
                debug!("Disconnect requested mid-transition, cancelling");
                self.inner.cancel.send_replace(true);
                let mut slot = self.inner.session.lock().await;
                self.inner.cancel.send_replace(false);
                if let Some(session) = slot.take() {
                    // The in-flight sequence reached Connected before it
                    // saw the cancel flag
                    self.do_disconnect(session).await;
                }
                Ok(())
            }
        }
    }

    // ---- internals ----

    fn set_state(&self, next: ConnectionState, error: Option<String>) {
        let previous = {
            let mut status = self.inner.status.write().unwrap_or_else(|e| e.into_inner());
            let previous = status.state;
            status.state = next;
            if let Some(ref e) = error {
                status.last_error = Some(e.clone());
            }
            if next == ConnectionState::Disconnected {
                status.interface = None;
                status.server = None;
                status.connected_since = None;
                status.profile_id = None;
                status.retry_count = 0;
            }
            previous
        };
        self.inner.events.publish(previous, next, error);
    }

    fn set_retry_count(&self, count: u32) {
        self.inner.status.write().unwrap_or_else(|e| e.into_inner()).retry_count = count;
    }

    async fn cancelled(&self) {
        let mut rx = self.inner.cancel.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender lives as long as the orchestrator
        std::future::pending::<()>().await
    }

    async fn cancellable_sleep(&self, delay: std::time::Duration) -> Result<(), ()> {
        tokio::select! {
            _ = self.cancelled() => Err(()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn resolve_credentials_needed(auth: &AuthMode) -> bool {
        matches!(auth, AuthMode::Password { .. } | AuthMode::PresharedKey)
    }

    /// Profile validation and credential resolution for a connect or
    /// reconnect sequence; runs before the first Connecting transition
    async fn prepare_attempt(
        &self,
        profile: &ConnectionProfile,
    ) -> VpnResult<Option<CredentialHandle>> {
        let adapter = self
            .inner
            .registry
            .create(profile.protocol)
            .ok_or_else(|| {
                VpnError::InvalidProfile(format!("no adapter registered for {}", profile.protocol))
            })?;
        adapter.validate(profile).map_err(VpnError::InvalidProfile)?;

        if Self::resolve_credentials_needed(&profile.auth) {
            Ok(Some(self.inner.secrets.get_credential(&profile.id).await?))
        } else {
            Ok(None)
        }
    }

    /// One bounded, cancellable handshake attempt
    async fn attempt_once(
        &self,
        profile: &ConnectionProfile,
        credentials: Option<&CredentialHandle>,
    ) -> VpnResult<(Box<dyn ProtocolAdapter>, TunnelHandle)> {
        let mut adapter = self
            .inner
            .registry
            .create(profile.protocol)
            .ok_or_else(|| {
                VpnError::InvalidProfile(format!("no adapter registered for {}", profile.protocol))
            })?;

        let connect_timeout = self.inner.config.connect_timeout();
        let outcome = tokio::select! {
            _ = self.cancelled() => {
                info!("In-flight connect cancelled, discarding handshake");
                // Dropping the adapter releases any backend process it
                // spawned
                return Err(VpnError::Cancelled);
            }
            res = timeout(connect_timeout, adapter.connect(profile, credentials)) => res,
        };

        match outcome {
            Err(_) => Err(VpnError::Connect(ConnectError::Timeout { elapsed: connect_timeout })),
            Ok(Err(e)) => Err(VpnError::Connect(e)),
            Ok(Ok(handle)) => Ok((adapter, handle)),
        }
    }

    /// Narrow the guard, start metrics, store the session:
    /// the Connecting -> Connected edge.
    async fn promote(
        &self,
        slot: &mut Option<Session>,
        profile: &ConnectionProfile,
        mut adapter: Box<dyn ProtocolAdapter>,
        handle: TunnelHandle,
    ) -> VpnResult<()> {
        let narrow = self
            .inner
            .guard
            .narrow_to_tunnel(
                profile.kill_switch,
                &handle.interface,
                &profile.endpoints,
                &profile.dns,
            )
            .await;

        if let Err(e) = narrow {
            // Never treat the connection as safe without its guard
            error!("Failed to narrow guard to tunnel, aborting connect: {}", e);
            let _ = timeout(self.inner.config.disconnect_timeout(), adapter.disconnect()).await;
            self.settle_failure(profile).await;
            self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
            return Err(e.into());
        }

        let collector = MetricsCollector::start(
            handle.interface.clone(),
            handle.server.clone(),
            self.inner.config.health.clone(),
        );
        *self.inner.metrics_rx.write().unwrap_or_else(|e| e.into_inner()) = Some(collector.subscribe());

        let session_id = Uuid::new_v4();
        let monitor = tokio::spawn(monitor_loop(
            self.clone(),
            session_id,
            collector.subscribe(),
            self.inner.config.health.failure_threshold,
        ));

        {
            let mut status = self.inner.status.write().unwrap_or_else(|e| e.into_inner());
            status.profile_id = Some(profile.id.clone());
            status.interface = Some(handle.interface.clone());
            status.server = Some(handle.server.to_string());
            status.connected_since = Some(Utc::now());
            status.retry_count = 0;
            status.last_error = None;
        }

        *slot = Some(Session {
            id: session_id,
            profile: profile.clone(),
            adapter,
            tunnel: handle,
            collector,
            monitor,
        });

        self.set_state(ConnectionState::Connected, None);
        Ok(())
    }

    /// Guard disposition after a terminal failure: strict keeps (or
    /// re-tightens to) lockdown, anything else removes every rule.
    async fn settle_failure(&self, profile: &ConnectionProfile) {
        match profile.kill_switch {
            KillSwitchPolicy::Strict => {
                if let Err(e) = self
                    .inner
                    .guard
                    .lockdown(KillSwitchPolicy::Strict, &profile.endpoints)
                    .await
                {
                    error!("Failed to hold strict lockdown after failure: {}", e);
                }
            }
            KillSwitchPolicy::Permissive | KillSwitchPolicy::Off => {
                if let Err(e) = self.inner.guard.teardown().await {
                    warn!("Guard teardown after failure reported: {}", e);
                }
            }
        }
    }

    /// Cancel path for an in-flight connect: no tunnel ever existed, so
    /// tunnel-down is confirmed and the guard comes off for every policy.
    async fn settle_cancelled(&self) -> VpnResult<()> {
        self.set_state(ConnectionState::Disconnecting, None);
        if let Err(e) = self.inner.guard.teardown().await {
            warn!("Guard teardown after cancelled connect reported: {}", e);
        }
        *self.inner.metrics_rx.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(ConnectionState::Disconnected, None);
        Err(VpnError::Cancelled)
    }

    /// Full user-requested teardown of a live session
    async fn do_disconnect(&self, mut session: Session) {
        info!(
            "Disconnecting session {} ({} on {})",
            session.id, session.profile.name, session.tunnel.interface
        );
        self.set_state(ConnectionState::Disconnecting, None);

        session.monitor.abort();
        session.collector.stop();
        *self.inner.metrics_rx.write().unwrap_or_else(|e| e.into_inner()) = None;

        let adapter_confirmed_down = match timeout(
            self.inner.config.disconnect_timeout(),
            session.adapter.disconnect(),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Adapter disconnect reported: {}", e);
                false
            }
            Err(_) => {
                warn!("Adapter disconnect timed out, proceeding with teardown");
                false
            }
        };

        // Guard removal is unconditional once disconnect is requested,
        // except strict policy keeps lockdown until tunnel-down is
        // confirmed; release_guard() is the explicit override.
        if session.profile.kill_switch == KillSwitchPolicy::Strict && !adapter_confirmed_down {
            warn!("Strict kill switch: tunnel-down unconfirmed, keeping lockdown engaged");
            if let Err(e) = self
                .inner
                .guard
                .lockdown(KillSwitchPolicy::Strict, &session.profile.endpoints)
                .await
            {
                error!("Failed to hold strict lockdown on disconnect: {}", e);
            }
        } else if let Err(e) = self.inner.guard.teardown().await {
            warn!("Guard teardown on disconnect reported: {}", e);
        }

        self.set_state(ConnectionState::Disconnected, None);
        info!("Session {} disconnected", session.id);
    }

    /// Reconnect sequence after a detected tunnel drop: the guard stays
    /// locked down throughout, never back to pre-VPN connectivity.
    ///
    /// Boxed: this path awaits `promote`, which spawns the monitor task
    /// that awaits this future, so the future type must be nameable.
    fn handle_tunnel_drop(
        &self,
        session_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.handle_tunnel_drop_inner(session_id))
    }

    async fn handle_tunnel_drop_inner(&self, session_id: Uuid) {
        let mut slot = self.inner.session.lock().await;
        let session = match slot.take() {
            Some(session) if session.id == session_id => session,
            other => {
                // Stale monitor; a newer sequence owns the session
                *slot = other;
                return;
            }
        };

        let profile = session.profile.clone();
        warn!("Tunnel drop detected for {}, entering reconnect", profile.name);
        self.set_state(ConnectionState::Reconnecting, Some("tunnel drop detected".to_string()));

        // This body runs inside the monitor task itself, so the old
        // monitor handle is just dropped; monitor_loop returns when this
        // function does.
        let mut session = session;
        session.collector.stop();
        *self.inner.metrics_rx.write().unwrap_or_else(|e| e.into_inner()) = None;
        let _ = timeout(self.inner.config.disconnect_timeout(), session.adapter.disconnect()).await;
        drop(session);

        // Re-tighten from narrowed to lockdown before any retry
        if let Err(e) = self
            .inner
            .guard
            .lockdown(profile.kill_switch, &profile.endpoints)
            .await
        {
            error!("Failed to re-lockdown for reconnect, aborting: {}", e);
            self.settle_failure(&profile).await;
            self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
            return;
        }

        let credentials = match self.prepare_attempt(&profile).await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("Reconnect preparation failed: {}", e);
                self.settle_failure(&profile).await;
                self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                return;
            }
        };

        let mut schedule = BackoffSchedule::new(&self.inner.config.retry);
        loop {
            let delay = match schedule.next_delay() {
                Some(delay) => delay,
                None => {
                    let attempts = schedule.attempts();
                    let err = VpnError::MaxRetriesExceeded { attempts };
                    error!("Reconnect gave up: {}", err);
                    self.settle_failure(&profile).await;
                    self.set_state(ConnectionState::Disconnected, Some(err.to_string()));
                    return;
                }
            };

            self.set_retry_count(schedule.attempts());
            debug!("Reconnect attempt {} in {:?}", schedule.attempts(), delay);
            if self.cancellable_sleep(delay).await.is_err() {
                let _ = self.settle_cancelled().await;
                return;
            }

            self.set_state(ConnectionState::Connecting, None);
            match self.attempt_once(&profile, credentials.as_ref()).await {
                Ok((adapter, handle)) => {
                    if self.promote(&mut slot, &profile, adapter, handle).await.is_ok() {
                        info!("Reconnected {} after {} attempts", profile.name, schedule.attempts());
                    }
                    return;
                }
                Err(VpnError::Cancelled) => {
                    let _ = self.settle_cancelled().await;
                    return;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Reconnect attempt failed: {}", e);
                    self.set_state(ConnectionState::Reconnecting, Some(e.to_string()));
                }
                Err(e) => {
                    error!("Reconnect failed terminally: {}", e);
                    self.settle_failure(&profile).await;
                    self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// Watches the metrics slot (and the adapter's own link report) for the
/// reconnect trigger: N consecutive failed probes or adapter-reported
/// link loss.
async fn monitor_loop(
    orchestrator: Orchestrator,
    session_id: Uuid,
    mut snapshots: watch::Receiver<Option<MetricsSnapshot>>,
    failure_threshold: u32,
) {
    loop {
        if snapshots.changed().await.is_err() {
            // Collector stopped; the session is being torn down elsewhere
            return;
        }

        let probe_failures = snapshots
            .borrow()
            .as_ref()
            .map(|s| s.consecutive_probe_failures)
            .unwrap_or(0);

        let adapter_down = {
            // try_lock only: never stall behind an in-flight transition
            match orchestrator.inner.session.try_lock() {
                Ok(slot) => match slot.as_ref() {
                    Some(session) if session.id == session_id => {
                        session.adapter.link_health().await == LinkHealth::Down
                    }
                    _ => return,
                },
                Err(_) => false,
            }
        };

        if probe_failures >= failure_threshold || adapter_down {
            warn!(
                "Reconnect trigger: {} consecutive probe failures, adapter_down={}",
                probe_failures, adapter_down
            );
            orchestrator.handle_tunnel_drop(session_id).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_status_is_disconnected() {
        let status = SessionStatus::idle();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.metrics.is_none());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn credentials_needed_per_auth_mode() {
        assert!(Orchestrator::resolve_credentials_needed(&AuthMode::Password {
            username: "a".into()
        }));
        assert!(Orchestrator::resolve_credentials_needed(&AuthMode::PresharedKey));
        assert!(!Orchestrator::resolve_credentials_needed(&AuthMode::Certificate {
            ca_cert: "ca".into(),
            client_cert: "cert".into(),
            client_key: "key".into(),
        }));
    }
}
