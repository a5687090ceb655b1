//! SSTP adapter shim
//!
//! Delegates to the `sstpc` client, which wraps the SSL handshake and
//! hands the PPP stream to pppd. Credentials are passed through a pppd
//! options file, never on the command line.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::common;
use super::contract::{ConnectError, LinkHealth, ProtocolAdapter, TunnelHandle};
use crate::profile::{AuthMode, ConnectionProfile, Protocol};
use crate::secrets::CredentialHandle;

const PPP_INTERFACE: &str = "ppp0";

pub struct SstpAdapter {
    process: Option<Child>,
    pid: Option<u32>,
    interface: Option<String>,
    options_path: Option<PathBuf>,
}

impl SstpAdapter {
    pub fn new() -> Self {
        Self {
            process: None,
            pid: None,
            interface: None,
            options_path: None,
        }
    }

    async fn cleanup_files(&mut self) {
        if let Some(path) = self.options_path.take() {
            common::remove_transient_file(&path).await;
        }
    }
}

impl Default for SstpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolAdapter for SstpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Sstp
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available("sstpc").await
    }

    async fn version(&self) -> Option<String> {
        common::get_binary_version("sstpc").await
    }

    fn validate(&self, profile: &ConnectionProfile) -> Result<(), String> {
        if profile.primary_endpoint().is_none() {
            return Err("no server endpoint configured".to_string());
        }
        if !matches!(profile.auth, AuthMode::Password { .. }) {
            return Err("SSTP requires username/password auth".to_string());
        }
        Ok(())
    }

    async fn connect(
        &mut self,
        profile: &ConnectionProfile,
        credentials: Option<&CredentialHandle>,
    ) -> Result<TunnelHandle, ConnectError> {
        let endpoint = profile.primary_endpoint().cloned().ok_or_else(|| {
            ConnectError::ProtocolNegotiationFailed {
                detail: "profile has no server endpoint".to_string(),
            }
        })?;

        let (username, handle) = match (&profile.auth, credentials) {
            (AuthMode::Password { username }, Some(handle)) => (username.clone(), handle),
            _ => {
                return Err(ConnectError::AuthRejected);
            }
        };

        info!("Connecting SSTP: {} ({})", profile.name, endpoint);

        let options_path =
            std::env::temp_dir().join(format!("sstp-{}.options", uuid::Uuid::new_v4()));
        let options = format!(
            "user \"{}\"\npassword \"{}\"\nnoauth\nnodefaultroute\nusepeerdns\n",
            username,
            handle.reveal()
        );
        common::write_secure_file(&options_path, &options)
            .await
            .map_err(|e| common::map_spawn_error("sstpc", e))?;
        self.options_path = Some(options_path.clone());

        let spawn_result = Command::new("sstpc")
            .arg("--log-stderr")
            .arg("--cert-warn")
            .arg(format!("{}:{}", endpoint.host, endpoint.port))
            .arg("file")
            .arg(&options_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.cleanup_files().await;
                return Err(common::map_spawn_error("sstpc", e));
            }
        };

        let pid = child.id();
        debug!("sstpc process started (pid: {:?})", pid);

        let wait_result = tokio::select! {
            res = common::wait_for_interface(PPP_INTERFACE, Duration::from_secs(45)) => res,
            status = child.wait() => {
                let output = match status {
                    Ok(s) => format!("sstpc exited early: {}", s),
                    Err(e) => format!("sstpc wait failed: {}", e),
                };
                Err(common::classify_backend_output("sstpc", &output))
            }
        };

        // pppd has read the options file once negotiation starts
        self.cleanup_files().await;

        match wait_result {
            Ok(()) => {
                self.process = Some(child);
                self.pid = pid;
                self.interface = Some(PPP_INTERFACE.to_string());
                info!("SSTP connected: {} (interface: {})", profile.name, PPP_INTERFACE);
                Ok(TunnelHandle {
                    interface: PPP_INTERFACE.to_string(),
                    server: endpoint,
                })
            }
            Err(e) => {
                common::stop_child("sstpc", &mut child).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), ConnectError> {
        if let Some(mut process) = self.process.take() {
            info!("Disconnecting SSTP");
            common::stop_child("sstpc", &mut process).await;
        }

        self.cleanup_files().await;
        self.pid = None;
        self.interface = None;
        Ok(())
    }

    async fn link_health(&self) -> LinkHealth {
        let pid_alive = self
            .pid
            .map(|pid| std::path::Path::new(&format!("/proc/{}", pid)).exists())
            .unwrap_or(false);

        if !pid_alive {
            return LinkHealth::Down;
        }

        match &self.interface {
            Some(interface) if common::interface_exists(interface) => LinkHealth::Healthy,
            _ => LinkHealth::Degraded,
        }
    }

    fn interface_name(&self) -> Option<String> {
        self.interface.clone()
    }
}

impl Drop for SstpAdapter {
    fn drop(&mut self) {
        if let Some(ref mut process) = self.process {
            if let Err(e) = process.start_kill() {
                warn!("Failed to kill sstpc process on drop: {}", e);
            }
        }
    }
}

pub fn create_adapter() -> Box<dyn ProtocolAdapter> {
    Box::new(SstpAdapter::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DnsPolicy, KillSwitchPolicy, ServerEndpoint};

    fn profile(auth: AuthMode) -> ConnectionProfile {
        ConnectionProfile {
            id: "p1".to_string(),
            name: "P1".to_string(),
            protocol: Protocol::Sstp,
            endpoints: vec![ServerEndpoint::new("vpn.example.com", 443)],
            auth,
            dns: DnsPolicy::Tunnel,
            kill_switch: KillSwitchPolicy::Strict,
        }
    }

    #[test]
    fn validate_requires_password_auth() {
        let adapter = SstpAdapter::new();
        assert!(adapter
            .validate(&profile(AuthMode::Password { username: "a".into() }))
            .is_ok());
        assert!(adapter.validate(&profile(AuthMode::PresharedKey)).is_err());
    }

    #[tokio::test]
    async fn fresh_adapter_reports_down() {
        let adapter = SstpAdapter::new();
        assert_eq!(adapter.link_health().await, LinkHealth::Down);
    }
}
