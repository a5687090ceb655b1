//! OpenVPN adapter shim
//!
//! Drives the system `openvpn` client binary. The shim renders a client
//! config from the profile, hands credentials over via a mode-0600 auth
//! file that is deleted as soon as the handshake settles, and treats the
//! tunnel interface coming up as the readiness signal.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::common;
use super::contract::{ConnectError, LinkHealth, ProtocolAdapter, TunnelHandle};
use crate::profile::{AuthMode, ConnectionProfile, Protocol};
use crate::secrets::CredentialHandle;

const TUNNEL_INTERFACE: &str = "tun0";

pub struct OpenVpnAdapter {
    process: Option<Child>,
    pid: Option<u32>,
    interface: Option<String>,
    config_path: Option<PathBuf>,
}

impl OpenVpnAdapter {
    pub fn new() -> Self {
        Self {
            process: None,
            pid: None,
            interface: None,
            config_path: None,
        }
    }

    fn build_config_content(&self, profile: &ConnectionProfile) -> Result<String, ConnectError> {
        let endpoint = profile.primary_endpoint().ok_or_else(|| {
            ConnectError::ProtocolNegotiationFailed {
                detail: "profile has no server endpoint".to_string(),
            }
        })?;

        let mut cfg = String::new();
        cfg.push_str("client\n");
        cfg.push_str(&format!("remote {} {}\n", endpoint.host, endpoint.port));
        cfg.push_str("proto udp\n");
        cfg.push_str(&format!("dev {}\n", TUNNEL_INTERFACE));

        if let AuthMode::Certificate { ca_cert, client_cert, client_key } = &profile.auth {
            cfg.push_str(&format!("ca {}\n", ca_cert));
            cfg.push_str(&format!("cert {}\n", client_cert));
            cfg.push_str(&format!("key {}\n", client_key));
        }

        cfg.push_str("resolv-retry infinite\n");
        cfg.push_str("nobind\n");
        cfg.push_str("persist-key\n");
        cfg.push_str("persist-tun\n");
        cfg.push_str("cipher AES-256-GCM\n");
        cfg.push_str("auth SHA256\n");
        cfg.push_str("verb 3\n");

        Ok(cfg)
    }

    async fn cleanup_files(&mut self) {
        if let Some(path) = self.config_path.take() {
            common::remove_transient_file(&path).await;
        }
    }
}

impl Default for OpenVpnAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolAdapter for OpenVpnAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::OpenVpn
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available("openvpn").await
    }

    async fn version(&self) -> Option<String> {
        common::get_binary_version("openvpn").await
    }

    fn validate(&self, profile: &ConnectionProfile) -> Result<(), String> {
        if profile.primary_endpoint().is_none() {
            return Err("no server endpoint configured".to_string());
        }

        if let AuthMode::Certificate { ca_cert, client_cert, client_key } = &profile.auth {
            for path in [ca_cert, client_cert, client_key] {
                if !std::path::Path::new(path).exists() {
                    return Err(format!("certificate file not found: {}", path));
                }
            }
        }

        if matches!(profile.auth, AuthMode::PresharedKey) {
            return Err("OpenVPN does not support pre-shared key auth".to_string());
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

        info!("Connecting OpenVPN: {} ({})", profile.name, endpoint);

        let run_id = uuid::Uuid::new_v4();
        let config_path = std::env::temp_dir().join(format!("ovpn-{}.conf", run_id));
        let auth_path = std::env::temp_dir().join(format!("ovpn-{}.auth", run_id));

        let config_content = self.build_config_content(profile)?;
        common::write_secure_file(&config_path, &config_content)
            .await
            .map_err(|e| common::map_spawn_error("openvpn", e))?;
        self.config_path = Some(config_path.clone());

        let mut cmd = Command::new("openvpn");
        cmd.arg("--config").arg(&config_path);

        // Username/password travels through an owner-only auth file, never
        // the command line
        let mut auth_written = false;
        if let (AuthMode::Password { username }, Some(handle)) = (&profile.auth, credentials) {
            let auth_content = format!("{}\n{}\n", username, handle.reveal());
            common::write_secure_file(&auth_path, &auth_content)
                .await
                .map_err(|e| common::map_spawn_error("openvpn", e))?;
            cmd.arg("--auth-user-pass").arg(&auth_path);
            auth_written = true;
        }

        let spawn_result = cmd
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.cleanup_files().await;
                if auth_written {
                    common::remove_transient_file(&auth_path).await;
                }
                return Err(common::map_spawn_error("openvpn", e));
            }
        };

        let pid = child.id();
        debug!("OpenVPN process started (pid: {:?})", pid);

        // Interface-up is the success signal; an early process exit is a
        // failure whose output decides the error variant
        let wait_result = tokio::select! {
            res = common::wait_for_interface(TUNNEL_INTERFACE, Duration::from_secs(55)) => res,
            status = child.wait() => {
                let output = match status {
                    Ok(s) => format!("openvpn exited early: {}", s),
                    Err(e) => format!("openvpn wait failed: {}", e),
                };
                Err(common::classify_backend_output("openvpn", &output))
            }
        };

        // The auth file has served its purpose once the handshake settles,
        // successfully or not
        if auth_written {
            common::remove_transient_file(&auth_path).await;
        }

        match wait_result {
            Ok(()) => {
                self.process = Some(child);
                self.pid = pid;
                self.interface = Some(TUNNEL_INTERFACE.to_string());
                info!(
                    "OpenVPN connected: {} (pid: {:?}, interface: {})",
                    profile.name, pid, TUNNEL_INTERFACE
                );
                Ok(TunnelHandle {
                    interface: TUNNEL_INTERFACE.to_string(),
                    server: endpoint,
                })
            }
            Err(e) => {
                common::stop_child("openvpn", &mut child).await;
                self.cleanup_files().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), ConnectError> {
        if let Some(mut process) = self.process.take() {
            info!("Disconnecting OpenVPN");
            common::stop_child("openvpn", &mut process).await;
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

impl Drop for OpenVpnAdapter {
    fn drop(&mut self) {
        if let Some(ref mut process) = self.process {
            if let Err(e) = process.start_kill() {
                warn!("Failed to kill OpenVPN process on drop: {}", e);
            }
        }
    }
}

pub fn create_adapter() -> Box<dyn ProtocolAdapter> {
    Box::new(OpenVpnAdapter::new())
}
