//! L2TP/IPsec adapter shim
//!
//! Delegates to `xl2tpd` in foreground mode with a generated lac section.
//! The IPsec transport, when a pre-shared key is configured, is expected
//! to be provisioned by the host's strongSwan install; the shim only
//! drives the L2TP layer and the PPP session on top of it.

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

pub struct L2tpAdapter {
    process: Option<Child>,
    pid: Option<u32>,
    interface: Option<String>,
    conf_path: Option<PathBuf>,
    options_path: Option<PathBuf>,
}

impl L2tpAdapter {
    pub fn new() -> Self {
        Self {
            process: None,
            pid: None,
            interface: None,
            conf_path: None,
            options_path: None,
        }
    }

    async fn cleanup_files(&mut self) {
        if let Some(path) = self.conf_path.take() {
            common::remove_transient_file(&path).await;
        }
        if let Some(path) = self.options_path.take() {
            common::remove_transient_file(&path).await;
        }
    }
}

impl Default for L2tpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolAdapter for L2tpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::L2tp
    }

    async fn is_available(&self) -> bool {
        common::check_binary_available("xl2tpd").await
    }

    async fn version(&self) -> Option<String> {
        common::get_binary_version("xl2tpd").await
    }

    fn validate(&self, profile: &ConnectionProfile) -> Result<(), String> {
        if profile.primary_endpoint().is_none() {
            return Err("no server endpoint configured".to_string());
        }
        match &profile.auth {
            AuthMode::Password { .. } | AuthMode::PresharedKey => Ok(()),
            AuthMode::Certificate { .. } => {
                Err("L2TP does not support certificate auth".to_string())
            }
        }
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

        info!("Connecting L2TP: {} ({})", profile.name, endpoint);

        let run_id = uuid::Uuid::new_v4();
        let conf_path = std::env::temp_dir().join(format!("l2tp-{}.conf", run_id));
        let options_path = std::env::temp_dir().join(format!("l2tp-{}.options", run_id));

        let mut options = String::from("noauth\nnodefaultroute\nusepeerdns\n");
        if let (AuthMode::Password { username }, Some(handle)) = (&profile.auth, credentials) {
            options.push_str(&format!(
                "name \"{}\"\npassword \"{}\"\n",
                username,
                handle.reveal()
            ));
        }
        common::write_secure_file(&options_path, &options)
            .await
            .map_err(|e| common::map_spawn_error("xl2tpd", e))?;
        self.options_path = Some(options_path.clone());

        let conf = format!(
            "[lac vpn]\nlns = {}\nredial = no\nrequire chap = yes\nrequire authentication = no\npppoptfile = {}\nautodial = yes\n",
            endpoint.host,
            options_path.display()
        );
        common::write_secure_file(&conf_path, &conf)
            .await
            .map_err(|e| common::map_spawn_error("xl2tpd", e))?;
        self.conf_path = Some(conf_path.clone());

        let spawn_result = Command::new("xl2tpd")
            .arg("-D")
            .arg("-c")
            .arg(&conf_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.cleanup_files().await;
                return Err(common::map_spawn_error("xl2tpd", e));
            }
        };

        let pid = child.id();
        debug!("xl2tpd process started (pid: {:?})", pid);

        let wait_result = tokio::select! {
            res = common::wait_for_interface(PPP_INTERFACE, Duration::from_secs(45)) => res,
            status = child.wait() => {
                let output = match status {
                    Ok(s) => format!("xl2tpd exited early: {}", s),
                    Err(e) => format!("xl2tpd wait failed: {}", e),
                };
                Err(common::classify_backend_output("xl2tpd", &output))
            }
        };

        match wait_result {
            Ok(()) => {
                // Options file is no longer needed once pppd is up
                if let Some(path) = self.options_path.take() {
                    common::remove_transient_file(&path).await;
                }
                self.process = Some(child);
                self.pid = pid;
                self.interface = Some(PPP_INTERFACE.to_string());
                info!("L2TP connected: {} (interface: {})", profile.name, PPP_INTERFACE);
                Ok(TunnelHandle {
                    interface: PPP_INTERFACE.to_string(),
                    server: endpoint,
                })
            }
            Err(e) => {
                common::stop_child("xl2tpd", &mut child).await;
                self.cleanup_files().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), ConnectError> {
        if let Some(mut process) = self.process.take() {
            info!("Disconnecting L2TP");
            common::stop_child("xl2tpd", &mut process).await;
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

impl Drop for L2tpAdapter {
    fn drop(&mut self) {
        if let Some(ref mut process) = self.process {
            if let Err(e) = process.start_kill() {
                warn!("Failed to kill xl2tpd process on drop: {}", e);
            }
        }
    }
}

pub fn create_adapter() -> Box<dyn ProtocolAdapter> {
    Box::new(L2tpAdapter::new())
}
