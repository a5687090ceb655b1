//! Shared helpers for the protocol adapter shims

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use super::contract::ConnectError;

/// Check if a backend binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    match Command::new("which").arg(binary).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Get the version of a backend binary by running it with --version
pub async fn get_binary_version(binary: &str) -> Option<String> {
    let output = Command::new(binary).arg("--version").output().await.ok()?;
    let version_output = String::from_utf8_lossy(&output.stdout);
    version_output.lines().next().map(|line| line.to_string())
}

/// Write an auth or config file readable only by the owner. Credential
/// files must never be group or world readable.
pub async fn write_secure_file(path: &Path, content: &str) -> std::io::Result<()> {
    tokio::fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    debug!("Wrote secure file: {:?}", path);
    Ok(())
}

/// Remove a transient file, logging rather than failing on error
pub async fn remove_transient_file(path: &Path) {
    if path.exists() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove transient file {:?}: {}", path, e);
        }
    }
}

/// Check if a network interface exists
pub fn interface_exists(interface: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", interface)).exists()
}

/// Interface byte counters from /sys/class/net (rx, tx)
pub async fn get_interface_stats(interface: &str) -> Option<(u64, u64)> {
    let base = format!("/sys/class/net/{}/statistics", interface);

    let rx = tokio::fs::read_to_string(format!("{}/rx_bytes", base))
        .await
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    let tx = tokio::fs::read_to_string(format!("{}/tx_bytes", base))
        .await
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;

    Some((rx, tx))
}

/// Poll until the tunnel interface appears or the deadline passes.
/// Backends bring their interface up asynchronously after the process
/// starts; this is the only reliable readiness signal common to all four.
pub async fn wait_for_interface(interface: &str, deadline: Duration) -> Result<(), ConnectError> {
    let start = Instant::now();
    loop {
        if interface_exists(interface) {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(ConnectError::Timeout { elapsed: start.elapsed() });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Translate backend process output into the connect-error taxonomy.
/// Matches the failure markers the OpenVPN CLI and pppd family print;
/// anything unrecognized becomes a negotiation failure carrying the raw
/// detail for diagnostics.
pub fn classify_backend_output(backend: &str, output: &str) -> ConnectError {
    let lower = output.to_lowercase();

    if lower.contains("auth_failed")
        || lower.contains("authentication failed")
        || lower.contains("chap authentication failed")
        || lower.contains("mschap")
    {
        ConnectError::AuthRejected
    } else if lower.contains("network is unreachable")
        || lower.contains("no route to host")
        || lower.contains("connection refused")
        || lower.contains("cannot resolve")
        || lower.contains("name resolution")
    {
        ConnectError::Unreachable {
            endpoint: backend.to_string(),
        }
    } else {
        ConnectError::ProtocolNegotiationFailed {
            detail: format!(
                "{}: {}",
                backend,
                output.lines().last().unwrap_or("no output").trim()
            ),
        }
    }
}

/// Map a process spawn failure. ENOENT means the backend is not installed.
pub fn map_spawn_error(backend: &str, err: std::io::Error) -> ConnectError {
    ConnectError::BackendUnavailable {
        backend: backend.to_string(),
        source: Some(err),
    }
}

/// Terminate a backend child process, escalating from SIGTERM semantics
/// (kill) to a bounded wait. Used by every shim's disconnect path.
pub async fn stop_child(backend: &str, child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill {} process: {}", backend, e);
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => debug!("{} exited with status: {}", backend, status),
        Ok(Err(e)) => warn!("Error waiting for {} process: {}", backend, e),
        Err(_) => warn!("Timeout waiting for {} process to exit", backend),
    }
}
