//! Platform firewall backends
//!
//! The only code that turns guard directives into real firewall state.
//! One implementation per OS, selected by build target; the guard itself
//! never branches on platform. `apply` always replaces this process's
//! entire rule footprint, which keeps retries and phase changes from
//! accumulating partial state.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::rules::{GuardRule, GuardRuleSet};
use super::GuardError;

/// Installs and removes this process's firewall rules
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Replace the installed rule footprint with `rules`
    async fn apply(&self, rules: &GuardRuleSet) -> Result<(), GuardError>;

    /// Remove every rule this process installed
    async fn clear(&self) -> Result<(), GuardError>;
}

/// Default backend for the build target
pub fn default_backend() -> Box<dyn FirewallBackend> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::NftablesBackend::new())
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::PfctlBackend::new())
    }
    #[cfg(target_os = "windows")]
    {
        Box::new(windows::NetshBackend::new())
    }
}

/// Privileged firewall mutation needs root on unix
#[cfg(unix)]
pub fn check_privileges() -> Result<(), GuardError> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(GuardError::PermissionDenied(format!(
            "firewall mutation requires root (euid {})",
            euid
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_privileges() -> Result<(), GuardError> {
    // Windows elevation is surfaced by netsh itself
    Ok(())
}

async fn run_privileged(program: &str, args: &[&str]) -> Result<(), GuardError> {
    debug!("Running: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| GuardError::RuleInstall(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(GuardError::RuleInstall(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::*;

    const TABLE: &str = "vpncore";

    /// nftables backend: all rules live in one owned inet table so clear
    /// is a single `delete table`
    pub struct NftablesBackend;

    impl NftablesBackend {
        pub fn new() -> Self {
            Self
        }

        fn render(rules: &GuardRuleSet) -> String {
            let mut script = String::new();
            script.push_str(&format!("add table inet {}\n", TABLE));
            script.push_str(&format!(
                "add chain inet {} output {{ type filter hook output priority 0; policy accept; }}\n",
                TABLE
            ));

            for rule in &rules.rules {
                match rule {
                    GuardRule::AllowLoopback => {
                        script.push_str(&format!("add rule inet {} output oif lo accept\n", TABLE));
                    }
                    GuardRule::AllowEndpoint { host, port } => {
                        script.push_str(&format!(
                            "add rule inet {} output ip daddr {} th dport {} accept\n",
                            TABLE, host, port
                        ));
                    }
                    GuardRule::AllowInterface { interface } => {
                        script.push_str(&format!(
                            "add rule inet {} output oifname \"{}\" accept\n",
                            TABLE, interface
                        ));
                    }
                    GuardRule::RedirectDns { servers } => {
                        for server in servers {
                            script.push_str(&format!(
                                "add rule inet {} output ip daddr {} udp dport 53 accept\n",
                                TABLE, server
                            ));
                        }
                        script.push_str(&format!(
                            "add rule inet {} output udp dport 53 drop\n",
                            TABLE
                        ));
                        script.push_str(&format!(
                            "add rule inet {} output tcp dport 53 drop\n",
                            TABLE
                        ));
                    }
                    GuardRule::DenyAllEgress => {
                        script.push_str(&format!("add rule inet {} output drop\n", TABLE));
                    }
                }
            }
            script
        }
    }

    #[async_trait]
    impl FirewallBackend for NftablesBackend {
        async fn apply(&self, rules: &GuardRuleSet) -> Result<(), GuardError> {
            check_privileges()?;

            // Replace, never append: drop our table first, then rebuild
            let _ = run_privileged("nft", &["delete", "table", "inet", TABLE]).await;

            if rules.is_empty() {
                return Ok(());
            }

            let script = Self::render(rules);
            let script_path = std::env::temp_dir().join(format!("vpncore-{}.nft", std::process::id()));
            tokio::fs::write(&script_path, &script)
                .await
                .map_err(|e| GuardError::RuleInstall(format!("failed to write nft script: {}", e)))?;

            let result = run_privileged("nft", &["-f", &script_path.to_string_lossy()]).await;
            let _ = tokio::fs::remove_file(&script_path).await;
            result?;

            info!("Installed {} nftables rules ({:?})", rules.rules.len(), rules.phase);
            Ok(())
        }

        async fn clear(&self) -> Result<(), GuardError> {
            check_privileges()?;

            // Absent table is a clean state, not an error
            let output = Command::new("nft")
                .args(["delete", "table", "inet", TABLE])
                .output()
                .await
                .map_err(|e| GuardError::RuleRemove(format!("failed to run nft: {}", e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such file or directory") {
                    return Err(GuardError::RuleRemove(format!(
                        "nft delete table failed: {}",
                        stderr.trim()
                    )));
                }
            }

            info!("Removed nftables rule table");
            Ok(())
        }
    }
}

#[cfg(target_os = "macos")]
pub mod macos {
    use super::*;

    const ANCHOR: &str = "com.vpncore";

    /// pf backend: rules load into an owned anchor, cleared by flushing it
    pub struct PfctlBackend;

    impl PfctlBackend {
        pub fn new() -> Self {
            Self
        }

        fn render(rules: &GuardRuleSet) -> String {
            let mut conf = String::new();
            for rule in &rules.rules {
                match rule {
                    GuardRule::AllowLoopback => {
                        conf.push_str("pass out quick on lo0 all\n");
                    }
                    GuardRule::AllowEndpoint { host, port } => {
                        conf.push_str(&format!("pass out quick to {} port {}\n", host, port));
                    }
                    GuardRule::AllowInterface { interface } => {
                        conf.push_str(&format!("pass out quick on {} all\n", interface));
                    }
                    GuardRule::RedirectDns { servers } => {
                        for server in servers {
                            conf.push_str(&format!("pass out quick to {} port 53\n", server));
                        }
                        conf.push_str("block out quick proto {tcp, udp} to any port 53\n");
                    }
                    GuardRule::DenyAllEgress => {
                        conf.push_str("block out all\n");
                    }
                }
            }
            conf
        }
    }

    #[async_trait]
    impl FirewallBackend for PfctlBackend {
        async fn apply(&self, rules: &GuardRuleSet) -> Result<(), GuardError> {
            check_privileges()?;
            run_privileged("pfctl", &["-a", ANCHOR, "-F", "rules"]).await?;

            if rules.is_empty() {
                return Ok(());
            }

            let conf = Self::render(rules);
            let conf_path = std::env::temp_dir().join(format!("vpncore-{}.pf", std::process::id()));
            tokio::fs::write(&conf_path, &conf)
                .await
                .map_err(|e| GuardError::RuleInstall(format!("failed to write pf config: {}", e)))?;

            let result = run_privileged(
                "pfctl",
                &["-a", ANCHOR, "-f", &conf_path.to_string_lossy()],
            )
            .await;
            let _ = tokio::fs::remove_file(&conf_path).await;
            result?;
            run_privileged("pfctl", &["-e"]).await.ok();

            info!("Installed pf anchor rules ({:?})", rules.phase);
            Ok(())
        }

        async fn clear(&self) -> Result<(), GuardError> {
            check_privileges()?;
            run_privileged("pfctl", &["-a", ANCHOR, "-F", "rules"])
                .await
                .map_err(|e| GuardError::RuleRemove(e.to_string()))?;
            info!("Flushed pf anchor");
            Ok(())
        }
    }
}

#[cfg(target_os = "windows")]
pub mod windows {
    use super::*;

    const RULE_PREFIX: &str = "vpncore";

    /// Windows Firewall backend via netsh advfirewall; every rule carries
    /// an owned name prefix so clear can delete by name
    pub struct NetshBackend;

    impl NetshBackend {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl FirewallBackend for NetshBackend {
        async fn apply(&self, rules: &GuardRuleSet) -> Result<(), GuardError> {
            self.clear().await?;

            if rules.is_empty() {
                return Ok(());
            }

            for (index, rule) in rules.rules.iter().enumerate() {
                let name = format!("{}-{}", RULE_PREFIX, index);
                match rule {
                    GuardRule::AllowLoopback => {
                        // Loopback bypasses the Windows Firewall egress path
                    }
                    GuardRule::AllowEndpoint { host, port } => {
                        run_privileged(
                            "netsh",
                            &[
                                "advfirewall", "firewall", "add", "rule",
                                &format!("name={}", name),
                                "dir=out", "action=allow",
                                &format!("remoteip={}", host),
                                &format!("remoteport={}", port),
                                "protocol=any",
                            ],
                        )
                        .await?;
                    }
                    GuardRule::AllowInterface { interface } => {
                        // netsh cannot scope by interface name directly;
                        // WFP rules are keyed to the tunnel's local subnet
                        run_privileged(
                            "netsh",
                            &[
                                "advfirewall", "firewall", "add", "rule",
                                &format!("name={}", name),
                                "dir=out", "action=allow",
                                &format!("localip={}", interface),
                                "protocol=any",
                            ],
                        )
                        .await?;
                    }
                    GuardRule::RedirectDns { servers } => {
                        for server in servers {
                            run_privileged(
                                "netsh",
                                &[
                                    "advfirewall", "firewall", "add", "rule",
                                    &format!("name={}", name),
                                    "dir=out", "action=allow",
                                    &format!("remoteip={}", server),
                                    "remoteport=53", "protocol=udp",
                                ],
                            )
                            .await?;
                        }
                    }
                    GuardRule::DenyAllEgress => {
                        run_privileged(
                            "netsh",
                            &[
                                "advfirewall", "firewall", "add", "rule",
                                &format!("name={}", name),
                                "dir=out", "action=block",
                                "remoteip=any", "protocol=any",
                            ],
                        )
                        .await?;
                    }
                }
            }

            info!("Installed Windows Firewall rules ({:?})", rules.phase);
            Ok(())
        }

        async fn clear(&self) -> Result<(), GuardError> {
            // Delete-by-name fails when nothing matches; that is clean state
            for index in 0..32 {
                let name = format!("name={}-{}", RULE_PREFIX, index);
                let _ = Command::new("netsh")
                    .args(["advfirewall", "firewall", "delete", "rule", &name])
                    .output()
                    .await;
            }
            info!("Removed Windows Firewall rules");
            Ok(())
        }
    }
}
