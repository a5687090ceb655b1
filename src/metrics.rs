//! Tunnel health and performance sampling
//!
//! While a tunnel is up, the collector probes the server on a fixed
//! interval (TCP round-trip to the handshake port) and reads the tunnel
//! interface's byte counters. Each cycle produces a `MetricsSnapshot`
//! published into a single-writer watch slot; new samples supersede old
//! ones, they are never merged. The consecutive-failure counter is the
//! orchestrator's reconnect trigger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::common::get_interface_stats;
use crate::config::HealthSettings;
use crate::profile::ServerEndpoint;

const PROBES_PER_CYCLE: usize = 3;

/// Latency statistics over one probe cycle
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub jitter_ms: f64,
}

/// One health sample; superseded wholesale by the next cycle
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sampled_at: DateTime<Utc>,
    /// None when every probe in the cycle failed
    pub latency: Option<LatencyStats>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub download_bps: f64,
    pub upload_bps: f64,
    pub consecutive_probe_failures: u32,
}

/// Periodic sampler for an active tunnel
pub struct MetricsCollector {
    snapshot_rx: watch::Receiver<Option<MetricsSnapshot>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsCollector {
    /// Start sampling `interface` and probing `target` until stopped
    pub fn start(interface: String, target: ServerEndpoint, settings: HealthSettings) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sample_loop(
            interface,
            target,
            settings,
            snapshot_tx,
            shutdown_rx,
        ));

        Self {
            snapshot_rx,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Receiver for snapshot updates (reconnect monitor)
    pub fn subscribe(&self) -> watch::Receiver<Option<MetricsSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Latest sample without blocking
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Stop sampling. Immediate and idempotent.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Metrics collector stopped");
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sample_loop(
    interface: String,
    target: ServerEndpoint,
    settings: HealthSettings,
    snapshot_tx: watch::Sender<Option<MetricsSnapshot>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let probe_timeout = Duration::from_secs(settings.probe_timeout_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(settings.probe_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut failures: u32 = 0;
    let mut previous_counters: Option<(u64, u64, Instant)> = None;

    info!("Metrics collector started for {} via {}", target, interface);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {}
        }

        let latency = probe_latency(&target, probe_timeout).await;
        if latency.is_none() {
            failures += 1;
            warn!(
                "Health probe to {} failed ({} consecutive)",
                target, failures
            );
        } else {
            failures = 0;
        }

        let (rx_bytes, tx_bytes) = get_interface_stats(&interface).await.unwrap_or((0, 0));
        let now = Instant::now();
        let (download_bps, upload_bps) = match previous_counters {
            Some((prev_rx, prev_tx, at)) => {
                let secs = now.duration_since(at).as_secs_f64().max(0.001);
                (
                    (rx_bytes.saturating_sub(prev_rx) as f64 * 8.0) / secs,
                    (tx_bytes.saturating_sub(prev_tx) as f64 * 8.0) / secs,
                )
            }
            None => (0.0, 0.0),
        };
        previous_counters = Some((rx_bytes, tx_bytes, now));

        let snapshot = MetricsSnapshot {
            sampled_at: Utc::now(),
            latency,
            rx_bytes,
            tx_bytes,
            download_bps,
            upload_bps,
            consecutive_probe_failures: failures,
        };

        debug!(
            "Metrics sample: latency={:?}ms failures={}",
            snapshot.latency.as_ref().map(|l| l.avg_ms),
            failures
        );
        snapshot_tx.send_replace(Some(snapshot));
    }
}

/// TCP round-trip probe: a bounded connect to the server's handshake
/// port, repeated a few times per cycle for jitter
async fn probe_latency(target: &ServerEndpoint, timeout: Duration) -> Option<LatencyStats> {
    let mut samples: Vec<f64> = Vec::with_capacity(PROBES_PER_CYCLE);

    for _ in 0..PROBES_PER_CYCLE {
        let start = Instant::now();
        let attempt = tokio::time::timeout(
            timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await;

        if let Ok(Ok(_stream)) = attempt {
            samples.push(start.elapsed().as_secs_f64() * 1000.0);
        }
    }

    if samples.is_empty() {
        return None;
    }

    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(0.0_f64, f64::max);
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let jitter = if samples.len() > 1 {
        let variance =
            samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };

    Some(LatencyStats {
        min_ms: min,
        max_ms: max,
        avg_ms: avg,
        jitter_ms: jitter,
    })
}
