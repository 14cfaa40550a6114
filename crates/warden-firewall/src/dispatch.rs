//! Packet dispatch
//!
//! Pulls packets off the integrator channel and spawns one task per
//! packet, decoupling long-running inspection from the ingress stream. A
//! stats worker publishes and resets the aggregate counters every ten
//! seconds, and a maintenance worker prunes dead connections and expired
//! portscan state.

use crate::pipeline::Firewall;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use warden_packet::Packet;

/// Interval of the stats worker
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Interval of the maintenance sweep
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Run until the packet stream closes or shutdown is signalled
pub async fn run_dispatcher(
    firewall: Arc<Firewall>,
    mut packets: mpsc::Receiver<Packet>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            packet = packets.recv() => {
                let Some(packet) = packet else {
                    tracing::info!("packet stream closed");
                    break;
                };
                let firewall = firewall.clone();
                tokio::spawn(async move {
                    firewall.handle_packet(packet).await;
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

/// Publish aggregate counters every interval, then reset them
pub async fn run_stats_worker(firewall: Arc<Firewall>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = firewall.counters().drain();
                if snapshot.total() > 0 {
                    tracing::info!(
                        accepted = snapshot.accepted,
                        blocked = snapshot.blocked,
                        dropped = snapshot.dropped,
                        failed = snapshot.failed,
                        rerouted_dns = snapshot.rerouted_dns,
                        rerouted_tunnel = snapshot.rerouted_tunnel,
                        fast_tracked = snapshot.fast_tracked,
                        connections = firewall.tracker().len(),
                        "packet stats"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Prune ended and idle connections and expired portscan entries
pub async fn run_maintenance(firewall: Arc<Firewall>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = firewall.config.limits.connection_idle_secs;
                let removed = firewall.tracker().prune(idle);
                for conn in &removed {
                    firewall.teardown_connection(conn);
                }
                if !removed.is_empty() {
                    tracing::debug!(removed = removed.len(), "connections pruned");
                }
                firewall.portscan.expire();
                firewall.ports.sweep();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
