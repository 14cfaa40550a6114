//! Verdict reconciliation
//!
//! Applies a verdict to a packet, keeping the kernel cache and the
//! connection record in agreement: permanence is decided here, lower
//! verdicts are clamped to the connection's current one, and verdict
//! delivery errors are swallowed because the packet may already be past
//! its decision horizon.
//!
//! Re-evaluation walks all connections after a configuration, profile or
//! tunnel event, re-runs the decision with no packet, and invalidates the
//! kernel cache once at the end.

use crate::pipeline::{finalize_verdict, Firewall};
use warden_common::Result;
use warden_conntrack::{ConnState, Connection};
use warden_kernel::OsIntegration;
use warden_packet::{Packet, Verdict};

impl Firewall {
    /// Deliver `verdict` for `packet`, updating the connection's
    /// permanence state. `allow_permanent` is false while inspection is
    /// still running.
    pub(crate) fn issue_verdict(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        packet: &Packet,
        verdict: Verdict,
        allow_permanent: bool,
    ) {
        if allow_permanent
            && !state.permanent
            && self.config.permanent_verdicts
            && self.persistence.should_persist(state)
        {
            state.permanent = true;
            state.dirty = true;
        }

        // never hand out anything weaker than what the connection holds
        let verdict = verdict.max(state.active_verdict);
        let permanent = state.permanent;

        let result = match verdict {
            Verdict::Accept => {
                self.counters.accepted.inc();
                if permanent {
                    packet.permanent_accept()
                } else {
                    packet.accept()
                }
            }
            Verdict::Block => {
                self.counters.blocked.inc();
                if permanent {
                    packet.permanent_block()
                } else {
                    packet.block()
                }
            }
            Verdict::Drop => {
                self.counters.dropped.inc();
                if permanent {
                    packet.permanent_drop()
                } else {
                    packet.drop_packet()
                }
            }
            Verdict::RerouteToNameserver => {
                self.counters.rerouted_dns.inc();
                packet.reroute_to_nameserver()
            }
            Verdict::RerouteToTunnel => {
                self.counters.rerouted_tunnel.inc();
                packet.reroute_to_tunnel()
            }
            Verdict::Failed => {
                self.counters.failed.inc();
                packet.drop_packet()
            }
            Verdict::Undecided | Verdict::Undeterminable => {
                self.counters.undecided_downgrades.inc();
                self.counters.dropped.inc();
                tracing::warn!(
                    conn = %conn.fingerprint,
                    verdict = %verdict,
                    "undecided verdict at issue time, dropping"
                );
                packet.drop_packet()
            }
        };
        metrics::counter!("warden_verdicts_issued", "verdict" => verdict.as_str())
            .increment(1);

        if let Err(e) = result {
            // the OS may have fast-tracked or timed the packet out already
            tracing::debug!(conn = %conn.fingerprint, error = %e, "verdict not delivered");
        }
    }

    /// Re-evaluate every connection after a configuration-change,
    /// profile-change or tunnel-connect event.
    pub async fn reevaluate_all(&self, integration: &dyn OsIntegration) -> Result<()> {
        let mut changed = 0usize;
        let connections = self.tracker.get_all();
        let total = connections.len();

        for conn in connections {
            let mut state = conn.lock().await;
            if state.internal {
                continue;
            }

            let previous = state.firewall_verdict;
            if let Err(e) = self.filter_connection(&conn, &mut state, None).await {
                tracing::warn!(conn = %conn.fingerprint, error = %e, "re-evaluation failed");
                state.firewall_verdict = Verdict::Failed;
                state.reason = Some(e.to_string());
                finalize_verdict(&mut state, conn.direction);
            }

            if state.firewall_verdict != previous {
                state.dirty = true;
                changed += 1;
                tracing::info!(
                    conn = %conn.fingerprint,
                    from = %previous,
                    to = %state.firewall_verdict,
                    "verdict changed on re-evaluation"
                );
            }

            if state.active_verdict != Verdict::RerouteToTunnel {
                if let Some(context) = state.tunnel.take() {
                    context.stop();
                }
            }
        }

        // one cache invalidation for the whole iteration
        integration.clear_cache().await?;
        tracing::info!(total, changed, "re-evaluation complete");
        Ok(())
    }
}
