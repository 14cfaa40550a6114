//! Observation-only probe integration
//!
//! Reads connection-creation events from kernel probes and produces
//! info-only packets: no payload, no verdict channel. Verdict operations
//! on these packets are no-ops at the integration level (the packet API
//! reports `InfoOnlyPacket`, which the reconciler swallows).
//!
//! The ring-buffer reader needs the `probe` feature (aya, Linux). Event
//! decoding and the injection path are always available, which is what the
//! tests and the daemon's observation mode use.

pub mod events;

use crate::OsIntegration;
use async_trait::async_trait;
use events::ConnectionEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use warden_common::Result;
use warden_conntrack::{BandwidthSample, Connection};
use warden_packet::{Packet, Verdict};

/// The observation-only realization
pub struct ProbeIntegration {
    running: AtomicBool,
    packet_tx: mpsc::Sender<Packet>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    bandwidth_tx: mpsc::Sender<BandwidthSample>,
    bandwidth_rx: Mutex<Option<mpsc::Receiver<BandwidthSample>>>,
    #[cfg(all(target_os = "linux", feature = "probe"))]
    program_path: std::path::PathBuf,
    #[cfg(all(target_os = "linux", feature = "probe"))]
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ProbeIntegration {
    pub fn new(#[cfg(all(target_os = "linux", feature = "probe"))] program_path: std::path::PathBuf) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(512);
        let (bandwidth_tx, bandwidth_rx) = mpsc::channel(512);
        Self {
            running: AtomicBool::new(false),
            packet_tx,
            packet_rx: Mutex::new(Some(packet_rx)),
            bandwidth_tx,
            bandwidth_rx: Mutex::new(Some(bandwidth_rx)),
            #[cfg(all(target_os = "linux", feature = "probe"))]
            program_path,
            #[cfg(all(target_os = "linux", feature = "probe"))]
            reader: Mutex::new(None),
        }
    }

    /// Feed one raw event record; used by tests and by embedders that own
    /// the ring buffer themselves
    pub async fn inject(&self, record: &[u8]) -> bool {
        let Some(event) = ConnectionEvent::decode(record) else {
            tracing::debug!("undecodable probe event");
            return false;
        };
        self.packet_tx
            .send(Packet::observation(event.to_info()))
            .await
            .is_ok()
    }

    #[cfg(all(target_os = "linux", feature = "probe"))]
    fn spawn_ring_reader(&self) -> Result<()> {
        use warden_common::Error;

        let mut ebpf = aya::Ebpf::load_file(&self.program_path)
            .map_err(|e| Error::RuleInstallFailed(e.to_string()))?;
        let ring = aya::maps::RingBuf::try_from(
            ebpf.take_map("CONN_EVENTS")
                .ok_or(Error::IntegrationNotReady)?,
        )
        .map_err(|e| Error::RuleInstallFailed(e.to_string()))?;

        let packet_tx = self.packet_tx.clone();
        let thread = std::thread::Builder::new()
            .name("warden-probe".into())
            .spawn(move || {
                // the loaded program object must outlive the reader
                let _ebpf = ebpf;
                let mut ring = ring;
                loop {
                    match ring.next() {
                        Some(record) => {
                            if let Some(event) = ConnectionEvent::decode(&record) {
                                if packet_tx
                                    .blocking_send(Packet::observation(event.to_info()))
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        None => {
                            if packet_tx.is_closed() {
                                return;
                            }
                            std::thread::sleep(std::time::Duration::from_millis(20));
                        }
                    }
                }
            })
            .map_err(Error::Io)?;
        *self.reader.lock() = Some(thread);
        Ok(())
    }
}

#[async_trait]
impl OsIntegration for ProbeIntegration {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        #[cfg(all(target_os = "linux", feature = "probe"))]
        {
            if let Err(e) = self.spawn_ring_reader() {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        #[cfg(all(target_os = "linux", feature = "probe"))]
        if let Some(thread) = self.reader.lock().take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn take_packet_stream(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packet_rx.lock().take()
    }

    fn take_bandwidth_stream(&self) -> Option<mpsc::Receiver<BandwidthSample>> {
        self.bandwidth_rx.lock().take()
    }

    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }

    async fn update_verdict(&self, _conn: &Connection, _verdict: Verdict) -> Result<()> {
        // observation only; nothing to enforce
        Ok(())
    }

    async fn delete_tracked_connection(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    fn version(&self) -> String {
        format!("probe/{}", env!("CARGO_PKG_VERSION"))
    }

    async fn reset_all_tracked_connections(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integration() -> ProbeIntegration {
        #[cfg(all(target_os = "linux", feature = "probe"))]
        return ProbeIntegration::new(std::path::PathBuf::from("/nonexistent"));
        #[cfg(not(all(target_os = "linux", feature = "probe")))]
        ProbeIntegration::new()
    }

    #[tokio::test]
    async fn test_injected_event_becomes_observation_packet() {
        let probe = integration();
        let mut packets = probe.take_packet_stream().unwrap();

        let event = ConnectionEvent {
            pid: 77,
            inbound: true,
            protocol: 17,
            family: 4,
            src: "8.8.8.8".parse().unwrap(),
            dst: "10.0.0.5".parse().unwrap(),
            src_port: 53,
            dst_port: 40000,
        };
        assert!(probe.inject(&event.encode()).await);

        let packet = packets.recv().await.unwrap();
        assert!(packet.info_only());
        assert_eq!(packet.info().process_id, Some(77));
        // verdict operations are reported as info-only, integration-level
        // behavior is "succeeds silently" because nothing listens
        assert!(packet.accept().is_err());
    }

    #[tokio::test]
    async fn test_bad_event_is_ignored() {
        let probe = integration();
        let _packets = probe.take_packet_stream().unwrap();
        assert!(!probe.inject(&[1, 2, 3]).await);
    }

    #[tokio::test]
    async fn test_verdict_ops_are_noops() {
        let probe = integration();
        probe.clear_cache().await.unwrap();
        probe.reset_all_tracked_connections().await.unwrap();
        assert!(probe.version().starts_with("probe/"));
    }
}
