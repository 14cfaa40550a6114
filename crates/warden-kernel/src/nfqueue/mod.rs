//! Packet-queue integration (Linux-class)
//!
//! Installs the firewall-table surface, opens one netlink socket per
//! (direction, family) queue, parses queued packets into the uniform
//! `Packet` model and answers each with a mark-encoded verdict. A lost
//! socket is reconnected with bounded exponential backoff while pending
//! verdict waits drain against the replacement socket.

pub mod conntrack;
pub mod queue;
pub mod rules;

use crate::marks::decision_to_mark;
use crate::{
    await_decision, join_timeout, packet_with_sink, Backoff, OsIntegration, ProcessAttributor,
    VerdictCacheMirror,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warden_common::{CoreConfig, Error, Result};
use warden_conntrack::{BandwidthSample, Connection};
use warden_packet::{parse, Direction, Packet, PacketHandle, Verdict};

const RECONNECT_ATTEMPTS: u32 = 8;

/// Map a queue number back to the packet direction it serves
fn queue_direction(config: &CoreConfig, queue: u16) -> Direction {
    if queue == config.queues.in_v4 || queue == config.queues.in_v6 {
        Direction::Inbound
    } else {
        Direction::Outbound
    }
}

struct QueueWorker {
    queue: u16,
    socket: Arc<Mutex<Arc<queue::NfqSocket>>>,
    thread: std::thread::JoinHandle<()>,
}

/// The packet-queue realization
pub struct NfqueueIntegration {
    config: CoreConfig,
    attributor: Arc<dyn ProcessAttributor>,
    running: AtomicBool,
    stopping: Arc<AtomicBool>,
    seq: AtomicU32,
    mirror: VerdictCacheMirror,
    packet_tx: mpsc::Sender<Packet>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    // the queue realization emits no samples itself; the sender is parked
    // here so the stream stays open for the accounting worker
    _bandwidth_tx: mpsc::Sender<BandwidthSample>,
    bandwidth_rx: Mutex<Option<mpsc::Receiver<BandwidthSample>>>,
    workers: Mutex<Vec<QueueWorker>>,
}

impl NfqueueIntegration {
    pub fn new(config: CoreConfig, attributor: Arc<dyn ProcessAttributor>) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(512);
        let (bandwidth_tx, bandwidth_rx) = mpsc::channel(512);
        Self {
            config,
            attributor,
            running: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            seq: AtomicU32::new(1),
            mirror: VerdictCacheMirror::new(),
            packet_tx,
            packet_rx: Mutex::new(Some(packet_rx)),
            _bandwidth_tx: bandwidth_tx,
            bandwidth_rx: Mutex::new(Some(bandwidth_rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn open_queue(&self, queue_num: u16) -> Result<Arc<queue::NfqSocket>> {
        let socket = queue::NfqSocket::open().map_err(Error::Io)?;
        for msg in queue::bind_messages(queue_num, self.next_seq()) {
            socket.send(&msg).map_err(Error::Io)?;
        }
        Ok(Arc::new(socket))
    }

    fn spawn_worker(&self, queue_num: u16) -> Result<QueueWorker> {
        let socket = Arc::new(Mutex::new(self.open_queue(queue_num)?));

        let direction = queue_direction(&self.config, queue_num);
        let deadline = Duration::from_secs(self.config.limits.verdict_deadline_secs);
        let packet_tx = self.packet_tx.clone();
        let attributor = self.attributor.clone();
        let socket_slot = socket.clone();
        let stopping = self.stopping.clone();
        let runtime = tokio::runtime::Handle::current();

        let thread = std::thread::Builder::new()
            .name(format!("warden-nfq-{queue_num}"))
            .spawn(move || {
                let mut buf = vec![0u8; 64 * 1024];
                let mut backoff = Backoff::new(RECONNECT_ATTEMPTS);
                loop {
                    let current = socket_slot.lock().clone();
                    let received = match current.recv(&mut buf) {
                        Ok(0) => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
                        Ok(n) => Ok(n),
                        Err(e) => Err(e),
                    };

                    let n = match received {
                        Ok(n) => {
                            backoff.reset();
                            n
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            if stopping.load(Ordering::Acquire) || packet_tx.is_closed() {
                                return;
                            }
                            tracing::warn!(queue = queue_num, error = %e, "queue socket lost");
                            let Some(delay) = backoff.next_delay() else {
                                tracing::error!(queue = queue_num, "reconnect attempts exhausted");
                                return;
                            };
                            std::thread::sleep(delay);
                            match queue::NfqSocket::open().and_then(|s| {
                                for msg in queue::bind_messages(queue_num, 1) {
                                    s.send(&msg)?;
                                }
                                Ok(s)
                            }) {
                                Ok(fresh) => *socket_slot.lock() = Arc::new(fresh),
                                Err(e) => {
                                    tracing::warn!(queue = queue_num, error = %e, "reconnect failed")
                                }
                            }
                            continue;
                        }
                    };

                    for message in queue::parse_messages(&buf[..n]) {
                        let queue::NfqMessage::Packet(queued) = message else {
                            continue;
                        };
                        let mut info = match parse::parse_l3(&queued.payload, direction) {
                            Ok(info) => info,
                            Err(e) => {
                                tracing::debug!(error = %e, "unparseable packet, dropping");
                                let msg = queue::verdict_message(
                                    queue_num,
                                    queued.packet_id,
                                    crate::marks::MARK_DROP,
                                    1,
                                );
                                let _ = socket_slot.lock().send(&msg);
                                continue;
                            }
                        };
                        info.process_id = attributor.attribute(&info);
                        let protocol = info.protocol;

                        let (packet, decision_rx) = packet_with_sink(
                            info,
                            PacketHandle::Queue { queue: queue_num, packet_id: queued.packet_id },
                            Some(bytes::Bytes::from(queued.payload)),
                        );

                        let verdict_socket = socket_slot.clone();
                        let packet_id = queued.packet_id;
                        runtime.spawn(async move {
                            let decision = await_decision(decision_rx, deadline).await;
                            let mark = decision_to_mark(decision, protocol);
                            let msg = queue::verdict_message(queue_num, packet_id, mark, 1);
                            if let Err(e) = verdict_socket.lock().send(&msg) {
                                tracing::warn!(error = %e, "verdict write failed");
                            }
                        });

                        if packet_tx.blocking_send(packet).is_err() {
                            return;
                        }
                    }
                }
            })
            .map_err(Error::Io)?;

        Ok(QueueWorker { queue: queue_num, socket, thread })
    }
}

#[async_trait]
impl OsIntegration for NfqueueIntegration {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stopping.store(false, Ordering::Release);

        let specs = rules::ruleset(&self.config.queues, &self.config.endpoints);
        if let Err(e) = rules::install::install(&specs) {
            // no residue on failure
            rules::install::remove().ok();
            self.running.store(false, Ordering::Release);
            return Err(e);
        }

        let mut workers = self.workers.lock();
        for queue_num in self.config.queues.all() {
            match self.spawn_worker(queue_num) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    drop(workers);
                    self.stop_inner();
                    return Err(e);
                }
            }
        }
        tracing::info!(queues = ?self.config.queues.all(), "packet queues bound");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_inner();
        Ok(())
    }

    fn take_packet_stream(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packet_rx.lock().take()
    }

    fn take_bandwidth_stream(&self) -> Option<mpsc::Receiver<BandwidthSample>> {
        self.bandwidth_rx.lock().take()
    }

    async fn clear_cache(&self) -> Result<()> {
        let invalidated = self.mirror.clear();
        let socket = queue::NfqSocket::open().map_err(Error::Io)?;
        socket
            .send(&conntrack::flush_message(libc::AF_INET as u8, self.next_seq()))
            .map_err(Error::Io)?;
        socket
            .send(&conntrack::flush_message(libc::AF_INET6 as u8, self.next_seq()))
            .map_err(Error::Io)?;
        tracing::debug!(invalidated, "kernel verdict cache cleared");
        Ok(())
    }

    async fn update_verdict(&self, conn: &Connection, verdict: Verdict) -> Result<()> {
        if !self.mirror.record(conn.fingerprint, verdict) {
            return Ok(());
        }
        // dropping the conntrack entry sends the next packet back to
        // userspace, where the new verdict applies and re-caches
        let socket = queue::NfqSocket::open().map_err(Error::Io)?;
        socket
            .send(&conntrack::delete_message(conn, self.next_seq()))
            .map_err(Error::Io)?;
        Ok(())
    }

    async fn delete_tracked_connection(&self, conn: &Connection) -> Result<()> {
        self.mirror.forget(&conn.fingerprint);
        let socket = queue::NfqSocket::open().map_err(Error::Io)?;
        socket
            .send(&conntrack::delete_message(conn, self.next_seq()))
            .map_err(Error::Io)?;
        Ok(())
    }

    fn version(&self) -> String {
        format!("nfqueue/{}", env!("CARGO_PKG_VERSION"))
    }

    async fn reset_all_tracked_connections(&self) -> Result<()> {
        self.clear_cache().await
    }
}

impl NfqueueIntegration {
    fn stop_inner(&self) {
        self.stopping.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            let socket = worker.socket.lock().clone();
            let _ = socket.send(&queue::unbind_message(worker.queue, 1));
            socket.shutdown();
        }
        for worker in workers {
            if let Err(e) = join_timeout(worker.thread, Duration::from_secs(5)) {
                tracing::warn!(queue = worker.queue, error = %e, "queue reader did not drain");
            }
        }
        rules::install::remove().ok();
        self.mirror.clear();
    }
}
