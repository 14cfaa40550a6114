//! Warden Inspect - deep inspection of connection payloads
//!
//! Inspectors are enrolled per connection through registered factories and
//! fed the reassembled L4 stream as it grows, one buffer per direction.
//! Each inspector answers with a verdict and whether it wants more data;
//! the framework pools verdicts by severity and tears inspectors down when
//! they are all done or the connection dies.
//!
//! Buffers are capped per connection; a stream that exceeds the cap without
//! producing a verdict makes the remaining inspectors give up.

#![warn(clippy::all)]

pub mod encryption;
pub mod http;
pub mod portscan;
pub mod tls;

use dashmap::DashMap;
use parking_lot::Mutex;
use warden_conntrack::{ConnState, Connection, Fingerprint};
use warden_packet::{Direction, PacketInfo, Verdict};

/// Outcome of one `handle_stream` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// `Undecided` needs more bytes, `Undeterminable` gives up,
    /// `Block` kills the connection, `Accept` clears it
    pub verdict: Verdict,
    pub reason: Option<String>,
    /// This inspector is finished with the connection
    pub done: bool,
}

impl StreamOutcome {
    pub fn need_more() -> Self {
        Self { verdict: Verdict::Undecided, reason: None, done: false }
    }

    pub fn give_up() -> Self {
        Self { verdict: Verdict::Undeterminable, reason: None, done: true }
    }

    pub fn accept() -> Self {
        Self { verdict: Verdict::Accept, reason: None, done: true }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self { verdict: Verdict::Block, reason: Some(reason.into()), done: true }
    }
}

/// A stream inspector enrolled on one connection
pub trait Inspector: Send {
    fn name(&self) -> &'static str;

    /// Called with the cumulative stream for `direction` whenever new
    /// payload arrives. Errors count as giving up.
    fn handle_stream(
        &mut self,
        state: &mut ConnState,
        direction: Direction,
        stream: &[u8],
    ) -> Result<StreamOutcome, warden_common::Error>;

    /// Cleanup when the connection dies or inspection finishes
    fn destroy(&mut self) {}
}

/// Builds an inspector for a connection, or `None` if not applicable
pub type InspectorFactory =
    Box<dyn Fn(&Connection, &mut ConnState, &PacketInfo) -> Option<Box<dyn Inspector>> + Send + Sync>;

/// Pooled result of feeding one packet through all enrolled inspectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionResult {
    /// Maximum-severity verdict over all inspectors
    pub verdict: Verdict,
    pub reason: Option<String>,
    /// At least one inspector still wants data
    pub continues: bool,
}

struct Slot {
    inspector: Box<dyn Inspector>,
    done: bool,
    last: Verdict,
}

struct StreamBuffer {
    data: Vec<u8>,
    overflowed: bool,
}

impl StreamBuffer {
    fn new() -> Self {
        Self { data: Vec::new(), overflowed: false }
    }

    /// Append up to the cap; returns false once the cap is exceeded
    fn push(&mut self, bytes: &[u8], cap: usize) -> bool {
        if self.overflowed {
            return false;
        }
        if self.data.len() + bytes.len() > cap {
            self.overflowed = true;
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }
}

struct ConnInspection {
    slots: Vec<Slot>,
    // index 0: outbound, index 1: inbound
    buffers: [StreamBuffer; 2],
}

fn dir_index(direction: Direction) -> usize {
    match direction {
        Direction::Outbound => 0,
        Direction::Inbound => 1,
    }
}

/// Registry of inspector factories plus per-connection inspection state
pub struct InspectionFramework {
    factories: Vec<InspectorFactory>,
    table: DashMap<Fingerprint, Mutex<ConnInspection>>,
    cap: usize,
}

impl InspectionFramework {
    /// Factories are write-once at start
    pub fn new(factories: Vec<InspectorFactory>, reassembly_cap: usize) -> Self {
        Self {
            factories,
            table: DashMap::new(),
            cap: reassembly_cap,
        }
    }

    /// Offer the connection to every factory. Returns whether at least one
    /// inspector enrolled; the caller then flips the connection into the
    /// inspecting handler.
    pub fn enroll(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        info: &PacketInfo,
    ) -> bool {
        let slots: Vec<Slot> = self
            .factories
            .iter()
            .filter_map(|factory| factory(conn, state, info))
            .map(|inspector| Slot { inspector, done: false, last: Verdict::Undecided })
            .collect();
        if slots.is_empty() {
            return false;
        }
        tracing::debug!(
            conn = %conn.fingerprint,
            inspectors = slots.len(),
            "inspection enrolled"
        );
        self.table.insert(
            conn.fingerprint,
            Mutex::new(ConnInspection {
                slots,
                buffers: [StreamBuffer::new(), StreamBuffer::new()],
            }),
        );
        true
    }

    /// Feed newly arrived payload to all enrolled inspectors, in
    /// registration order, and pool their verdicts by severity.
    pub fn inspect(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        direction: Direction,
        new_bytes: &[u8],
    ) -> InspectionResult {
        let Some(entry) = self.table.get(&conn.fingerprint) else {
            return InspectionResult {
                verdict: Verdict::Undecided,
                reason: None,
                continues: false,
            };
        };
        let mut inspection = entry.lock();

        let fits = inspection.buffers[dir_index(direction)].push(new_bytes, self.cap);
        if !fits {
            // cap exceeded without a verdict: everyone left gives up
            tracing::debug!(conn = %conn.fingerprint, "reassembly cap exceeded, giving up");
            for slot in inspection.slots.iter_mut().filter(|s| !s.done) {
                slot.done = true;
                slot.last = Verdict::Undeterminable;
                slot.inspector.destroy();
            }
        } else {
            // split borrow: the buffer is read-only while slots run
            let ConnInspection { slots, buffers } = &mut *inspection;
            let stream = &buffers[dir_index(direction)].data;
            for slot in slots.iter_mut().filter(|s| !s.done) {
                let outcome = match slot.inspector.handle_stream(state, direction, stream) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(
                            inspector = slot.inspector.name(),
                            error = %e,
                            "inspector failed, giving up"
                        );
                        StreamOutcome::give_up()
                    }
                };
                slot.last = outcome.verdict;
                if let Some(reason) = outcome.reason {
                    state.reason = Some(reason);
                }
                if outcome.done {
                    slot.done = true;
                    slot.inspector.destroy();
                }
            }
        }

        let verdict = inspection
            .slots
            .iter()
            .map(|s| s.last)
            .max()
            .unwrap_or(Verdict::Undecided);
        let continues = inspection.slots.iter().any(|s| !s.done);
        let reason = state.reason.clone();

        drop(inspection);
        drop(entry);
        if !continues {
            self.table.remove(&conn.fingerprint);
        }

        InspectionResult { verdict, reason, continues }
    }

    /// Tear down inspection state when a connection dies
    pub fn release(&self, fingerprint: &Fingerprint) {
        if let Some((_, entry)) = self.table.remove(fingerprint) {
            let mut inspection = entry.into_inner();
            for slot in inspection.slots.iter_mut().filter(|s| !s.done) {
                slot.inspector.destroy();
            }
        }
    }

    /// Number of connections currently under inspection
    pub fn active(&self) -> usize {
        self.table.len()
    }
}
