//! Warden Firewall - the decision core
//!
//! Composes the fast-track filter, the connection tracker, the per
//! connection handler chain, deep inspection and verdict reconciliation
//! into the pipeline every intercepted packet runs through:
//!
//! OS integration -> dispatcher -> fast-track -> tracker -> handlers
//! (policy, tunneling, inspection) -> verdict reconciler -> OS
//! integration.

#![warn(clippy::all)]

pub mod bandwidth;
pub mod dispatch;
pub mod fasttrack;
pub mod interop;
pub mod packet_metrics;
pub mod pipeline;
pub mod ports;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testutil;

pub use fasttrack::{FastTrack, FastTracker};
pub use pipeline::{Collaborators, Firewall};
pub use ports::OwnPortRegistry;
