//! Warden Conntrack - live connection state
//!
//! Maps canonical connection fingerprints to connection records. Creation
//! is single-inflight per fingerprint; all packets of one connection are
//! serialized through the connection's own lock.

#![warn(clippy::all)]

pub mod connection;
pub mod fingerprint;
pub mod tracker;

pub use connection::{
    BandwidthSample, ConnState, Connection, Entity, Handler, NetScope, SampleMethod,
    TunnelContext,
};
pub use fingerprint::Fingerprint;
pub use tracker::ConnectionTracker;
