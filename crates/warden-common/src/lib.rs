//! Warden Common - shared primitives for the packet interception core
//!
//! This crate provides the pieces every other warden crate leans on:
//! - Error kinds shared across the subsystem
//! - Configuration options recognized by the core
//! - Global packet counters
//! - Timestamp and counter primitives

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;

pub use config::*;
pub use error::*;

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond timestamp.
///
/// Used for packet seen-at stamps, connection aging and latency tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Get current timestamp (nanoseconds since epoch)
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self(nanos)
    }

    /// Construct from a raw nanosecond value
    #[inline(always)]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get nanoseconds value
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Duration since this timestamp in microseconds
    #[inline(always)]
    pub fn elapsed_micros(&self) -> u64 {
        Self::now().0.saturating_sub(self.0) / 1000
    }

    /// Duration since this timestamp in whole seconds
    #[inline(always)]
    pub fn elapsed_secs(&self) -> u64 {
        Self::now().0.saturating_sub(self.0) / 1_000_000_000
    }
}

/// Lock-free counter for hot-path metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero and return the previous value
    #[inline(always)]
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}
