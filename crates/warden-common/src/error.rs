//! Error types shared across the interception core

use thiserror::Error;

/// Core error type
///
/// The decision pipeline never surfaces these to the dispatcher; a pipeline
/// failure marks the connection Failed and finalization maps that to
/// drop (inbound) or block (outbound). Integration start errors are the
/// exception: they propagate out of subsystem start and are fatal.
#[derive(Error, Debug)]
pub enum Error {
    /// Kernel channel is not open (yet, or anymore)
    #[error("integration not ready")]
    IntegrationNotReady,

    /// Verdict attempted on an observation-only packet
    #[error("packet carries no verdict id (info-only)")]
    InfoOnlyPacket,

    /// The integration cannot fetch the payload after the fact
    #[error("payload load failed: {0}")]
    PayloadLoadFailed(String),

    /// A verdict was already set for this packet
    #[error("verdict already set")]
    VerdictAlreadySet,

    /// Kernel rules could not be installed
    #[error("rule install failed: {0}")]
    RuleInstallFailed(String),

    /// A channel to or from the integration closed
    #[error("channel closed")]
    ChannelClosed,

    /// A bounded wait elapsed
    #[error("timed out")]
    Timeout,

    /// The policy collaborator failed
    #[error("policy error: {0}")]
    PolicyError(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;
