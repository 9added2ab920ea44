//! Multiplexer error types.

use thiserror::Error;

use crate::appd::AppdError;
use crate::version::VersionError;

/// Boxed error type used at the seams to external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The version registry failed validation or a lookup failed for a
    /// reason other than the no-match sentinel.
    #[error("invalid versions: {0}")]
    Versions(#[from] VersionError),

    /// The consensus engine and the application disagree on the loopback
    /// endpoint. Fatal at boot.
    #[error(
        "ABCI client and server addresses must match:\n client={client}\n server={server}\n\
         To resolve, please configure the ABCI client (via proxy_app) to match \
         the ABCI server (via address)"
    )]
    EndpointMismatch { client: String, server: String },

    /// Invariant violation detected at construction or boot.
    #[error("configuration error: {0}")]
    Config(String),

    /// A component failed to start.
    #[error("failed to start {component}: {reason}")]
    Lifecycle { component: String, reason: String },

    /// A version switch failed mid-flight; surfaced to the consensus engine
    /// as a protocol-level failure on that request.
    #[error("{0}")]
    Switch(String),

    /// An untyped ABCI version string did not name a known vintage.
    #[error("unknown ABCI client version {0}")]
    UnknownAbciVersion(String),

    #[error(transparent)]
    Appd(#[from] AppdError),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// First error returned by the worker group.
    #[error("worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
