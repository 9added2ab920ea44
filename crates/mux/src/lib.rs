//! The application multiplexer.
//!
//! A meridian node participates in a consensus-driven chain across multiple,
//! incompatible application-protocol versions. At any height the chain is
//! governed by a declared app version; the multiplexer selects the correct
//! application implementation for that version — native and linked into this
//! process, or embedded and supervised as a child process — and brokers the
//! consensus engine's requests to it, switching implementations across an
//! in-band upgrade without restarting the node.

pub mod appd;
pub mod errors;
pub mod multiplexer;
pub mod node;
pub mod proxy;
mod servers;
pub mod trace;
pub mod version;

pub use appd::Appd;
pub use errors::{BoxError, MuxError};
pub use multiplexer::Multiplexer;
pub use node::{
    AbciProvider, AppContext, AppCreator, Application, AuthorityMode, BlockEvent, ConsensusNode,
    NodeContext, NodeLauncher, NodeStatus,
};
pub use proxy::{RemoteAbciClientV1, RemoteAbciClientV2};
pub use trace::TraceWriter;
pub use version::{AbciVersion, StartArgsFn, Version, VersionError, Versions};
