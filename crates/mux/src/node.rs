//! Interfaces to the multiplexer's external collaborators: the consensus
//! engine and the native application.
//!
//! The consensus engine is opaque; the multiplexer only needs to launch it,
//! stop it, and subscribe to its block events. The native application is the
//! latest state machine linked into this process; it owns its own storage.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use jsonrpsee::RpcModule;
use serde::Serialize;
use tokio::sync::broadcast;

use meridian_abci::Abci;
use meridian_operations::ShutdownSignal;

use crate::errors::{BoxError, MuxError};
use crate::trace::TraceWriter;

/// One finalized block as observed from the consensus engine.
#[derive(Clone, Debug)]
pub struct BlockEvent {
    pub height: u64,
    pub hash: Vec<u8>,
    /// App version declared in the block header.
    pub app_version: u64,
    /// App version the chain will declare next, from the finalized consensus
    /// params. Advisory.
    pub next_app_version: u64,
}

/// Which implementation is currently authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityMode {
    Unstarted,
    Native,
    Embedded,
}

impl AuthorityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorityMode::Unstarted => "unstarted",
            AuthorityMode::Native => "native",
            AuthorityMode::Embedded => "embedded",
        }
    }
}

/// Snapshot of the multiplexer's version state, published on every change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub chain_id: String,
    pub height: u64,
    pub app_version: u64,
    pub next_app_version: u64,
    pub mode: AuthorityMode,
}

/// Handle to a running consensus node.
#[async_trait]
pub trait ConsensusNode: Send + Sync {
    fn is_running(&self) -> bool;

    async fn stop(&self) -> Result<(), BoxError>;

    /// Subscribe to finalized-block events.
    fn block_events(&self) -> broadcast::Receiver<BlockEvent>;
}

/// Source of the authoritative application-protocol handle, pulled by the
/// consensus engine on every request. Implemented by the multiplexer.
#[async_trait]
pub trait AbciProvider: Send + Sync {
    async fn get_app(&self) -> Result<Arc<dyn Abci>, MuxError>;
}

/// Everything a consensus node needs from the outer process.
pub struct NodeContext {
    pub abci: Arc<dyn AbciProvider>,
    pub chain_id: String,
    pub home: PathBuf,
    /// Cancelled when the node should wind down.
    pub signal: ShutdownSignal,
}

/// Starts the consensus engine against the multiplexer.
pub type NodeLauncher = Arc<
    dyn Fn(NodeContext) -> BoxFuture<'static, Result<Box<dyn ConsensusNode>, BoxError>>
        + Send
        + Sync,
>;

/// The native application: the latest state machine, linked into this
/// process.
#[async_trait]
pub trait Application: Abci {
    /// Release application resources. Called once during teardown.
    async fn close(&self) -> Result<(), BoxError>;

    /// Methods the application contributes to the API server.
    fn api_module(&self) -> RpcModule<()> {
        RpcModule::new(())
    }
}

/// Everything the app creator needs to construct the native application.
pub struct AppContext {
    pub home: PathBuf,
    /// `<home>/data`; the application database lives here.
    pub data_dir: PathBuf,
    pub db_backend: String,
    pub chain_id: String,
    pub trace_writer: Option<TraceWriter>,
}

/// Constructs the native application on demand.
pub type AppCreator =
    Arc<dyn Fn(AppContext) -> Result<Arc<dyn Application>, BoxError> + Send + Sync>;
