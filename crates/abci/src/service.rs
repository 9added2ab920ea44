//! The consensus-facing application-protocol surface.

use async_trait::async_trait;
use thiserror::Error;

use crate::proto::abci::v2;

/// Errors surfaced by an application-protocol handle.
#[derive(Debug, Error)]
pub enum AbciError {
    /// Error returned over the wire by an embedded application.
    #[error(transparent)]
    Rpc(#[from] tonic::Status),

    /// Transport-level failure while reaching an embedded application.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Error raised by an in-process application.
    #[error("application error: {0}")]
    App(String),
}

/// Result type for application-protocol calls.
pub type AbciResult<T> = Result<T, AbciError>;

/// The application protocol as seen by the consensus engine.
///
/// All requests are one-shot; the engine never holds a handle across a
/// version switch, it re-fetches one per request from the multiplexer.
/// Implemented in-process by native applications and over a loopback wire
/// connection by the remote clients in `meridian-mux`.
#[async_trait]
pub trait Abci: Send + Sync {
    async fn echo(&self, req: v2::EchoRequest) -> AbciResult<v2::EchoResponse>;

    async fn info(&self, req: v2::InfoRequest) -> AbciResult<v2::InfoResponse>;

    async fn init_chain(&self, req: v2::InitChainRequest) -> AbciResult<v2::InitChainResponse>;

    async fn query(&self, req: v2::QueryRequest) -> AbciResult<v2::QueryResponse>;

    async fn check_tx(&self, req: v2::CheckTxRequest) -> AbciResult<v2::CheckTxResponse>;

    async fn prepare_proposal(
        &self,
        req: v2::PrepareProposalRequest,
    ) -> AbciResult<v2::PrepareProposalResponse>;

    async fn process_proposal(
        &self,
        req: v2::ProcessProposalRequest,
    ) -> AbciResult<v2::ProcessProposalResponse>;

    async fn finalize_block(
        &self,
        req: v2::FinalizeBlockRequest,
    ) -> AbciResult<v2::FinalizeBlockResponse>;

    async fn commit(&self, req: v2::CommitRequest) -> AbciResult<v2::CommitResponse>;
}
