//! Remote ABCI clients: the application-protocol surface forwarded over a
//! loopback wire connection to an embedded child process.
//!
//! Two vintages exist. V2 is a direct passthrough. V1 speaks the legacy
//! protocol: the chain id and app version are injected into envelopes the
//! legacy wire does not carry implicitly, and responses are normalized into
//! the V2 shape through [`meridian_abci::compat`].

use async_trait::async_trait;
use tonic::transport::Channel;

use meridian_abci::compat;
use meridian_abci::proto::abci::v1::abci_service_client::AbciServiceClient as V1Client;
use meridian_abci::proto::abci::v2::abci_service_client::AbciServiceClient as V2Client;
use meridian_abci::proto::abci::{v1, v2};
use meridian_abci::{Abci, AbciResult};

/// Block payloads can be large; raise the per-message limits to the wire
/// maximum.
const MAX_WIRE_MSG_SIZE: usize = i32::MAX as usize;

/// Passthrough client for embedded applications speaking the current wire
/// protocol.
pub struct RemoteAbciClientV2 {
    client: V2Client<Channel>,
}

impl RemoteAbciClientV2 {
    pub fn new(conn: Channel) -> Self {
        let client = V2Client::new(conn)
            .max_decoding_message_size(MAX_WIRE_MSG_SIZE)
            .max_encoding_message_size(MAX_WIRE_MSG_SIZE);
        Self { client }
    }
}

#[async_trait]
impl Abci for RemoteAbciClientV2 {
    async fn echo(&self, req: v2::EchoRequest) -> AbciResult<v2::EchoResponse> {
        Ok(self.client.clone().echo(req).await?.into_inner())
    }

    async fn info(&self, req: v2::InfoRequest) -> AbciResult<v2::InfoResponse> {
        Ok(self.client.clone().info(req).await?.into_inner())
    }

    async fn init_chain(&self, req: v2::InitChainRequest) -> AbciResult<v2::InitChainResponse> {
        Ok(self.client.clone().init_chain(req).await?.into_inner())
    }

    async fn query(&self, req: v2::QueryRequest) -> AbciResult<v2::QueryResponse> {
        Ok(self.client.clone().query(req).await?.into_inner())
    }

    async fn check_tx(&self, req: v2::CheckTxRequest) -> AbciResult<v2::CheckTxResponse> {
        Ok(self.client.clone().check_tx(req).await?.into_inner())
    }

    async fn prepare_proposal(
        &self,
        req: v2::PrepareProposalRequest,
    ) -> AbciResult<v2::PrepareProposalResponse> {
        Ok(self.client.clone().prepare_proposal(req).await?.into_inner())
    }

    async fn process_proposal(
        &self,
        req: v2::ProcessProposalRequest,
    ) -> AbciResult<v2::ProcessProposalResponse> {
        Ok(self.client.clone().process_proposal(req).await?.into_inner())
    }

    async fn finalize_block(
        &self,
        req: v2::FinalizeBlockRequest,
    ) -> AbciResult<v2::FinalizeBlockResponse> {
        Ok(self.client.clone().finalize_block(req).await?.into_inner())
    }

    async fn commit(&self, req: v2::CommitRequest) -> AbciResult<v2::CommitResponse> {
        Ok(self.client.clone().commit(req).await?.into_inner())
    }
}

/// Adapter client for embedded applications speaking the legacy wire
/// protocol.
///
/// Stateless beyond the channel and the injected chain context.
pub struct RemoteAbciClientV1 {
    client: V1Client<Channel>,
    chain_id: String,
    app_version: u64,
}

impl RemoteAbciClientV1 {
    pub fn new(conn: Channel, chain_id: String, app_version: u64) -> Self {
        let client = V1Client::new(conn)
            .max_decoding_message_size(MAX_WIRE_MSG_SIZE)
            .max_encoding_message_size(MAX_WIRE_MSG_SIZE);
        Self {
            client,
            chain_id,
            app_version,
        }
    }
}

#[async_trait]
impl Abci for RemoteAbciClientV1 {
    async fn echo(&self, req: v2::EchoRequest) -> AbciResult<v2::EchoResponse> {
        let resp = self
            .client
            .clone()
            .echo(v1::EchoRequest {
                message: req.message,
            })
            .await?
            .into_inner();
        Ok(v2::EchoResponse {
            message: resp.message,
        })
    }

    async fn info(&self, _req: v2::InfoRequest) -> AbciResult<v2::InfoResponse> {
        let req = compat::info_request(&self.chain_id, self.app_version);
        let resp = self.client.clone().info(req).await?.into_inner();
        Ok(compat::info_response(resp))
    }

    async fn init_chain(&self, req: v2::InitChainRequest) -> AbciResult<v2::InitChainResponse> {
        let version = if req.initial_app_version == 0 {
            self.app_version
        } else {
            req.initial_app_version
        };
        let req = compat::init_chain_request(req, self.app_version);
        let resp = self.client.clone().init_chain(req).await?.into_inner();
        Ok(compat::init_chain_response(resp, version))
    }

    async fn query(&self, req: v2::QueryRequest) -> AbciResult<v2::QueryResponse> {
        let resp = self
            .client
            .clone()
            .query(compat::query_request(req))
            .await?
            .into_inner();
        Ok(compat::query_response(resp))
    }

    async fn check_tx(&self, req: v2::CheckTxRequest) -> AbciResult<v2::CheckTxResponse> {
        let resp = self
            .client
            .clone()
            .check_tx(compat::check_tx_request(req))
            .await?
            .into_inner();
        Ok(compat::check_tx_response(resp))
    }

    // The legacy protocol has no proposal phase; the proposal passes through
    // unshaped, matching the engine-side compatibility behavior.
    async fn prepare_proposal(
        &self,
        req: v2::PrepareProposalRequest,
    ) -> AbciResult<v2::PrepareProposalResponse> {
        Ok(v2::PrepareProposalResponse { txs: req.txs })
    }

    async fn process_proposal(
        &self,
        _req: v2::ProcessProposalRequest,
    ) -> AbciResult<v2::ProcessProposalResponse> {
        Ok(v2::ProcessProposalResponse {
            status: v2::ProposalStatus::Accept as i32,
        })
    }

    /// A V2 FinalizeBlock expands into the legacy four-phase block flow. The
    /// legacy commit is folded in here because it is the only call that
    /// yields the app hash.
    async fn finalize_block(
        &self,
        req: v2::FinalizeBlockRequest,
    ) -> AbciResult<v2::FinalizeBlockResponse> {
        let mut client = self.client.clone();

        let begin = client
            .begin_block(compat::begin_block_request(
                &req,
                &self.chain_id,
                self.app_version,
            ))
            .await?
            .into_inner();

        let mut delivers = Vec::with_capacity(req.txs.len());
        for tx in req.txs {
            let resp = client
                .deliver_tx(v1::DeliverTxRequest { tx })
                .await?
                .into_inner();
            delivers.push(resp);
        }

        let end = client
            .end_block(v1::EndBlockRequest { height: req.height })
            .await?
            .into_inner();

        let commit = client.commit(v1::CommitRequest {}).await?.into_inner();

        Ok(compat::finalize_block_response(begin, delivers, end, commit))
    }

    /// The legacy commit already ran at the end of `finalize_block`.
    async fn commit(&self, _req: v2::CommitRequest) -> AbciResult<v2::CommitResponse> {
        Ok(v2::CommitResponse { retain_height: 0 })
    }
}
