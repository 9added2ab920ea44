//! In-process gRPC and API servers, enabled when the native application is
//! authoritative. An embedded application serves its own.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use jsonrpsee::types::{ErrorCode, ErrorObjectOwned};
use jsonrpsee::RpcModule;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use meridian_abci::proto::abci::v2;
use meridian_abci::proto::node::v1::{
    self as nodev1,
    block_service_server::{BlockService, BlockServiceServer},
    node_service_server::{NodeService, NodeServiceServer},
    query_service_client::QueryServiceClient,
    query_service_server::{QueryService, QueryServiceServer},
};
use meridian_abci::AbciError;
use meridian_operations::config::GrpcConfig;
use meridian_operations::{MetricsRegistry, WorkerSpawner};

use crate::node::{Application, BlockEvent, NodeStatus};

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

fn abci_error_to_status(err: AbciError) -> Status {
    match err {
        AbciError::Rpc(status) => status,
        AbciError::Transport(err) => Status::unavailable(err.to_string()),
        AbciError::App(msg) => Status::internal(msg),
    }
}

/// Reports the multiplexer's version state.
struct NodeServiceImpl {
    status: watch::Receiver<NodeStatus>,
}

#[tonic::async_trait]
impl NodeService for NodeServiceImpl {
    async fn status(
        &self,
        _request: Request<nodev1::StatusRequest>,
    ) -> Result<Response<nodev1::StatusResponse>, Status> {
        let status = self.status.borrow().clone();
        Ok(Response::new(nodev1::StatusResponse {
            node: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            chain_id: status.chain_id,
            app_version: status.app_version,
            next_app_version: status.next_app_version,
            height: status.height as i64,
            mode: status.mode.as_str().to_string(),
        }))
    }
}

/// Forwards state queries to the native application.
struct QueryServiceImpl {
    app: Arc<dyn Application>,
}

#[tonic::async_trait]
impl QueryService for QueryServiceImpl {
    async fn abci_query(
        &self,
        request: Request<nodev1::AbciQueryRequest>,
    ) -> Result<Response<nodev1::AbciQueryResponse>, Status> {
        let req = request.into_inner();
        let resp = self
            .app
            .query(v2::QueryRequest {
                path: req.path,
                data: req.data,
                height: req.height,
                prove: req.prove,
            })
            .await
            .map_err(abci_error_to_status)?;

        Ok(Response::new(nodev1::AbciQueryResponse {
            code: resp.code,
            log: resp.log,
            key: resp.key,
            value: resp.value,
            height: resp.height,
        }))
    }
}

/// Serves observed blocks, live and latest.
struct BlockServiceImpl {
    latest: watch::Receiver<Option<BlockEvent>>,
    blocks: broadcast::Sender<BlockEvent>,
}

fn block_update(event: &BlockEvent) -> nodev1::BlockUpdate {
    nodev1::BlockUpdate {
        height: event.height as i64,
        hash: event.hash.clone(),
        app_version: event.app_version,
        next_app_version: event.next_app_version,
    }
}

#[tonic::async_trait]
impl BlockService for BlockServiceImpl {
    type SubscribeBlocksStream = ResponseStream<nodev1::BlockUpdate>;

    async fn latest_block(
        &self,
        _request: Request<nodev1::LatestBlockRequest>,
    ) -> Result<Response<nodev1::LatestBlockResponse>, Status> {
        match self.latest.borrow().as_ref() {
            Some(event) => Ok(Response::new(nodev1::LatestBlockResponse {
                block: Some(block_update(event)),
            })),
            None => Err(Status::not_found("no blocks observed yet")),
        }
    }

    async fn subscribe_blocks(
        &self,
        _request: Request<nodev1::SubscribeBlocksRequest>,
    ) -> Result<Response<Self::SubscribeBlocksStream>, Status> {
        let rx = self.blocks.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|result| match result {
            Ok(event) => Some(Ok(block_update(&event))),
            Err(err) => {
                tracing::warn!(error = %err, "block subscriber lagging");
                None
            }
        });
        Ok(Response::new(Box::pin(stream)))
    }
}

/// Spawn the in-process gRPC server on the worker group, shutting down
/// gracefully on scope cancellation.
pub(crate) fn start_grpc_server(
    spawner: &WorkerSpawner,
    addr: SocketAddr,
    cfg: &GrpcConfig,
    app: Arc<dyn Application>,
    status: watch::Receiver<NodeStatus>,
    latest: watch::Receiver<Option<BlockEvent>>,
    blocks: broadcast::Sender<BlockEvent>,
) {
    let max_send = cfg.effective_max_send_msg_size();
    let max_recv = cfg.effective_max_recv_msg_size();

    let query_service = QueryServiceServer::new(QueryServiceImpl { app })
        .max_decoding_message_size(max_recv)
        .max_encoding_message_size(max_send);
    let node_service = NodeServiceServer::new(NodeServiceImpl { status })
        .max_decoding_message_size(max_recv)
        .max_encoding_message_size(max_send);
    let block_service = BlockServiceServer::new(BlockServiceImpl { latest, blocks })
        .max_decoding_message_size(max_recv)
        .max_encoding_message_size(max_send);

    let signal = spawner.signal();
    spawner.spawn("grpc-server", async move {
        tracing::info!(%addr, "starting gRPC server");
        tonic::transport::Server::builder()
            .add_service(query_service)
            .add_service(node_service)
            .add_service(block_service)
            .serve_with_shutdown(addr, signal.cancelled())
            .await?;
        Ok(())
    });
}

struct ApiContext {
    status: watch::Receiver<NodeStatus>,
    gateway: Channel,
    max_send_msg_size: usize,
    max_recv_msg_size: usize,
}

#[derive(serde::Deserialize)]
struct AbciQueryParams {
    path: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    prove: bool,
}

fn internal_error(err: impl ToString) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(
        ErrorCode::InternalError.code(),
        err.to_string(),
        None::<()>,
    )
}

fn invalid_params(err: impl ToString) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(
        ErrorCode::InvalidParams.code(),
        err.to_string(),
        None::<()>,
    )
}

/// Spawn the API server on the worker group. Queries are proxied through the
/// loopback gateway client to the in-process gRPC server; the application
/// contributes its own method module.
pub(crate) fn start_api_server(
    spawner: &WorkerSpawner,
    addr: SocketAddr,
    cfg: &GrpcConfig,
    app: Arc<dyn Application>,
    gateway: Channel,
    status: watch::Receiver<NodeStatus>,
    metrics: Option<Arc<MetricsRegistry>>,
) {
    let max_send_msg_size = cfg.effective_max_send_msg_size();
    let max_recv_msg_size = cfg.effective_max_recv_msg_size();
    let signal = spawner.signal();
    spawner.spawn("api-server", async move {
        let server = jsonrpsee::server::Server::builder().build(addr).await?;

        let mut module = RpcModule::new(ApiContext {
            status,
            gateway,
            max_send_msg_size,
            max_recv_msg_size,
        });

        module.register_async_method("node_status", |_params, ctx, _| async move {
            let status = ctx.status.borrow().clone();
            serde_json::to_value(&status).map_err(internal_error)
        })?;

        module.register_async_method("abci_query", |params, ctx, _| async move {
            let query: AbciQueryParams = params.parse()?;
            let data = hex::decode(query.data.trim_start_matches("0x")).map_err(invalid_params)?;

            let mut client = QueryServiceClient::new(ctx.gateway.clone())
                .max_decoding_message_size(ctx.max_recv_msg_size)
                .max_encoding_message_size(ctx.max_send_msg_size);
            let resp = client
                .abci_query(nodev1::AbciQueryRequest {
                    path: query.path,
                    data,
                    height: query.height,
                    prove: query.prove,
                })
                .await
                .map_err(internal_error)?
                .into_inner();

            Ok::<_, ErrorObjectOwned>(serde_json::json!({
                "code": resp.code,
                "log": resp.log,
                "key": hex::encode(&resp.key),
                "value": hex::encode(&resp.value),
                "height": resp.height,
            }))
        })?;

        module.register_method("health", |_params, _ctx, _| "ok")?;

        if let Some(metrics) = metrics {
            module.register_method("node_metrics", move |_params, _ctx, _| {
                metrics.encode_prometheus()
            })?;
        }

        module.merge(app.api_module())?;

        let handle = server.start(module);
        tracing::info!(%addr, "started API server");

        signal.cancelled().await;
        let _ = handle.stop();
        handle.stopped().await;
        Ok(())
    });
}
