//! End-to-end lifecycle scenarios: boot, in-band version switches, and
//! teardown, driven through the public multiplexer surface with a mock
//! native application and a mock consensus node.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use meridian_abci::proto::abci::v2;
use meridian_abci::{Abci, AbciResult};
use meridian_mux::{
    AbciProvider, Appd, Application, AuthorityMode, BlockEvent, BoxError, ConsensusNode,
    Multiplexer, MuxError, NodeLauncher, Version, Versions,
};
use meridian_operations::config::NodeConfig;
use meridian_operations::MetricsRegistry;

const WAIT: Duration = Duration::from_secs(10);

/// Minimal native application: answers protocol calls with defaults and
/// records whether it was closed.
struct MockApp {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Abci for MockApp {
    async fn echo(&self, req: v2::EchoRequest) -> AbciResult<v2::EchoResponse> {
        Ok(v2::EchoResponse {
            message: req.message,
        })
    }

    async fn info(&self, _req: v2::InfoRequest) -> AbciResult<v2::InfoResponse> {
        Ok(v2::InfoResponse {
            data: "mock".to_string(),
            version: "0.0.0".to_string(),
            app_version: 1,
            last_block_height: 0,
            last_block_app_hash: vec![],
        })
    }

    async fn init_chain(&self, _req: v2::InitChainRequest) -> AbciResult<v2::InitChainResponse> {
        Ok(v2::InitChainResponse::default())
    }

    async fn query(&self, _req: v2::QueryRequest) -> AbciResult<v2::QueryResponse> {
        Ok(v2::QueryResponse::default())
    }

    async fn check_tx(&self, _req: v2::CheckTxRequest) -> AbciResult<v2::CheckTxResponse> {
        Ok(v2::CheckTxResponse::default())
    }

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

    async fn finalize_block(
        &self,
        _req: v2::FinalizeBlockRequest,
    ) -> AbciResult<v2::FinalizeBlockResponse> {
        Ok(v2::FinalizeBlockResponse::default())
    }

    async fn commit(&self, _req: v2::CommitRequest) -> AbciResult<v2::CommitResponse> {
        Ok(v2::CommitResponse::default())
    }
}

#[async_trait]
impl Application for MockApp {
    async fn close(&self) -> Result<(), BoxError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockNode {
    running: AtomicBool,
    events: broadcast::Sender<BlockEvent>,
}

#[async_trait]
impl ConsensusNode for MockNode {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<(), BoxError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn block_events(&self) -> broadcast::Receiver<BlockEvent> {
        self.events.subscribe()
    }
}

fn mock_launcher(launches: Arc<AtomicUsize>) -> NodeLauncher {
    Arc::new(move |_ctx| {
        let launches = Arc::clone(&launches);
        Box::pin(async move {
            launches.fetch_add(1, Ordering::SeqCst);
            let (events, _) = broadcast::channel(16);
            Ok(Box::new(MockNode {
                running: AtomicBool::new(true),
                events,
            }) as Box<dyn ConsensusNode>)
        })
    })
}

/// A shell script standing in for an embedded app binary: `start` blocks,
/// `migrate` drops a marker file next to the script.
fn fake_appd(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        "#!/bin/sh\ndir=\"$(dirname \"$0\")\"\ncase \"$1\" in\n  start) exec sleep 60 ;;\n  migrate) : > \"$dir/migrated\"; exit 0 ;;\nesac\nexit 2\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(home: &Path) -> NodeConfig {
    serde_yaml::from_str(&format!(
        r#"
home: "{}"
chain_id: meridian-test
"#,
        home.display()
    ))
    .unwrap()
}

struct Harness {
    mux: Arc<Multiplexer>,
    app_creations: Arc<AtomicUsize>,
    app_closed: Arc<AtomicBool>,
    node_launches: Arc<AtomicUsize>,
}

fn harness(cfg: NodeConfig, initial_app_version: u64, versions: Versions) -> Harness {
    let app_creations = Arc::new(AtomicUsize::new(0));
    let app_closed = Arc::new(AtomicBool::new(false));
    let node_launches = Arc::new(AtomicUsize::new(0));

    let creations = Arc::clone(&app_creations);
    let closed = Arc::clone(&app_closed);
    let app_creator: meridian_mux::AppCreator = Arc::new(move |_ctx| {
        creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockApp {
            closed: Arc::clone(&closed),
        }) as Arc<dyn Application>)
    });

    let mux = Multiplexer::new(
        cfg,
        vec!["meridiand".to_string(), "start".to_string()],
        initial_app_version,
        versions,
        app_creator,
        mock_launcher(Arc::clone(&node_launches)),
        Arc::new(MetricsRegistry::new()),
    )
    .unwrap();

    Harness {
        mux: Arc::new(mux),
        app_creations,
        app_closed,
        node_launches,
    }
}

async fn wait_for_mode(mux: &Arc<Multiplexer>, mode: AuthorityMode) {
    let mut status = mux.status();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.mode == mode))
        .await
        .expect("timed out waiting for authority mode")
        .unwrap();
}

#[tokio::test]
async fn boots_embedded_app_and_runs_pre_handlers() {
    let dir = TempDir::new().unwrap();
    let script = fake_appd(dir.path(), "appd-v2.sh");
    let version = Version::embedded(2, meridian_mux::AbciVersion::V1, Appd::new(&script))
        .with_pre_handlers(vec!["migrate".to_string()]);
    let appd = version.appd.clone().unwrap();

    let h = harness(test_config(dir.path()), 2, Versions::new(vec![version]));

    let mux = Arc::clone(&h.mux);
    let run = tokio::spawn(async move { mux.start().await });

    wait_for_mode(&h.mux, AuthorityMode::Embedded).await;
    assert!(appd.is_running().await);
    assert!(dir.path().join("migrated").exists());
    // no native app was constructed; the child is authoritative
    assert_eq!(h.app_creations.load(Ordering::SeqCst), 0);

    h.mux.initiate_shutdown();
    run.await.unwrap().unwrap();
    h.mux.stop().await;
    assert!(appd.is_stopped().await);
}

#[tokio::test]
async fn boots_native_app_when_registry_has_no_match() {
    let dir = TempDir::new().unwrap();
    let h = harness(test_config(dir.path()), 5, Versions::new(vec![]));

    let mux = Arc::clone(&h.mux);
    let run = tokio::spawn(async move { mux.start().await });

    wait_for_mode(&h.mux, AuthorityMode::Native).await;
    assert_eq!(h.app_creations.load(Ordering::SeqCst), 1);
    assert_eq!(h.node_launches.load(Ordering::SeqCst), 1);
    // the application database directory was prepared
    assert!(dir.path().join("data").is_dir());

    h.mux.initiate_shutdown();
    run.await.unwrap().unwrap();
    h.mux.stop().await;
    assert!(h.app_closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn switches_upward_across_embedded_versions() {
    let dir = TempDir::new().unwrap();
    let v2 = Version::embedded(
        2,
        meridian_mux::AbciVersion::V1,
        Appd::new(fake_appd(dir.path(), "appd-v2.sh")),
    );
    let v3 = Version::embedded(
        3,
        meridian_mux::AbciVersion::V2,
        Appd::new(fake_appd(dir.path(), "appd-v3.sh")),
    );
    let appd2 = v2.appd.clone().unwrap();
    let appd3 = v3.appd.clone().unwrap();

    let h = harness(test_config(dir.path()), 2, Versions::new(vec![v2, v3]));
    let mux = Arc::clone(&h.mux);
    let run = tokio::spawn(async move { mux.start().await });

    wait_for_mode(&h.mux, AuthorityMode::Embedded).await;
    assert!(appd2.is_running().await);

    // the chain advances to app version 3
    h.mux
        .observe_block(BlockEvent {
            height: 10,
            hash: vec![0xab],
            app_version: 3,
            next_app_version: 3,
        })
        .await;

    let _app = h.mux.get_app().await.unwrap();
    assert!(appd2.is_stopped().await);
    assert!(appd3.is_running().await);

    // a lower declared version is a no-op: switches only go upward
    h.mux
        .observe_block(BlockEvent {
            height: 11,
            hash: vec![0xcd],
            app_version: 2,
            next_app_version: 2,
        })
        .await;
    let _app = h.mux.get_app().await.unwrap();
    assert!(appd3.is_running().await);
    assert!(appd2.is_stopped().await);

    h.mux.initiate_shutdown();
    run.await.unwrap().unwrap();
    h.mux.stop().await;
    assert!(appd3.is_stopped().await);
}

#[tokio::test]
async fn advancing_past_registry_hands_over_to_native_app() {
    let dir = TempDir::new().unwrap();
    let v2 = Version::embedded(
        2,
        meridian_mux::AbciVersion::V2,
        Appd::new(fake_appd(dir.path(), "appd-v2.sh")),
    );
    let appd2 = v2.appd.clone().unwrap();

    let h = harness(test_config(dir.path()), 2, Versions::new(vec![v2]));
    let mux = Arc::clone(&h.mux);
    let run = tokio::spawn(async move { mux.start().await });

    wait_for_mode(&h.mux, AuthorityMode::Embedded).await;
    assert_eq!(h.app_creations.load(Ordering::SeqCst), 0);

    h.mux
        .observe_block(BlockEvent {
            height: 20,
            hash: vec![0xef],
            app_version: 3,
            next_app_version: 3,
        })
        .await;

    let _app = h.mux.get_app().await.unwrap();
    assert!(appd2.is_stopped().await);
    assert_eq!(h.app_creations.load(Ordering::SeqCst), 1);
    assert_eq!(h.mux.status().borrow().mode, AuthorityMode::Native);

    // steady state: no second construction
    let _app = h.mux.get_app().await.unwrap();
    assert_eq!(h.app_creations.load(Ordering::SeqCst), 1);

    h.mux.initiate_shutdown();
    run.await.unwrap().unwrap();
    h.mux.stop().await;
}

#[tokio::test]
async fn mismatched_abci_endpoints_fail_boot() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.proxy_app = "tcp://a:1".to_string();
    cfg.address = "tcp://b:1".to_string();

    let version = Version::embedded(
        2,
        meridian_mux::AbciVersion::V1,
        Appd::new(fake_appd(dir.path(), "appd-v2.sh")),
    );
    let h = harness(cfg, 2, Versions::new(vec![version]));

    let err = h.mux.start().await.unwrap_err();
    match err {
        MuxError::EndpointMismatch { client, server } => {
            assert_eq!(client, "tcp://a:1");
            assert_eq!(server, "tcp://b:1");
        }
        other => panic!("expected EndpointMismatch, got {other}"),
    }
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let h = harness(test_config(dir.path()), 1, Versions::new(vec![]));

    let mux = Arc::clone(&h.mux);
    let run = tokio::spawn(async move { mux.start().await });
    wait_for_mode(&h.mux, AuthorityMode::Native).await;

    h.mux.initiate_shutdown();
    run.await.unwrap().unwrap();

    h.mux.stop().await;
    h.mux.stop().await;
    assert_eq!(h.mux.status().borrow().mode, AuthorityMode::Unstarted);
}

#[tokio::test]
async fn grpc_only_mode_never_constructs_a_consensus_node() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.grpc_only = true;
    // ephemeral port; grpc-only forces the gRPC server on
    cfg.grpc.address = "127.0.0.1:0".to_string();

    let h = harness(cfg, 1, Versions::new(vec![]));
    let mux = Arc::clone(&h.mux);
    let run = tokio::spawn(async move { mux.start().await });

    wait_for_mode(&h.mux, AuthorityMode::Native).await;
    assert_eq!(h.node_launches.load(Ordering::SeqCst), 0);

    h.mux.initiate_shutdown();
    run.await.unwrap().unwrap();
    h.mux.stop().await;
}
