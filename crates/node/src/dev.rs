//! A development consensus loop.
//!
//! Drives the application protocol against the multiplexer the way a real
//! engine would: pull the authoritative handle per request, finalize a block
//! per interval, commit, and publish the block event. Chain state (height
//! and declared app version) is persisted on shutdown and seeds the next
//! boot.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use meridian_abci::proto::abci::v2;
use meridian_mux::{AbciProvider, BlockEvent, BoxError, ConsensusNode, NodeContext, NodeLauncher};

const CHAIN_STATE_FILE: &str = "chain_state.yaml";

/// Persisted chain position, written on shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub height: u64,
    pub app_version: u64,
}

/// Read the persisted chain state, if any. Corrupt files are ignored so a
/// node can always boot.
pub fn load_chain_state(home: &Path) -> Option<ChainState> {
    let path = home.join("data").join(CHAIN_STATE_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_yaml::from_str(&content) {
        Ok(state) => Some(state),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring corrupt chain state");
            None
        }
    }
}

pub fn save_chain_state(home: &Path, state: &ChainState) -> Result<(), BoxError> {
    let dir = home.join("data");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(CHAIN_STATE_FILE), serde_yaml::to_string(state)?)?;
    Ok(())
}

/// Handle to the running dev consensus loop.
pub struct DevNode {
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    events: broadcast::Sender<BlockEvent>,
}

impl DevNode {
    /// Build the launcher handed to the multiplexer.
    ///
    /// The loop re-fetches its application handle from the provider on every
    /// block, which is what lets the multiplexer swap implementations
    /// between requests.
    pub fn launcher(block_interval: Duration) -> NodeLauncher {
        Arc::new(move |ctx: NodeContext| {
            Box::pin(async move {
                let persisted = load_chain_state(&ctx.home);
                let (mut height, mut app_version) = match persisted {
                    Some(state) => (state.height, state.app_version),
                    None => {
                        // handshake with the application to learn where the
                        // chain left off
                        let app = ctx.abci.get_app().await?;
                        let info = app.info(v2::InfoRequest {}).await?;
                        (info.last_block_height.max(0) as u64, info.app_version)
                    }
                };
                tracing::info!(height, app_version, "dev consensus starting");

                let (events_tx, _) = broadcast::channel(64);
                let (stop_tx, mut stop_rx) = watch::channel(false);
                let running = Arc::new(AtomicBool::new(true));

                let node = DevNode {
                    running: Arc::clone(&running),
                    stop_tx,
                    events: events_tx.clone(),
                };

                let abci = Arc::clone(&ctx.abci);
                let signal = ctx.signal.clone();
                let home = ctx.home.clone();
                let chain_id = ctx.chain_id.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(block_interval);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = signal.cancelled() => break,
                            _ = async {
                                loop {
                                    if *stop_rx.borrow() {
                                        return;
                                    }
                                    if stop_rx.changed().await.is_err() {
                                        return;
                                    }
                                }
                            } => break,
                            _ = interval.tick() => {
                                match produce_block(abci.as_ref(), &chain_id, height + 1, app_version).await {
                                    Ok(event) => {
                                        height = event.height;
                                        app_version = event.next_app_version;
                                        let _ = events_tx.send(event);
                                    }
                                    // the engine treats a failed handle fetch or
                                    // protocol call as a failure of this block
                                    // only; the next tick retries
                                    Err(err) => tracing::error!(error = %err, "block production failed"),
                                }
                            }
                        }
                    }

                    running.store(false, Ordering::SeqCst);
                    let state = ChainState {
                        height,
                        app_version,
                    };
                    match save_chain_state(&home, &state) {
                        Ok(()) => tracing::info!(height, app_version, "saved chain state"),
                        Err(err) => tracing::error!(error = %err, "failed to save chain state"),
                    }
                });

                Ok(Box::new(node) as Box<dyn ConsensusNode>)
            })
        })
    }
}

#[async_trait]
impl ConsensusNode for DevNode {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<(), BoxError> {
        self.stop_tx.send_replace(true);
        Ok(())
    }

    fn block_events(&self) -> broadcast::Receiver<BlockEvent> {
        self.events.subscribe()
    }
}

/// Run one block through the authoritative application.
async fn produce_block(
    abci: &dyn AbciProvider,
    chain_id: &str,
    height: u64,
    app_version: u64,
) -> Result<BlockEvent, BoxError> {
    let app = abci.get_app().await?;

    let hash = block_hash(chain_id, height, app_version);
    let time_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let resp = app
        .finalize_block(v2::FinalizeBlockRequest {
            hash: hash.clone(),
            height: height as i64,
            time_unix_ms,
            proposer_address: vec![],
            txs: vec![],
        })
        .await?;
    app.commit(v2::CommitRequest {}).await?;

    let next_app_version = resp
        .consensus_param_updates
        .map(|update| update.app_version)
        .unwrap_or(app_version);

    Ok(BlockEvent {
        height,
        hash,
        app_version,
        next_app_version,
    })
}

fn block_hash(chain_id: &str, height: u64, app_version: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(chain_id.as_bytes());
    hasher.update(height.to_be_bytes());
    hasher.update(app_version.to_be_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_abci::{Abci, AbciResult};
    use meridian_mux::MuxError;
    use tempfile::TempDir;

    #[test]
    fn chain_state_round_trips() {
        let dir = TempDir::new().unwrap();
        let state = ChainState {
            height: 42,
            app_version: 3,
        };

        save_chain_state(dir.path(), &state).unwrap();
        assert_eq!(load_chain_state(dir.path()).unwrap(), state);
    }

    #[test]
    fn missing_and_corrupt_chain_state_are_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_chain_state(dir.path()).is_none());

        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join(CHAIN_STATE_FILE), "not: [valid").unwrap();
        assert!(load_chain_state(dir.path()).is_none());
    }

    #[test]
    fn block_hash_is_deterministic() {
        assert_eq!(block_hash("a", 1, 1), block_hash("a", 1, 1));
        assert_ne!(block_hash("a", 1, 1), block_hash("a", 2, 1));
        assert_ne!(block_hash("a", 1, 1), block_hash("b", 1, 1));
    }

    /// Finalizes with a consensus param update at a fixed height.
    struct UpgradingApp {
        upgrade_at: i64,
        upgrade_to: u64,
    }

    #[async_trait]
    impl Abci for UpgradingApp {
        async fn echo(&self, req: v2::EchoRequest) -> AbciResult<v2::EchoResponse> {
            Ok(v2::EchoResponse { message: req.message })
        }

        async fn info(&self, _req: v2::InfoRequest) -> AbciResult<v2::InfoResponse> {
            Ok(v2::InfoResponse::default())
        }

        async fn init_chain(
            &self,
            _req: v2::InitChainRequest,
        ) -> AbciResult<v2::InitChainResponse> {
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
            req: v2::FinalizeBlockRequest,
        ) -> AbciResult<v2::FinalizeBlockResponse> {
            let consensus_param_updates = (req.height == self.upgrade_at)
                .then(|| v2::ConsensusParamUpdates {
                    app_version: self.upgrade_to,
                });
            Ok(v2::FinalizeBlockResponse {
                consensus_param_updates,
                ..Default::default()
            })
        }

        async fn commit(&self, _req: v2::CommitRequest) -> AbciResult<v2::CommitResponse> {
            Ok(v2::CommitResponse::default())
        }
    }

    struct StubProvider {
        app: Arc<UpgradingApp>,
    }

    #[async_trait]
    impl AbciProvider for StubProvider {
        async fn get_app(&self) -> Result<Arc<dyn Abci>, MuxError> {
            Ok(Arc::clone(&self.app) as Arc<dyn Abci>)
        }
    }

    #[tokio::test]
    async fn produce_block_follows_consensus_param_updates() {
        let provider = StubProvider {
            app: Arc::new(UpgradingApp {
                upgrade_at: 3,
                upgrade_to: 7,
            }),
        };

        let event = produce_block(&provider, "meridian-test", 2, 1).await.unwrap();
        assert_eq!(event.height, 2);
        assert_eq!(event.app_version, 1);
        assert_eq!(event.next_app_version, 1);

        let event = produce_block(&provider, "meridian-test", 3, 1).await.unwrap();
        assert_eq!(event.next_app_version, 7);
    }
}
