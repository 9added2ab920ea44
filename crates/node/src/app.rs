//! A minimal key-value state machine serving as the native (latest)
//! application.
//!
//! Transactions are `key=value` strings. The special key `upgrade` schedules
//! a consensus-level app version update, which is how upgrade handovers are
//! exercised end to end. State is persisted to `<data_dir>/kv-store.yaml` on
//! close and reloaded on construction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use jsonrpsee::RpcModule;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use meridian_abci::proto::abci::v2;
use meridian_abci::{Abci, AbciError, AbciResult};
use meridian_mux::{AppContext, Application, BoxError, TraceWriter};

const STORE_FILE: &str = "kv-store.yaml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvState {
    height: i64,
    app_version: u64,
    #[serde(with = "hex_bytes")]
    app_hash: Vec<u8>,
    store: BTreeMap<String, String>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

pub struct KvApp {
    chain_id: String,
    store_path: PathBuf,
    trace: Option<TraceWriter>,
    state: Arc<RwLock<KvState>>,
}

impl KvApp {
    pub fn new(ctx: AppContext) -> Result<Self, BoxError> {
        let store_path = ctx.data_dir.join(STORE_FILE);
        let state = match std::fs::read_to_string(&store_path) {
            Ok(content) => serde_yaml::from_str(&content)
                .map_err(|e| format!("corrupt state at {}: {e}", store_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => KvState::default(),
            Err(err) => return Err(err.into()),
        };

        tracing::info!(
            height = state.height,
            app_version = state.app_version,
            "opened kv application state"
        );

        Ok(Self {
            chain_id: ctx.chain_id,
            store_path,
            trace: ctx.trace_writer,
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn compute_app_hash(store: &BTreeMap<String, String>) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for (key, value) in store {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        hasher.finalize().to_vec()
    }

    fn parse_tx(tx: &[u8]) -> Result<(String, String), String> {
        let text = std::str::from_utf8(tx).map_err(|_| "tx is not utf-8".to_string())?;
        match text.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err("tx must be key=value".to_string()),
        }
    }
}

#[async_trait]
impl Abci for KvApp {
    async fn echo(&self, req: v2::EchoRequest) -> AbciResult<v2::EchoResponse> {
        Ok(v2::EchoResponse {
            message: req.message,
        })
    }

    async fn info(&self, _req: v2::InfoRequest) -> AbciResult<v2::InfoResponse> {
        let state = self.state.read().await;
        Ok(v2::InfoResponse {
            data: "kv".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            app_version: state.app_version,
            last_block_height: state.height,
            last_block_app_hash: state.app_hash.clone(),
        })
    }

    async fn init_chain(&self, req: v2::InitChainRequest) -> AbciResult<v2::InitChainResponse> {
        if req.chain_id != self.chain_id {
            return Err(AbciError::App(format!(
                "chain id mismatch: expected {}, got {}",
                self.chain_id, req.chain_id
            )));
        }
        let mut state = self.state.write().await;
        state.app_version = req.initial_app_version;
        state.app_hash = Self::compute_app_hash(&state.store);
        Ok(v2::InitChainResponse {
            app_version: state.app_version,
            app_hash: state.app_hash.clone(),
        })
    }

    async fn query(&self, req: v2::QueryRequest) -> AbciResult<v2::QueryResponse> {
        let state = self.state.read().await;
        match req.path.as_str() {
            "store" => {
                let key = String::from_utf8_lossy(&req.data).to_string();
                match state.store.get(&key) {
                    Some(value) => Ok(v2::QueryResponse {
                        code: 0,
                        log: String::new(),
                        key: req.data,
                        value: value.clone().into_bytes(),
                        height: state.height,
                    }),
                    None => Ok(v2::QueryResponse {
                        code: 1,
                        log: "key not found".to_string(),
                        key: req.data,
                        value: vec![],
                        height: state.height,
                    }),
                }
            }
            other => Ok(v2::QueryResponse {
                code: 2,
                log: format!("unknown query path '{other}'"),
                key: vec![],
                value: vec![],
                height: state.height,
            }),
        }
    }

    async fn check_tx(&self, req: v2::CheckTxRequest) -> AbciResult<v2::CheckTxResponse> {
        match Self::parse_tx(&req.tx) {
            Ok(_) => Ok(v2::CheckTxResponse {
                code: 0,
                log: String::new(),
                gas_wanted: 1,
                gas_used: 1,
            }),
            Err(log) => Ok(v2::CheckTxResponse {
                code: 1,
                log,
                gas_wanted: 1,
                gas_used: 0,
            }),
        }
    }

    async fn prepare_proposal(
        &self,
        req: v2::PrepareProposalRequest,
    ) -> AbciResult<v2::PrepareProposalResponse> {
        let mut txs = Vec::new();
        let mut total = 0i64;
        for tx in req.txs {
            total += tx.len() as i64;
            if req.max_tx_bytes > 0 && total > req.max_tx_bytes {
                break;
            }
            txs.push(tx);
        }
        Ok(v2::PrepareProposalResponse { txs })
    }

    async fn process_proposal(
        &self,
        req: v2::ProcessProposalRequest,
    ) -> AbciResult<v2::ProcessProposalResponse> {
        let status = if req.txs.iter().all(|tx| Self::parse_tx(tx).is_ok()) {
            v2::ProposalStatus::Accept
        } else {
            v2::ProposalStatus::Reject
        };
        Ok(v2::ProcessProposalResponse {
            status: status as i32,
        })
    }

    async fn finalize_block(
        &self,
        req: v2::FinalizeBlockRequest,
    ) -> AbciResult<v2::FinalizeBlockResponse> {
        let mut state = self.state.write().await;
        let mut tx_results = Vec::with_capacity(req.txs.len());
        let mut upgrade_to = None;

        for tx in &req.txs {
            match Self::parse_tx(tx) {
                Ok((key, value)) => {
                    if key == "upgrade" {
                        match value.parse::<u64>() {
                            Ok(version) if version > state.app_version => {
                                upgrade_to = Some(version);
                            }
                            _ => {
                                tx_results.push(v2::ExecTxResult {
                                    code: 1,
                                    log: format!("invalid upgrade target '{value}'"),
                                    ..Default::default()
                                });
                                continue;
                            }
                        }
                    }
                    state.store.insert(key.clone(), value.clone());
                    tx_results.push(v2::ExecTxResult {
                        code: 0,
                        events: vec![v2::Event {
                            kind: "store".to_string(),
                            attributes: vec![v2::EventAttribute { key, value }],
                        }],
                        ..Default::default()
                    });
                }
                Err(log) => {
                    tx_results.push(v2::ExecTxResult {
                        code: 1,
                        log,
                        ..Default::default()
                    });
                }
            }
        }

        state.height = req.height;
        if let Some(version) = upgrade_to {
            state.app_version = version;
        }
        state.app_hash = Self::compute_app_hash(&state.store);

        if let Some(trace) = &self.trace {
            let line = format!(
                "finalize_block height={} txs={} app_hash={}\n",
                req.height,
                req.txs.len(),
                hex::encode(&state.app_hash)
            );
            if let Err(err) = trace.write(line.as_bytes()) {
                tracing::warn!(error = %err, "failed to write trace entry");
            }
        }

        Ok(v2::FinalizeBlockResponse {
            tx_results,
            events: vec![],
            consensus_param_updates: upgrade_to
                .map(|app_version| v2::ConsensusParamUpdates { app_version }),
            app_hash: state.app_hash.clone(),
        })
    }

    async fn commit(&self, _req: v2::CommitRequest) -> AbciResult<v2::CommitResponse> {
        Ok(v2::CommitResponse { retain_height: 0 })
    }
}

#[async_trait]
impl Application for KvApp {
    async fn close(&self) -> Result<(), BoxError> {
        let state = self.state.read().await;
        let content = serde_yaml::to_string(&*state)?;
        std::fs::write(&self.store_path, content)?;
        tracing::info!(
            height = state.height,
            path = %self.store_path.display(),
            "persisted kv application state"
        );
        Ok(())
    }

    fn api_module(&self) -> RpcModule<()> {
        let mut module = RpcModule::new(());
        let state = Arc::clone(&self.state);
        // a read-only convenience next to the generic abci_query
        if let Err(err) = module.register_async_method("kv_get", move |params, _ctx, _| {
            let state = Arc::clone(&state);
            async move {
                let key: String = params.one()?;
                let state = state.read().await;
                Ok::<_, jsonrpsee::types::ErrorObjectOwned>(state.store.get(&key).cloned())
            }
        }) {
            tracing::warn!(error = %err, "failed to register kv_get method");
        }
        module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_app(dir: &TempDir) -> KvApp {
        KvApp::new(AppContext {
            home: dir.path().to_path_buf(),
            data_dir: dir.path().to_path_buf(),
            db_backend: "memdb".to_string(),
            chain_id: "meridian-test".to_string(),
            trace_writer: None,
        })
        .unwrap()
    }

    fn finalize_request(height: i64, txs: Vec<&str>) -> v2::FinalizeBlockRequest {
        v2::FinalizeBlockRequest {
            hash: vec![],
            height,
            time_unix_ms: 0,
            proposer_address: vec![],
            txs: txs.into_iter().map(|tx| tx.as_bytes().to_vec()).collect(),
        }
    }

    #[tokio::test]
    async fn finalize_applies_txs_and_updates_app_hash() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);

        let resp = app
            .finalize_block(finalize_request(1, vec!["color=blue", "not a tx"]))
            .await
            .unwrap();
        assert_eq!(resp.tx_results[0].code, 0);
        assert_eq!(resp.tx_results[1].code, 1);
        assert!(!resp.app_hash.is_empty());

        let query = app
            .query(v2::QueryRequest {
                path: "store".to_string(),
                data: b"color".to_vec(),
                height: 0,
                prove: false,
            })
            .await
            .unwrap();
        assert_eq!(query.code, 0);
        assert_eq!(query.value, b"blue");
    }

    #[tokio::test]
    async fn upgrade_tx_schedules_consensus_param_update() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);

        let resp = app
            .finalize_block(finalize_request(1, vec!["upgrade=3"]))
            .await
            .unwrap();
        assert_eq!(resp.consensus_param_updates.unwrap().app_version, 3);

        let info = app.info(v2::InfoRequest {}).await.unwrap();
        assert_eq!(info.app_version, 3);

        // downgrades are rejected
        let resp = app
            .finalize_block(finalize_request(2, vec!["upgrade=2"]))
            .await
            .unwrap();
        assert_eq!(resp.tx_results[0].code, 1);
        assert!(resp.consensus_param_updates.is_none());
    }

    #[tokio::test]
    async fn state_round_trips_through_close() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);

        app.finalize_block(finalize_request(1, vec!["color=green"]))
            .await
            .unwrap();
        app.close().await.unwrap();

        let reopened = test_app(&dir);
        let info = reopened.info(v2::InfoRequest {}).await.unwrap();
        assert_eq!(info.last_block_height, 1);

        let query = reopened
            .query(v2::QueryRequest {
                path: "store".to_string(),
                data: b"color".to_vec(),
                height: 0,
                prove: false,
            })
            .await
            .unwrap();
        assert_eq!(query.value, b"green");
    }

    #[tokio::test]
    async fn init_chain_rejects_wrong_chain_id() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);

        let err = app
            .init_chain(v2::InitChainRequest {
                chain_id: "other-chain".to_string(),
                initial_height: 1,
                initial_app_version: 1,
                app_state: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AbciError::App(_)));
    }

    #[tokio::test]
    async fn prepare_proposal_respects_byte_budget() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);

        let resp = app
            .prepare_proposal(v2::PrepareProposalRequest {
                txs: vec![b"a=1".to_vec(), b"b=2".to_vec(), b"c=3".to_vec()],
                height: 1,
                max_tx_bytes: 6,
            })
            .await
            .unwrap();
        assert_eq!(resp.txs.len(), 2);
    }
}
