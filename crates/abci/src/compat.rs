//! Conversion between the legacy (v1) and current (v2) wire protocols.
//!
//! The legacy protocol carries no implicit chain context, so requests that
//! need a chain id or app version get them injected here. Responses are
//! lifted into the v2 shape: a v2 `FinalizeBlock` expands into
//! BeginBlock/DeliverTx/EndBlock/Commit against a v1 application, and the
//! pieces are reassembled by [`finalize_block_response`].

use crate::proto::abci::{v1, v2};

/// Build a v1 Info request with the chain context injected.
pub fn info_request(chain_id: &str, app_version: u64) -> v1::InfoRequest {
    v1::InfoRequest {
        chain_id: chain_id.to_string(),
        app_version,
    }
}

pub fn info_response(resp: v1::InfoResponse) -> v2::InfoResponse {
    v2::InfoResponse {
        data: resp.data,
        version: resp.version,
        app_version: resp.app_version,
        last_block_height: resp.last_block_height,
        last_block_app_hash: resp.last_block_app_hash,
    }
}

/// Build a v1 InitChain request. The v1 envelope requires an explicit app
/// version; when the v2 request does not name one, the injected version is
/// used instead.
pub fn init_chain_request(req: v2::InitChainRequest, app_version: u64) -> v1::InitChainRequest {
    let version = if req.initial_app_version == 0 {
        app_version
    } else {
        req.initial_app_version
    };
    v1::InitChainRequest {
        chain_id: req.chain_id,
        initial_height: req.initial_height,
        app_version: version,
        app_state: req.app_state,
    }
}

pub fn init_chain_response(resp: v1::InitChainResponse, app_version: u64) -> v2::InitChainResponse {
    v2::InitChainResponse {
        app_version,
        app_hash: resp.app_hash,
    }
}

pub fn query_request(req: v2::QueryRequest) -> v1::QueryRequest {
    v1::QueryRequest {
        path: req.path,
        data: req.data,
        height: req.height,
        prove: req.prove,
    }
}

pub fn query_response(resp: v1::QueryResponse) -> v2::QueryResponse {
    v2::QueryResponse {
        code: resp.code,
        log: resp.log,
        key: resp.key,
        value: resp.value,
        height: resp.height,
    }
}

pub fn check_tx_request(req: v2::CheckTxRequest) -> v1::CheckTxRequest {
    v1::CheckTxRequest {
        tx: req.tx,
        recheck: req.r#type == v2::CheckTxType::Recheck as i32,
    }
}

pub fn check_tx_response(resp: v1::CheckTxResponse) -> v2::CheckTxResponse {
    v2::CheckTxResponse {
        code: resp.code,
        log: resp.log,
        gas_wanted: resp.gas_wanted,
        gas_used: resp.gas_used,
    }
}

/// Build the v1 BeginBlock request for a v2 FinalizeBlock, injecting the
/// chain id and app version the legacy header demands.
pub fn begin_block_request(
    req: &v2::FinalizeBlockRequest,
    chain_id: &str,
    app_version: u64,
) -> v1::BeginBlockRequest {
    v1::BeginBlockRequest {
        hash: req.hash.clone(),
        header: Some(v1::Header {
            chain_id: chain_id.to_string(),
            height: req.height,
            time_unix_ms: req.time_unix_ms,
            app_version,
            proposer_address: req.proposer_address.clone(),
        }),
    }
}

pub fn event(ev: v1::Event) -> v2::Event {
    v2::Event {
        kind: ev.kind,
        attributes: ev
            .attributes
            .into_iter()
            .map(|attr| v2::EventAttribute {
                key: attr.key,
                value: attr.value,
            })
            .collect(),
    }
}

pub fn events(evs: Vec<v1::Event>) -> Vec<v2::Event> {
    evs.into_iter().map(event).collect()
}

pub fn exec_tx_result(resp: v1::DeliverTxResponse) -> v2::ExecTxResult {
    v2::ExecTxResult {
        code: resp.code,
        data: resp.data,
        log: resp.log,
        gas_wanted: resp.gas_wanted,
        gas_used: resp.gas_used,
        events: events(resp.events),
    }
}

/// A v1 EndBlock app-version update of zero means "no update".
pub fn consensus_param_updates(resp: &v1::EndBlockResponse) -> Option<v2::ConsensusParamUpdates> {
    if resp.app_version_update == 0 {
        return None;
    }
    Some(v2::ConsensusParamUpdates {
        app_version: resp.app_version_update,
    })
}

/// Assemble the v2 FinalizeBlock response from the four legacy round trips.
/// The app hash comes from Commit, which the legacy protocol only yields
/// after block execution.
pub fn finalize_block_response(
    begin: v1::BeginBlockResponse,
    delivers: Vec<v1::DeliverTxResponse>,
    end: v1::EndBlockResponse,
    commit: v1::CommitResponse,
) -> v2::FinalizeBlockResponse {
    let consensus_param_updates = consensus_param_updates(&end);
    let mut block_events = events(begin.events);
    block_events.extend(events(end.events));
    v2::FinalizeBlockResponse {
        tx_results: delivers.into_iter().map(exec_tx_result).collect(),
        events: block_events,
        consensus_param_updates,
        app_hash: commit.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(code: u32, log: &str) -> v1::DeliverTxResponse {
        v1::DeliverTxResponse {
            code,
            data: vec![],
            log: log.to_string(),
            gas_wanted: 10,
            gas_used: 7,
            events: vec![v1::Event {
                kind: "transfer".to_string(),
                attributes: vec![v1::EventAttribute {
                    key: "amount".to_string(),
                    value: "1".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn info_request_injects_chain_context() {
        let req = info_request("meridian-1", 3);
        assert_eq!(req.chain_id, "meridian-1");
        assert_eq!(req.app_version, 3);
    }

    #[test]
    fn init_chain_request_prefers_explicit_version() {
        let req = init_chain_request(
            v2::InitChainRequest {
                chain_id: "meridian-1".to_string(),
                initial_height: 1,
                initial_app_version: 2,
                app_state: vec![],
            },
            9,
        );
        assert_eq!(req.app_version, 2);

        let req = init_chain_request(
            v2::InitChainRequest {
                chain_id: "meridian-1".to_string(),
                initial_height: 1,
                initial_app_version: 0,
                app_state: vec![],
            },
            9,
        );
        assert_eq!(req.app_version, 9);
    }

    #[test]
    fn check_tx_recheck_flag_maps_to_type() {
        let req = check_tx_request(v2::CheckTxRequest {
            tx: vec![1],
            r#type: v2::CheckTxType::Recheck as i32,
        });
        assert!(req.recheck);

        let req = check_tx_request(v2::CheckTxRequest {
            tx: vec![1],
            r#type: v2::CheckTxType::New as i32,
        });
        assert!(!req.recheck);
    }

    #[test]
    fn begin_block_header_carries_injected_context() {
        let finalize = v2::FinalizeBlockRequest {
            hash: vec![0xaa],
            height: 42,
            time_unix_ms: 1_700_000_000_000,
            proposer_address: vec![0x01],
            txs: vec![],
        };
        let req = begin_block_request(&finalize, "meridian-1", 2);
        let header = req.header.unwrap();
        assert_eq!(header.chain_id, "meridian-1");
        assert_eq!(header.app_version, 2);
        assert_eq!(header.height, 42);
        assert_eq!(req.hash, vec![0xaa]);
    }

    #[test]
    fn end_block_zero_update_is_none() {
        let resp = v1::EndBlockResponse {
            app_version_update: 0,
            events: vec![],
        };
        assert!(consensus_param_updates(&resp).is_none());

        let resp = v1::EndBlockResponse {
            app_version_update: 3,
            events: vec![],
        };
        assert_eq!(consensus_param_updates(&resp).unwrap().app_version, 3);
    }

    #[test]
    fn finalize_response_assembles_all_round_trips() {
        let resp = finalize_block_response(
            v1::BeginBlockResponse {
                events: vec![v1::Event {
                    kind: "begin".to_string(),
                    attributes: vec![],
                }],
            },
            vec![deliver(0, "ok"), deliver(1, "bad")],
            v1::EndBlockResponse {
                app_version_update: 4,
                events: vec![v1::Event {
                    kind: "end".to_string(),
                    attributes: vec![],
                }],
            },
            v1::CommitResponse {
                data: vec![0xde, 0xad],
                retain_height: 5,
            },
        );

        assert_eq!(resp.tx_results.len(), 2);
        assert_eq!(resp.tx_results[0].code, 0);
        assert_eq!(resp.tx_results[1].log, "bad");
        assert_eq!(resp.tx_results[0].events[0].kind, "transfer");
        assert_eq!(resp.app_hash, vec![0xde, 0xad]);
        assert_eq!(resp.consensus_param_updates.unwrap().app_version, 4);
        let kinds: Vec<_> = resp.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["begin", "end"]);
    }
}
