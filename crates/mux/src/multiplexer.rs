//! The multiplexer: supervisory state and lifecycle for serving a chain
//! across multiple application-protocol versions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tonic::transport::{Channel, Endpoint};

use meridian_abci::Abci;
use meridian_operations::config::NodeConfig;
use meridian_operations::{wait_for_signal, MetricsRegistry, WorkerGroup, WorkerSpawner};

use crate::errors::MuxError;
use crate::node::{
    AbciProvider, AppContext, AppCreator, Application, AuthorityMode, BlockEvent, ConsensusNode,
    NodeContext, NodeLauncher, NodeStatus,
};
use crate::proxy::{RemoteAbciClientV1, RemoteAbciClientV2};
use crate::servers;
use crate::trace::{open_trace_writer, TraceWriter};
use crate::version::{AbciVersion, Version, VersionError, Versions};

/// Which implementation is authoritative. At most one at any instant; the
/// sum type makes the invariant structural.
enum Authority {
    Unstarted,
    Native(Arc<dyn Application>),
    Embedded { version: Version, conn: Channel },
}

impl Authority {
    fn mode(&self) -> AuthorityMode {
        match self {
            Authority::Unstarted => AuthorityMode::Unstarted,
            Authority::Native(_) => AuthorityMode::Native,
            Authority::Embedded { .. } => AuthorityMode::Embedded,
        }
    }
}

/// Mutable supervisory state, guarded by a single exclusive lock.
struct MuxState {
    /// The chain's currently declared application version.
    app_version: u64,
    /// Advisory, updated from block finalization; the handle picker reads
    /// `app_version` only.
    next_app_version: u64,
    height: u64,
    authority: Authority,
    cm_node: Option<Box<dyn ConsensusNode>>,
    /// Loopback client the API server uses to reach the in-process gRPC
    /// server.
    gateway_conn: Option<Channel>,
    trace_writer: Option<TraceWriter>,
    /// Whether the in-process gRPC/API servers have been wired up.
    servers_online: bool,
    /// Effective gRPC enablement; forced on in grpc-only mode.
    grpc_enable: bool,
}

/// Manages multiple versions of applications and coordinates their
/// lifecycle: version switching between embedded and native applications,
/// connection setup, and cleanup for all owned services and resources.
pub struct Multiplexer {
    cfg: NodeConfig,
    chain_id: String,
    /// Outer process argv, fed through each version's argv transformer.
    program_args: Vec<String>,
    versions: Versions,
    app_creator: AppCreator,
    node_launcher: NodeLauncher,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<MuxState>,
    /// Present once `start` has run; later transitions use it to add
    /// workers (deferred server enablement).
    spawner: StdMutex<Option<WorkerSpawner>>,
    status_tx: watch::Sender<NodeStatus>,
    block_tx: broadcast::Sender<BlockEvent>,
    latest_block_tx: watch::Sender<Option<BlockEvent>>,
}

impl Multiplexer {
    /// Construct the supervisory state. Validates the registry; performs no
    /// I/O.
    pub fn new(
        cfg: NodeConfig,
        program_args: Vec<String>,
        initial_app_version: u64,
        versions: Versions,
        app_creator: AppCreator,
        node_launcher: NodeLauncher,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, MuxError> {
        versions.validate(true)?;

        let chain_id = cfg.chain_id.clone();
        let grpc_enable = cfg.grpc.enable || cfg.grpc_only;
        let (status_tx, _) = watch::channel(NodeStatus {
            chain_id: chain_id.clone(),
            height: 0,
            app_version: initial_app_version,
            next_app_version: initial_app_version,
            mode: AuthorityMode::Unstarted,
        });
        let (block_tx, _) = broadcast::channel(128);
        let (latest_block_tx, _) = watch::channel(None);

        Ok(Self {
            cfg,
            chain_id,
            program_args,
            versions,
            app_creator,
            node_launcher,
            metrics,
            state: Mutex::new(MuxState {
                app_version: initial_app_version,
                next_app_version: initial_app_version,
                height: 0,
                authority: Authority::Unstarted,
                cm_node: None,
                gateway_conn: None,
                trace_writer: None,
                servers_online: false,
                grpc_enable,
            }),
            spawner: StdMutex::new(None),
            status_tx,
            block_tx,
            latest_block_tx,
        })
    }

    /// Subscribe to version-state snapshots.
    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribe to observed block events.
    pub fn block_events(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_tx.subscribe()
    }

    /// Drive the boot sequence and block until shutdown.
    ///
    /// Boots the initial application, the consensus node (unless grpc-only),
    /// and the in-process servers (unless an embedded app is authoritative),
    /// then waits on the worker group. The first worker error cancels the
    /// shared scope and is returned.
    pub async fn start(self: &Arc<Self>) -> Result<(), MuxError> {
        let group = WorkerGroup::new();
        let spawner = group.spawner();
        *self
            .spawner
            .lock()
            .expect("multiplexer spawner lock poisoned") = Some(spawner.clone());

        // listen for quit signals so the process can gracefully exit
        {
            let signal = spawner.signal();
            let canceller = spawner.clone();
            spawner.spawn("signal-listener", async move {
                tokio::select! {
                    name = wait_for_signal() => {
                        tracing::info!(signal = name, "received shutdown signal");
                        canceller.cancel();
                    }
                    _ = signal.cancelled() => {}
                }
                Ok(())
            });
        }

        self.metrics
            .mux
            .emit_server_info(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        // start the underlying application, either native or embedded
        self.start_app().await?;

        if self.cfg.grpc_only {
            tracing::info!("starting node in gRPC only mode; consensus node is disabled");
        } else {
            tracing::info!("starting consensus node");
            self.start_consensus_node(&spawner).await?;
        }

        let native_app = {
            let st = self.state.lock().await;
            match &st.authority {
                Authority::Native(app) => Some(app.clone()),
                _ => None,
            }
        };

        match native_app {
            None => {
                // the embedded child serves its own gRPC; nothing to wire here
                tracing::debug!("using embedded app, not continuing with grpc or api servers");
            }
            Some(app) => {
                let mut st = self.state.lock().await;
                self.enable_grpc_and_api_servers_locked(&mut st, app)?;
            }
        }

        group.wait().await.map_err(|e| MuxError::Worker(e.to_string()))
    }

    /// Request a cooperative shutdown of the worker group. `start` returns
    /// once every worker has wound down.
    pub fn initiate_shutdown(&self) {
        if let Some(spawner) = self
            .spawner
            .lock()
            .expect("multiplexer spawner lock poisoned")
            .as_ref()
        {
            spawner.cancel();
        }
    }

    /// Record a finalized block: the declared app version moves the handle
    /// picker, the rest feeds status, metrics, and block subscribers.
    pub async fn observe_block(&self, event: BlockEvent) {
        let mut st = self.state.lock().await;
        st.height = event.height;
        st.app_version = event.app_version;
        st.next_app_version = event.next_app_version;
        self.metrics
            .mux
            .record_block(event.height, event.app_version, event.next_app_version);
        self.publish_status(&st);
        self.latest_block_tx.send_replace(Some(event.clone()));
        let _ = self.block_tx.send(event);
    }

    /// Ordered, best-effort teardown. Each step logs its own failure and
    /// continues; nothing is returned. Idempotent.
    pub async fn stop(&self) {
        tracing::info!("stopping multiplexer");
        let mut st = self.state.lock().await;

        if let Some(node) = st.cm_node.take() {
            if node.is_running() {
                tracing::info!("stopping consensus node");
                if let Err(err) = node.stop().await {
                    tracing::error!(error = %err, "failed to stop consensus node");
                }
            }
        }

        let native = match &st.authority {
            Authority::Native(app) => Some(app.clone()),
            _ => None,
        };
        if let Some(app) = native {
            tracing::info!("stopping native app");
            if let Err(err) = app.close().await {
                tracing::error!(error = %err, "failed to close native app");
            }
            st.authority = Authority::Unstarted;
        }

        if let Err(err) = self.stop_embedded_locked(&mut st).await {
            tracing::error!(error = %err, "failed to stop embedded app");
        }

        if st.gateway_conn.take().is_some() {
            tracing::info!("closing loopback gRPC connection");
        }

        if let Some(trace_writer) = st.trace_writer.take() {
            tracing::info!("closing trace writer");
            if let Err(err) = trace_writer.close() {
                tracing::error!(error = %err, "failed to close trace writer");
            }
        }

        self.publish_status(&st);
    }

    /// Start whichever application the initial app version resolves to.
    async fn start_app(&self) -> Result<(), MuxError> {
        let mut st = self.state.lock().await;
        match self.versions.get_for_app_version(st.app_version) {
            Err(VersionError::NoVersionFound) => {
                // no version found, assume latest
                self.start_native_app_locked(&mut st)?;
                Ok(())
            }
            Err(err) => Err(MuxError::Lifecycle {
                component: "application".to_string(),
                reason: format!("failed to get app for version {}: {err}", st.app_version),
            }),
            Ok(version) => {
                let version = version.clone();
                self.start_embedded_locked(&mut st, version).await
            }
        }
    }

    fn start_native_app_locked(
        &self,
        st: &mut MuxState,
    ) -> Result<Arc<dyn Application>, MuxError> {
        let trace_writer = open_trace_writer(self.cfg.trace_store())?;
        st.trace_writer = trace_writer.clone();

        let data_dir = self.cfg.data_dir();
        std::fs::create_dir_all(&data_dir)?;

        tracing::debug!(app_version = st.app_version, "creating native app");
        let app = (self.app_creator)(AppContext {
            home: PathBuf::from(&self.cfg.home),
            data_dir,
            db_backend: self.cfg.db_backend.clone(),
            chain_id: self.chain_id.clone(),
            trace_writer,
        })
        .map_err(|err| MuxError::Lifecycle {
            component: "native app".to_string(),
            reason: err.to_string(),
        })?;

        st.authority = Authority::Native(app.clone());
        self.publish_status(st);
        Ok(app)
    }

    /// Switch to (or boot) an embedded application.
    async fn start_embedded_locked(
        &self,
        st: &mut MuxState,
        target: Version,
    ) -> Result<(), MuxError> {
        tracing::info!(
            app_version = target.app_version,
            abci_version = %target.abci_version,
            "starting embedded app"
        );
        let Some(appd) = target.appd.clone() else {
            return Err(MuxError::Switch(format!(
                "appd is nil for version {}",
                target.app_version
            )));
        };

        // stop the existing app version if one is currently running
        self.stop_embedded_locked(st)
            .await
            .map_err(|err| MuxError::Switch(format!("failed to stop active version: {err}")))?;

        if appd.is_stopped().await {
            for pre_handler in &target.pre_handlers {
                let mut cmd = appd.create_exec_command(pre_handler);
                match cmd.status().await {
                    Ok(status) if status.success() => {}
                    Ok(status) => tracing::warn!(
                        pre_handler = %pre_handler,
                        %status,
                        "pre-handler failed, continuing without successful pre-handler"
                    ),
                    Err(err) => tracing::warn!(
                        pre_handler = %pre_handler,
                        error = %err,
                        "pre-handler failed to run, continuing without successful pre-handler"
                    ),
                }
            }

            let program_args = remove_start(&self.program_args);
            let args = target.get_start_args(&program_args);
            tracing::info!(app_version = target.app_version, ?args, "starting app for version");
            appd.start(args).await.map_err(|err| {
                MuxError::Switch(format!(
                    "failed to start app for version {}: {err}",
                    target.app_version
                ))
            })?;

            if appd.is_stopped().await {
                return Err(MuxError::Switch(format!(
                    "app for version {} failed to start",
                    target.app_version
                )));
            }
        }

        let conn = self.dial_remote_conn()?;
        st.authority = Authority::Embedded {
            version: target,
            conn,
        };
        self.metrics.mux.record_switch();
        self.publish_status(st);
        Ok(())
    }

    /// Stop the embedded application if one is authoritative. Clears the
    /// authority, dropping the wire connection with it.
    async fn stop_embedded_locked(&self, st: &mut MuxState) -> Result<(), MuxError> {
        let version = match &st.authority {
            Authority::Embedded { version, .. } => version.clone(),
            _ => return Ok(()),
        };

        if let Some(appd) = version.appd.clone() {
            if appd.is_running().await {
                tracing::info!(
                    active_app_version = version.app_version,
                    "stopping embedded app for version"
                );
                appd.stop().await.map_err(|err| {
                    MuxError::Switch(format!(
                        "failed to stop embedded app for version {}: {err}",
                        version.app_version
                    ))
                })?;
            }
        }

        tracing::debug!("dropping ABCI wire connection");
        st.authority = Authority::Unstarted;
        self.publish_status(st);
        Ok(())
    }

    /// Dial the loopback wire connection to the embedded child.
    ///
    /// The consensus engine dials `proxy_app`; the child binds `address`.
    /// These must agree, or requests would go to a port nobody serves.
    fn dial_remote_conn(&self) -> Result<Channel, MuxError> {
        let client_addr = &self.cfg.proxy_app;
        let server_addr = &self.cfg.address;
        if client_addr != server_addr {
            return Err(MuxError::EndpointMismatch {
                client: client_addr.clone(),
                server: server_addr.clone(),
            });
        }

        let addr = server_addr
            .strip_prefix("tcp://")
            .unwrap_or(server_addr);
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))?;
        let conn = endpoint.connect_lazy();
        tracing::info!(address = addr, "initialized remote app client");
        Ok(conn)
    }

    /// Launch the consensus engine, handing it this multiplexer as the
    /// application-protocol provider, and spawn the block-event pump.
    async fn start_consensus_node(
        self: &Arc<Self>,
        spawner: &WorkerSpawner,
    ) -> Result<(), MuxError> {
        let ctx = NodeContext {
            abci: self.clone() as Arc<dyn AbciProvider>,
            chain_id: self.chain_id.clone(),
            home: PathBuf::from(&self.cfg.home),
            signal: spawner.signal(),
        };
        let node = (self.node_launcher)(ctx).await.map_err(|err| MuxError::Lifecycle {
            component: "consensus node".to_string(),
            reason: err.to_string(),
        })?;

        let mut events = node.block_events();
        self.state.lock().await.cm_node = Some(node);

        let this = Arc::clone(self);
        let signal = spawner.signal();
        spawner.spawn("block-event-listener", async move {
            loop {
                tokio::select! {
                    _ = signal.cancelled() => return Ok(()),
                    event = events.recv() => match event {
                        Ok(event) => this.observe_block(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "block event listener lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    },
                }
            }
        });
        Ok(())
    }

    /// Wire up the in-process gRPC and API servers for a native application.
    /// No-op when already online or when gRPC is disabled.
    fn enable_grpc_and_api_servers_locked(
        &self,
        st: &mut MuxState,
        app: Arc<dyn Application>,
    ) -> Result<(), MuxError> {
        if st.servers_online {
            return Ok(());
        }
        if !st.grpc_enable {
            // the API depends on the gRPC server; config validation already
            // rejected api.enable without grpc.enable
            st.servers_online = true;
            return Ok(());
        }

        let spawner = self
            .spawner
            .lock()
            .expect("multiplexer spawner lock poisoned")
            .clone()
            .ok_or_else(|| MuxError::Lifecycle {
                component: "grpc server".to_string(),
                reason: "multiplexer is not started".to_string(),
            })?;

        let grpc_addr = self.cfg.grpc.address.parse().map_err(|err| {
            MuxError::Config(format!(
                "invalid grpc.address '{}': {err}",
                self.cfg.grpc.address
            ))
        })?;

        // loopback client for the gRPC gateway; limits follow the server
        let gateway = Endpoint::from_shared(format!("http://{}", self.cfg.grpc.address))?
            .connect_lazy();
        st.gateway_conn = Some(gateway.clone());

        tracing::debug!("registering services and starting grpc server");
        servers::start_grpc_server(
            &spawner,
            grpc_addr,
            &self.cfg.grpc,
            app.clone(),
            self.status_tx.subscribe(),
            self.latest_block_tx.subscribe(),
            self.block_tx.clone(),
        );

        if self.cfg.api.enable {
            let api_addr = self.cfg.api.address.parse().map_err(|err| {
                MuxError::Config(format!(
                    "invalid api.address '{}': {err}",
                    self.cfg.api.address
                ))
            })?;
            let metrics = self
                .cfg
                .telemetry
                .enabled
                .then(|| Arc::clone(&self.metrics));
            tracing::debug!("starting api server");
            servers::start_api_server(
                &spawner,
                api_addr,
                &self.cfg.grpc,
                app,
                gateway,
                self.status_tx.subscribe(),
                metrics,
            );
        }

        st.servers_online = true;
        Ok(())
    }

    fn publish_status(&self, st: &MuxState) {
        self.status_tx.send_replace(NodeStatus {
            chain_id: self.chain_id.clone(),
            height: st.height,
            app_version: st.app_version,
            next_app_version: st.next_app_version,
            mode: st.authority.mode(),
        });
    }
}

#[async_trait]
impl AbciProvider for Multiplexer {
    /// Return the authoritative application-protocol handle for the next
    /// consensus request. The hot path: on the steady state this is a lock,
    /// a registry lookup, and a handle clone.
    async fn get_app(&self) -> Result<Arc<dyn Abci>, MuxError> {
        let mut st = self.state.lock().await;
        tracing::debug!(
            app_version = st.app_version,
            next_app_version = st.next_app_version,
            "getting app"
        );

        let target = match self.versions.get_for_app_version(st.app_version) {
            Ok(version) => Some(version.clone()),
            Err(VersionError::NoVersionFound) => None,
            Err(err) => return Err(err.into()),
        };

        let Some(target) = target else {
            // the native implementation is authoritative; if we were running
            // an embedded binary, stop it before starting the native app
            self.stop_embedded_locked(&mut st)
                .await
                .map_err(|err| MuxError::Switch(format!("failed to stop embedded app: {err}")))?;

            if !matches!(st.authority, Authority::Native(_)) {
                tracing::info!(app_version = st.app_version, "using latest app");
                let app = self.start_native_app_locked(&mut st)?;

                // the consensus node already exists; only the in-process
                // servers were deferred while an embedded app was serving
                self.enable_grpc_and_api_servers_locked(&mut st, app)?;
            }

            let Authority::Native(app) = &st.authority else {
                return Err(MuxError::Switch(
                    "native app missing after start".to_string(),
                ));
            };
            return Ok(app.clone() as Arc<dyn Abci>);
        };

        // switch only upward: equal or lower target versions are no-ops
        let needs_switch = match &st.authority {
            Authority::Embedded { version, .. } => target.app_version > version.app_version,
            _ => true,
        };
        if needs_switch {
            tracing::info!(
                app_version = target.app_version,
                abci_version = %target.abci_version,
                chain_id = %self.chain_id,
                "using remote ABCI connection"
            );
            self.start_embedded_locked(&mut st, target).await?;
        }

        let Authority::Embedded { version, conn } = &st.authority else {
            return Err(MuxError::Switch(
                "embedded app missing after start".to_string(),
            ));
        };
        let app: Arc<dyn Abci> = match version.abci_version {
            AbciVersion::V1 => Arc::new(RemoteAbciClientV1::new(
                conn.clone(),
                self.chain_id.clone(),
                st.app_version,
            )),
            AbciVersion::V2 => Arc::new(RemoteAbciClientV2::new(conn.clone())),
        };
        Ok(app)
    }
}

/// Remove the binary name and the first literal `start` token from argv.
pub fn remove_start(args: &[String]) -> Vec<String> {
    if args.is_empty() {
        return Vec::new();
    }
    let mut removed_start = false;
    args[1..]
        .iter()
        .filter(|arg| {
            if !removed_start && arg.as_str() == "start" {
                removed_start = true;
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn remove_start_drops_binary_and_first_start() {
        let out = remove_start(&args(&["meridiand", "start", "--home", "/tmp"]));
        assert_eq!(out, args(&["--home", "/tmp"]));
    }

    #[test]
    fn remove_start_keeps_later_start_tokens() {
        let out = remove_start(&args(&["meridiand", "start", "--mode", "start"]));
        assert_eq!(out, args(&["--mode", "start"]));
    }

    #[test]
    fn remove_start_handles_missing_start() {
        let out = remove_start(&args(&["meridiand", "--home", "/tmp"]));
        assert_eq!(out, args(&["--home", "/tmp"]));
    }

    #[test]
    fn remove_start_handles_empty_argv() {
        assert!(remove_start(&[]).is_empty());
    }

    #[test]
    fn transformed_args_contain_neither_binary_nor_start() {
        let version = crate::version::Version::embedded(
            2,
            AbciVersion::V1,
            crate::appd::Appd::new("/usr/local/bin/meridiand-v2"),
        );
        let outer = args(&["meridiand", "start", "--home", "/tmp"]);
        let out = version.get_start_args(&remove_start(&outer));
        assert!(!out.contains(&"start".to_string()));
        assert!(!out.contains(&"meridiand".to_string()));
    }
}
