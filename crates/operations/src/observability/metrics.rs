//! Prometheus-compatible metrics collection.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Build-info labels attached to the server-info gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServerInfoLabels {
    pub name: String,
    pub version: String,
}

/// Multiplexer-level metrics.
pub struct MuxMetrics {
    /// Constant gauge carrying build-info labels.
    pub server_info: Family<ServerInfoLabels, Gauge>,
    /// Chain-declared app version currently served.
    pub app_version: Gauge,
    /// Advisory next app version from block finalization.
    pub next_app_version: Gauge,
    /// Latest observed block height.
    pub block_height: Gauge,
    /// Total application version switches performed.
    pub version_switches: Counter,
}

impl Default for MuxMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxMetrics {
    pub fn new() -> Self {
        Self {
            server_info: Family::default(),
            app_version: Gauge::default(),
            next_app_version: Gauge::default(),
            block_height: Gauge::default(),
            version_switches: Counter::default(),
        }
    }

    /// Emit the server-info gauge with build-info labels.
    pub fn emit_server_info(&self, name: &str, version: &str) {
        self.server_info
            .get_or_create(&ServerInfoLabels {
                name: name.to_string(),
                version: version.to_string(),
            })
            .set(1);
    }

    /// Record the version state observed from a finalized block.
    pub fn record_block(&self, height: u64, app_version: u64, next_app_version: u64) {
        self.block_height.set(height as i64);
        self.app_version.set(app_version as i64);
        self.next_app_version.set(next_app_version as i64);
    }

    /// Record one application switch.
    pub fn record_switch(&self) {
        self.version_switches.inc();
    }
}

/// Central metrics registry for the node.
pub struct MetricsRegistry {
    registry: Registry,
    /// Multiplexer-level metrics.
    pub mux: MuxMetrics,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let mux = MuxMetrics::new();

        registry.register(
            "meridian_server_info",
            "Build information of the running server",
            mux.server_info.clone(),
        );

        registry.register(
            "meridian_app_version",
            "Chain-declared app version currently served",
            mux.app_version.clone(),
        );

        registry.register(
            "meridian_next_app_version",
            "Advisory next app version from block finalization",
            mux.next_app_version.clone(),
        );

        registry.register(
            "meridian_block_height",
            "Latest observed block height",
            mux.block_height.clone(),
        );

        registry.register(
            "meridian_version_switches",
            "Total application version switches performed",
            mux.version_switches.clone(),
        );

        Self { registry, mux }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode_prometheus(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            return String::from("# Error encoding metrics\n");
        }
        buffer
    }

    /// Get a reference to the underlying registry for custom metric
    /// registration.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_registered_metrics() {
        let registry = MetricsRegistry::new();
        let encoded = registry.encode_prometheus();

        assert!(encoded.contains("meridian_app_version"));
        assert!(encoded.contains("meridian_block_height"));
        assert!(encoded.contains("meridian_version_switches"));
    }

    #[test]
    fn server_info_carries_labels() {
        let registry = MetricsRegistry::new();
        registry.mux.emit_server_info("meridiand", "0.1.0");

        let encoded = registry.encode_prometheus();
        assert!(encoded.contains("meridiand"));
        assert!(encoded.contains("0.1.0"));
    }

    #[test]
    fn record_block_updates_gauges() {
        let registry = MetricsRegistry::new();
        registry.mux.record_block(42, 2, 3);

        assert_eq!(registry.mux.block_height.get(), 42);
        assert_eq!(registry.mux.app_version.get(), 2);
        assert_eq!(registry.mux.next_app_version.get(), 3);
    }
}
