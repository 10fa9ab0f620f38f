use crate::errors::Result;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

const NAMESPACE: &str = "xingress";

/// 节点指标
///
/// Every instance owns its own registry so independent nodes (and tests) never
/// collide on metric registration.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,

    pub cpu_load: Gauge,
    pub available: IntGauge,
    pub requests: IntGaugeVec,
    pub admissions_total: IntCounterVec,

    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub protocol_errors_total: IntCounter,
    pub tags_forwarded_total: IntCounterVec,
    pub tags_dropped_total: IntCounterVec,
}

fn opts(name: &str, help: &str, node_id: &str) -> Opts {
    Opts::new(name, help)
        .namespace(NAMESPACE)
        .const_label("node_id", node_id)
}

impl NodeMetrics {
    pub fn new(node_id: &str) -> Result<Self> {
        let registry = Registry::new();

        let cpu_load = Gauge::with_opts(opts("node_cpu_load", "Node CPU load, percent", node_id))?;
        let available = IntGauge::with_opts(opts(
            "available",
            "1 when the node can accept any new ingress",
            node_id,
        ))?;
        let requests = IntGaugeVec::new(
            opts("requests", "Ingress sessions currently running", node_id),
            &["type", "transcoding"],
        )?;
        let admissions_total = IntCounterVec::new(
            opts("admissions_total", "Admission decisions", node_id),
            &["type", "result"],
        )?;
        let connections_total = IntCounter::with_opts(opts(
            "connections_total",
            "RTMP connections accepted",
            node_id,
        ))?;
        let connections_active = IntGauge::with_opts(opts(
            "connections_active",
            "RTMP connections currently open",
            node_id,
        ))?;
        let protocol_errors_total = IntCounter::with_opts(opts(
            "protocol_errors_total",
            "RTMP connections closed by a protocol violation",
            node_id,
        ))?;
        let tags_forwarded_total = IntCounterVec::new(
            opts("tags_forwarded_total", "FLV tags written to sinks", node_id),
            &["kind"],
        )?;
        let tags_dropped_total = IntCounterVec::new(
            opts("tags_dropped_total", "Media tags dropped as undecodable or unencodable", node_id),
            &["kind"],
        )?;

        registry.register(Box::new(cpu_load.clone()))?;
        registry.register(Box::new(available.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(admissions_total.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(protocol_errors_total.clone()))?;
        registry.register(Box::new(tags_forwarded_total.clone()))?;
        registry.register(Box::new(tags_dropped_total.clone()))?;

        Ok(Self {
            registry,
            cpu_load,
            available,
            requests,
            admissions_total,
            connections_total,
            connections_active,
            protocol_errors_total,
            tags_forwarded_total,
            tags_dropped_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric in this registry.
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.get(),
            connections_active: self.connections_active.get(),
            protocol_errors_total: self.protocol_errors_total.get(),
            available: self.available.get() == 1,
            cpu_load: self.cpu_load.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: i64,
    pub protocol_errors_total: u64,
    pub available: bool,
    pub cpu_load: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        // two instances must not clash on registration
        let a = NodeMetrics::new("NE_a").unwrap();
        let b = NodeMetrics::new("NE_b").unwrap();
        a.connection_opened();
        assert_eq!(a.snapshot().connections_active, 1);
        assert_eq!(b.snapshot().connections_active, 0);
    }

    #[test]
    fn test_gather_text() {
        let metrics = NodeMetrics::new("NE_test").unwrap();
        metrics.requests.with_label_values(&["rtmp", "true"]).inc();
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("xingress_requests"));
        assert!(text.contains("node_id=\"NE_test\""));
    }
}
