use crate::metrics::NodeMetrics;
use crate::monitor::Monitor;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 健康检查状态
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded(_))
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy(_))
    }
}

/// 健康检查接口
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthStatus;
    fn name(&self) -> &'static str;
    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// 节点是否还能接收新的 ingress
pub struct AdmissionCheck {
    monitor: Arc<Monitor>,
}

impl AdmissionCheck {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl HealthCheck for AdmissionCheck {
    async fn check(&self) -> HealthStatus {
        if self.monitor.can_accept_any() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy(format!(
                "not accepting new ingress: {:.2} cores available, {:.2} required",
                self.monitor.available_capacity(),
                self.monitor.max_cost()
            ))
        }
    }

    fn name(&self) -> &'static str {
        "admission"
    }
}

/// RTMP 协议错误率检查
pub struct ProtocolErrorCheck {
    metrics: NodeMetrics,
    max_error_rate: f64,
}

impl ProtocolErrorCheck {
    pub fn new(metrics: NodeMetrics, max_error_rate: f64) -> Self {
        Self {
            metrics,
            max_error_rate,
        }
    }
}

#[async_trait]
impl HealthCheck for ProtocolErrorCheck {
    async fn check(&self) -> HealthStatus {
        let snapshot = self.metrics.snapshot();
        let total = snapshot.connections_total;
        if total > 0 {
            let error_rate = snapshot.protocol_errors_total as f64 / total as f64;
            if error_rate > self.max_error_rate {
                return HealthStatus::Degraded(format!(
                    "RTMP protocol error rate too high: {:.2}% > {:.2}%",
                    error_rate * 100.0,
                    self.max_error_rate * 100.0
                ));
            }
        }
        HealthStatus::Healthy
    }

    fn name(&self) -> &'static str {
        "rtmp_protocol"
    }
}

/// 健康检查管理器
pub struct HealthChecker {
    checks: Vec<Box<dyn HealthCheck>>,
    last: Mutex<Option<(Instant, HashMap<String, HealthStatus>)>>,
    cache_duration: Duration,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            checks: Vec::new(),
            last: Mutex::new(None),
            cache_duration: Duration::from_secs(2),
        }
    }

    pub fn add_check(mut self, check: Box<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResult {
        let now = Instant::now();
        if let Some((at, results)) = self.last.lock().as_ref() {
            if now.duration_since(*at) < self.cache_duration {
                return build_result(results);
            }
        }

        let mut results = HashMap::new();
        for check in &self.checks {
            let status = match tokio::time::timeout(check.timeout(), check.check()).await {
                Ok(status) => status,
                Err(_) => {
                    HealthStatus::Unhealthy(format!("Health check '{}' timed out", check.name()))
                }
            };
            log::debug!("Health check '{}': {:?}", check.name(), status);
            results.insert(check.name().to_string(), status);
        }

        let result = build_result(&results);
        *self.last.lock() = Some((now, results));
        result
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn build_result(results: &HashMap<String, HealthStatus>) -> HealthCheckResult {
    let mut overall_status = HealthStatus::Healthy;
    for status in results.values() {
        match status {
            HealthStatus::Unhealthy(_) => {
                overall_status = HealthStatus::Unhealthy("One or more checks failed".to_string());
            }
            HealthStatus::Degraded(_) if overall_status.is_healthy() => {
                overall_status = HealthStatus::Degraded("One or more checks degraded".to_string());
            }
            _ => {}
        }
    }
    HealthCheckResult {
        overall_status,
        checks: results.clone(),
        timestamp_unix: chrono::Utc::now().timestamp(),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResult {
    pub overall_status: HealthStatus,
    pub checks: HashMap<String, HealthStatus>,
    pub timestamp_unix: i64,
}

impl HealthCheckResult {
    /// Degraded still serves traffic; only unhealthy turns the check red.
    pub fn is_serving(&self) -> bool {
        !self.overall_status.is_unhealthy()
    }
}

/// `GET /` health check and `GET /metrics` exposition.
pub struct Service {
    checker: Arc<HealthChecker>,
    metrics: NodeMetrics,
}

impl Service {
    pub fn new(checker: Arc<HealthChecker>, metrics: NodeMetrics) -> Self {
        Self { checker, metrics }
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let state = Arc::new(self);
        let make_service = make_service_fn(move |_| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(state.route(req).await) }
                }))
            }
        });
        let addr = SocketAddr::from(([0u16; 8], port));
        let server = Server::try_bind(&addr)?.serve(make_service);
        log::info!("health service Listening on http://{}", addr);
        server.await?;
        Ok(())
    }

    async fn route(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/") => {
                let result = self.checker.check_all().await;
                let status = if result.is_serving() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                match serde_json::to_vec(&result) {
                    Ok(body) => response(status, "application/json", body.into()),
                    Err(e) => response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string().into(),
                    ),
                }
            }
            (&Method::GET, "/metrics") => match self.metrics.gather_text() {
                Ok(text) => response(StatusCode::OK, "text/plain; version=0.0.4", text.into()),
                Err(e) => response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string().into(),
                ),
            },
            _ => response(StatusCode::NOT_FOUND, "text/plain", Body::empty()),
        }
    }
}

fn response(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut res = Response::new(body);
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockHealthCheck {
        name: &'static str,
        status: HealthStatus,
    }

    #[async_trait]
    impl HealthCheck for MockHealthCheck {
        async fn check(&self) -> HealthStatus {
            self.status.clone()
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    fn mock(name: &'static str, status: HealthStatus) -> Box<dyn HealthCheck> {
        Box::new(MockHealthCheck { name, status })
    }

    #[tokio::test]
    async fn test_health_checker_with_degraded() {
        let checker = HealthChecker::new()
            .add_check(mock("a", HealthStatus::Healthy))
            .add_check(mock("b", HealthStatus::Degraded("slow".to_string())));

        let result = checker.check_all().await;
        assert!(result.overall_status.is_degraded());
        assert!(result.is_serving());
        assert_eq!(result.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_health_checker_with_unhealthy() {
        let checker = HealthChecker::new()
            .add_check(mock("a", HealthStatus::Degraded("slow".to_string())))
            .add_check(mock("b", HealthStatus::Unhealthy("full".to_string())));

        let result = checker.check_all().await;
        assert!(result.overall_status.is_unhealthy());
        assert!(!result.is_serving());
    }

    #[tokio::test]
    async fn test_protocol_error_rate() {
        let metrics = NodeMetrics::new("NE_test").unwrap();
        let check = ProtocolErrorCheck::new(metrics.clone(), 0.1);
        for _ in 0..4 {
            metrics.connection_opened();
        }
        assert!(check.check().await.is_healthy());
        metrics.protocol_errors_total.inc();
        assert!(check.check().await.is_degraded());
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let metrics = NodeMetrics::new("NE_test").unwrap();
        let service = Service::new(Arc::new(HealthChecker::new()), metrics);
        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let res = service.route(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("xingress_connections_total"));
    }
}
