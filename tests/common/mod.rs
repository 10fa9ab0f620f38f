#![allow(dead_code)]

pub mod client;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use xingress::config::CpuCostConfig;
use xingress::cpu::CpuSampler;
use xingress::errors::{IngressError, Result};
use xingress::fuse::Fuse;
use xingress::info::MemoryInfo;
use xingress::ingress::{IngressInfo, IngressState, Status};
use xingress::metrics::NodeMetrics;
use xingress::pipeline::{InputSource, Pipeline, PipelineFactory, SessionParams, StateReporter};
use xingress::registry::{SessionRegistry, StreamSource};
use xingress::{ConnectionContext, Manager, ManagerHandle, Monitor, RpcServer};

pub struct FixedSampler {
    pub cpus: f64,
    pub idle: f64,
}

impl CpuSampler for FixedSampler {
    fn num_cpus(&self) -> f64 {
        self.cpus
    }

    fn sample_idle(&mut self) -> io::Result<f64> {
        Ok(self.idle)
    }
}

/// Pipeline double: collects RTMP bytes, honours end-of-stream unless told
/// not to, and can be finished from the test.
pub struct TestPipeline {
    pub info: IngressInfo,
    reporter: StateReporter,
    source: Mutex<Option<StreamSource>>,
    received: Mutex<Vec<u8>>,
    eos: Fuse,
    finish: Fuse,
    ignore_eos: bool,
    pub eos_calls: AtomicUsize,
}

impl TestPipeline {
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    /// Ends `run` regardless of end-of-stream handling.
    pub fn finish(&self) {
        self.finish.break_fuse();
    }
}

#[async_trait]
impl Pipeline for TestPipeline {
    async fn run(&self) -> IngressInfo {
        let taken = self.source.lock().take();
        match taken {
            Some(mut source) => {
                let mut published = false;
                let mut eos_seen = false;
                loop {
                    tokio::select! {
                        chunk = source.recv() => match chunk {
                            Some(chunk) => {
                                self.received.lock().extend_from_slice(&chunk);
                                if !published {
                                    published = true;
                                    self.reporter.set_status(Status::EndpointPublishing, None).await;
                                }
                            }
                            None => break,
                        },
                        _ = self.eos.wait(), if !eos_seen && !self.ignore_eos => {
                            eos_seen = true;
                            source.close();
                        }
                        _ = self.finish.wait() => break,
                    }
                }
            }
            None => {
                self.reporter
                    .set_status(Status::EndpointPublishing, None)
                    .await;
                let ignore_eos = self.ignore_eos;
                tokio::select! {
                    _ = self.eos.wait(), if !ignore_eos => {}
                    _ = self.finish.wait() => {}
                }
            }
        }
        self.reporter.info().await
    }

    fn send_eos(&self) {
        self.eos_calls.fetch_add(1, Ordering::SeqCst);
        self.eos.break_fuse();
    }
}

#[derive(Default)]
pub struct TestFactory {
    pub fail_build: bool,
    pub ignore_eos: bool,
    /// When set, `build` waits for a notification before returning.
    pub build_gate: Option<Arc<Notify>>,
    pub built: Mutex<Vec<Arc<TestPipeline>>>,
}

impl TestFactory {
    pub fn pipelines(&self) -> Vec<Arc<TestPipeline>> {
        self.built.lock().clone()
    }

    pub fn pipeline(&self, ingress_id: &str) -> Option<Arc<TestPipeline>> {
        self.built
            .lock()
            .iter()
            .find(|p| p.info.ingress_id == ingress_id)
            .cloned()
    }
}

#[async_trait]
impl PipelineFactory for TestFactory {
    async fn build(&self, params: SessionParams) -> Result<Arc<dyn Pipeline>> {
        if let Some(gate) = &self.build_gate {
            gate.notified().await;
        }
        if self.fail_build {
            return Err(IngressError::PipelineBuild {
                message: "encoder unavailable".to_string(),
            });
        }
        let source = match params.source {
            InputSource::Rtmp(source) => Some(source),
            InputSource::Whip { .. } => None,
        };
        let pipeline = Arc::new(TestPipeline {
            info: params.info,
            reporter: params.reporter,
            source: Mutex::new(source),
            received: Mutex::new(Vec::new()),
            eos: Fuse::new(),
            finish: Fuse::new(),
            ignore_eos: self.ignore_eos,
            eos_calls: AtomicUsize::new(0),
        });
        self.built.lock().push(pipeline.clone());
        Ok(pipeline)
    }
}

/// One ingress node wired with in-memory collaborators.
pub struct Node {
    pub info: Arc<MemoryInfo>,
    pub factory: Arc<TestFactory>,
    pub monitor: Arc<Monitor>,
    pub metrics: NodeMetrics,
    pub registry: Arc<SessionRegistry>,
    pub handle: ManagerHandle,
    pub rpc: RpcServer,
}

impl Node {
    pub fn start(idle: f64, factory: TestFactory) -> Self {
        let metrics = NodeMetrics::new("NE_test").unwrap();
        let monitor = Arc::new(
            Monitor::start(
                &CpuCostConfig::default(),
                FixedSampler { cpus: 8.0, idle },
                metrics.clone(),
            )
            .unwrap(),
        );
        let info = Arc::new(MemoryInfo::new());
        let factory = Arc::new(factory);
        let manager = Manager::new(monitor.clone(), factory.clone(), info.clone());
        let handle = manager.handle();
        tokio::spawn(manager.run());

        Self {
            info,
            factory,
            monitor,
            metrics,
            registry: Arc::new(SessionRegistry::new()),
            rpc: RpcServer::new(handle.clone()),
            handle,
        }
    }

    pub fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            registry: self.registry.clone(),
            info_service: self.info.clone(),
            manager_handle: self.handle.clone(),
            metrics: self.metrics.clone(),
            read_timeout: Duration::from_secs(5),
            sink_capacity: 64,
        }
    }

    /// Polls until `ingress_id` has reported `status`.
    pub async fn wait_for_status(&self, ingress_id: &str, status: Status) -> IngressState {
        wait_until(|| {
            self.info
                .last_state(ingress_id)
                .filter(|s| s.status == status)
        })
        .await
    }
}

/// Polls `f` every few milliseconds for up to five seconds.
pub async fn wait_until<T>(mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(v) = f() {
            return v;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
