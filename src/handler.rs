//! Per-ingress lifecycle: build the pipeline, run it, honour cancellation,
//! report every state transition upstream.

use crate::errors::{IngressError, Result};
use crate::fuse::Fuse;
use crate::ingress::{
    DeleteIngressRequest, DeleteWhipResourceRequest, IngressInfo, IngressState, Status,
    UpdateIngressRequest,
};
use crate::pipeline::{InputSource, PipelineFactory, SessionParams, StateReporter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Running,
    Stopping,
    Done,
}

/// Operations the control plane invokes on a node.
#[async_trait]
pub trait IngressRpc: Send + Sync {
    async fn update_ingress(
        &self,
        ctx: &CancellationToken,
        req: UpdateIngressRequest,
    ) -> Result<IngressState>;

    async fn delete_ingress(
        &self,
        ctx: &CancellationToken,
        req: DeleteIngressRequest,
    ) -> Result<IngressState>;

    async fn delete_whip_resource(
        &self,
        ctx: &CancellationToken,
        req: DeleteWhipResourceRequest,
    ) -> Result<()>;
}

pub struct Handler {
    info: IngressInfo,
    factory: Arc<dyn PipelineFactory>,
    reporter: StateReporter,
    kill: Fuse,
    done: Fuse,
    phase: Mutex<Phase>,
    final_info: Mutex<Option<IngressInfo>>,
}

impl Handler {
    pub fn new(info: IngressInfo, factory: Arc<dyn PipelineFactory>, reporter: StateReporter) -> Self {
        Self {
            info,
            factory,
            reporter,
            kill: Fuse::new(),
            done: Fuse::new(),
            phase: Mutex::new(Phase::Building),
            final_info: Mutex::new(None),
        }
    }

    pub fn ingress_id(&self) -> &str {
        &self.info.ingress_id
    }

    pub fn info(&self) -> &IngressInfo {
        &self.info
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    pub fn is_done(&self) -> bool {
        self.done.is_broken()
    }

    /// Drives the session to completion and returns the final snapshot.
    /// `done` is broken on every exit path.
    pub async fn handle_ingress(&self, source: InputSource) -> IngressInfo {
        let final_info = self.run_session(source).await;
        *self.final_info.lock() = Some(final_info.clone());
        self.set_phase(Phase::Done);
        self.done.break_fuse();
        final_info
    }

    async fn run_session(&self, source: InputSource) -> IngressInfo {
        let ingress_id = self.ingress_id();
        if self.kill.is_broken() {
            log::info!("ingress {} cancelled before the pipeline was built", ingress_id);
            return self.reporter.set_status(Status::EndpointInactive, None).await;
        }

        let params = SessionParams {
            info: self.info.clone(),
            source,
            reporter: self.reporter.clone(),
        };
        let pipeline = match self.factory.build(params).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::error!("failed to build pipeline for ingress {}: {}", ingress_id, e);
                return self
                    .reporter
                    .set_status(Status::EndpointError, Some(e.to_string()))
                    .await;
            }
        };

        self.set_phase(Phase::Running);
        self.reporter.set_status(Status::EndpointBuffering, None).await;

        let mut runner = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run().await })
        };

        let mut watching_kill = true;
        let result = loop {
            tokio::select! {
                _ = self.kill.wait(), if watching_kill => {
                    watching_kill = false;
                    self.set_phase(Phase::Stopping);
                    log::info!("ingress {} stopping", ingress_id);
                    pipeline.send_eos();
                }
                res = &mut runner => break res,
            }
        };

        let mut final_info = match result {
            Ok(info) => info,
            Err(e) => {
                let mut info = self.reporter.info().await;
                info.set_status(Status::EndpointError, Some(format!("pipeline task failed: {}", e)));
                info
            }
        };
        if !final_info.state.status.is_terminal() {
            final_info.set_status(Status::EndpointInactive, None);
        }
        self.reporter.report(final_info).await
    }

    /// Requests a graceful stop. Idempotent.
    pub fn kill(&self) {
        if self.kill.break_fuse() {
            log::info!("ingress {} kill requested", self.ingress_id());
        }
    }

    /// Kills the session and waits for its final state. If `ctx` is cancelled
    /// first the call fails and the session carries on toward completion.
    pub async fn kill_and_return_state(&self, ctx: &CancellationToken) -> Result<IngressInfo> {
        self.kill();
        tokio::select! {
            biased;
            _ = self.done.wait() => self.final_info.lock().clone().ok_or_else(|| {
                IngressError::Internal {
                    message: format!("ingress {} finished without a final state", self.ingress_id()),
                }
            }),
            _ = ctx.cancelled() => Err(IngressError::Cancelled),
        }
    }

    /// Resolves once the session routine has exited.
    pub async fn wait_done(&self) {
        self.done.wait().await
    }
}

#[async_trait]
impl IngressRpc for Handler {
    async fn update_ingress(
        &self,
        ctx: &CancellationToken,
        _req: UpdateIngressRequest,
    ) -> Result<IngressState> {
        Ok(self.kill_and_return_state(ctx).await?.state)
    }

    async fn delete_ingress(
        &self,
        ctx: &CancellationToken,
        _req: DeleteIngressRequest,
    ) -> Result<IngressState> {
        Ok(self.kill_and_return_state(ctx).await?.state)
    }

    async fn delete_whip_resource(
        &self,
        ctx: &CancellationToken,
        _req: DeleteWhipResourceRequest,
    ) -> Result<()> {
        self.kill_and_return_state(ctx).await.map(|_| ())
    }
}
