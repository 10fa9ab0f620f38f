use crate::errors::Result;
use crate::info::InfoService;
use crate::ingress::{IngressInfo, IngressState, ResourceId, Status};
use crate::registry::StreamSource;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where a session's media comes from.
pub enum InputSource {
    /// Container byte-stream produced by an RTMP publish session.
    Rtmp(StreamSource),
    /// Externally terminated WHIP session.
    Whip { resource_id: ResourceId },
}

impl InputSource {
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            InputSource::Rtmp(_) => None,
            InputSource::Whip { resource_id } => Some(resource_id),
        }
    }
}

pub struct SessionParams {
    pub info: IngressInfo,
    pub source: InputSource,
    pub reporter: StateReporter,
}

#[async_trait]
pub trait PipelineFactory: Send + Sync + 'static {
    async fn build(&self, params: SessionParams) -> Result<Arc<dyn Pipeline>>;
}

/// A built media pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Runs until natural completion or until a requested end-of-stream has
    /// been flushed, returning the final ingress snapshot.
    async fn run(&self) -> IngressInfo;

    /// Requests a graceful end-of-stream. Must not block.
    fn send_eos(&self);
}

struct ReporterState {
    info: IngressInfo,
    last_sent: Option<IngressState>,
}

/// Publishes one session's state transitions upstream, in order, once each.
#[derive(Clone)]
pub struct StateReporter {
    info_service: Arc<dyn InfoService>,
    inner: Arc<Mutex<ReporterState>>,
}

impl StateReporter {
    pub fn new(info_service: Arc<dyn InfoService>, info: IngressInfo) -> Self {
        Self {
            info_service,
            inner: Arc::new(Mutex::new(ReporterState {
                info,
                last_sent: None,
            })),
        }
    }

    pub async fn info(&self) -> IngressInfo {
        self.inner.lock().await.info.clone()
    }

    /// Moves the session to `status` and publishes it.
    pub async fn set_status(&self, status: Status, error: Option<String>) -> IngressInfo {
        let mut inner = self.inner.lock().await;
        inner.info.set_status(status, error);
        self.send(&mut inner).await;
        inner.info.clone()
    }

    /// Adopts `info` as the current snapshot and publishes its state.
    pub async fn report(&self, info: IngressInfo) -> IngressInfo {
        let mut inner = self.inner.lock().await;
        inner.info = info;
        self.send(&mut inner).await;
        inner.info.clone()
    }

    async fn send(&self, inner: &mut ReporterState) {
        let state = &inner.info.state;
        if let Some(last) = &inner.last_sent {
            if last.same_transition(state) {
                return;
            }
        }
        let ingress_id = &inner.info.ingress_id;
        match state.status {
            Status::EndpointError => {
                log::warn!("ingress {} failed: {}", ingress_id, state.error)
            }
            status => log::info!("ingress {} state {:?}", ingress_id, status),
        }
        if let Err(e) = self
            .info_service
            .update_ingress_state(ingress_id, state)
            .await
        {
            log::error!("failed to report state of ingress {}: {}", ingress_id, e);
        }
        inner.last_sent = Some(state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::MemoryInfo;
    use crate::ingress::InputType;

    #[tokio::test]
    async fn test_reporter_publishes_each_transition_once() {
        let info_service = Arc::new(MemoryInfo::new());
        let reporter = StateReporter::new(
            info_service.clone(),
            IngressInfo::new("IN_1", "key", InputType::Rtmp, "room"),
        );

        reporter.set_status(Status::EndpointBuffering, None).await;
        reporter.set_status(Status::EndpointBuffering, None).await;
        reporter.set_status(Status::EndpointPublishing, None).await;
        let last = reporter
            .set_status(Status::EndpointError, Some("boom".into()))
            .await;

        let statuses: Vec<Status> = info_service
            .updates()
            .into_iter()
            .map(|(_, s)| s.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                Status::EndpointBuffering,
                Status::EndpointPublishing,
                Status::EndpointError
            ]
        );
        assert!(last.state.started_at > 0);
        assert!(last.state.ended_at > 0);
        assert_eq!(last.state.error, "boom");
    }
}
