use crate::errors::{IngressError, Result};
use crate::handler::{Handler, IngressRpc};
use crate::info::InfoService;
use crate::ingress::{
    DeleteIngressRequest, DeleteWhipResourceRequest, IngressId, IngressInfo, IngressState,
    InputType, ResourceId, UpdateIngressRequest,
};
use crate::monitor::Monitor;
use crate::pipeline::{InputSource, PipelineFactory, StateReporter};
use crate::transport::{
    self, ManagerHandle, ManagerMessage, ManagerReceiver, Responder,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Owns every running ingress handler on this node.
pub struct Manager {
    handle: ManagerHandle,
    incoming: ManagerReceiver,
    monitor: Arc<Monitor>,
    factory: Arc<dyn PipelineFactory>,
    info_service: Arc<dyn InfoService>,
    handlers: HashMap<IngressId, Arc<Handler>>,
    resources: HashMap<ResourceId, IngressId>,
}

impl Manager {
    pub fn new(
        monitor: Arc<Monitor>,
        factory: Arc<dyn PipelineFactory>,
        info_service: Arc<dyn InfoService>,
    ) -> Self {
        let (handle, incoming) = mpsc::unbounded_channel();
        Self {
            handle,
            incoming,
            monitor,
            factory,
            info_service,
            handlers: HashMap::new(),
            resources: HashMap::new(),
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    fn process_message(&mut self, message: ManagerMessage) -> Result<()> {
        match message {
            ManagerMessage::StartIngress {
                info,
                source,
                responder,
            } => {
                let res = self.start_ingress(info, source);
                if let Err(e) = &res {
                    if e.should_log_error() {
                        log::error!("failed to start ingress: {}", e);
                    } else {
                        log::warn!("ingress not started: {}", e);
                    }
                }
                respond(responder, res)?;
            }
            ManagerMessage::GetHandler {
                ingress_id,
                responder,
            } => {
                respond(responder, self.handlers.get(&ingress_id).cloned())?;
            }
            ManagerMessage::GetHandlerByResource {
                resource_id,
                responder,
            } => {
                let handler = self
                    .resources
                    .get(&resource_id)
                    .and_then(|id| self.handlers.get(id))
                    .cloned();
                respond(responder, handler)?;
            }
            ManagerMessage::IngressEnded { info, resource_id } => {
                if let Some(resource_id) = resource_id {
                    self.resources.remove(&resource_id);
                }
                self.handlers.remove(&info.ingress_id);
                self.monitor.ingress_ended(&info);
                log::info!(
                    "ingress {} ended with {:?}, {} still running",
                    info.ingress_id,
                    info.state.status,
                    self.handlers.len()
                );
            }
        }
        Ok(())
    }

    fn start_ingress(&mut self, info: IngressInfo, source: InputSource) -> Result<()> {
        if self.handlers.contains_key(&info.ingress_id) {
            return Err(IngressError::AlreadyPublishing {
                stream_key: info.stream_key,
            });
        }
        if !self.monitor.try_admit(&info) {
            return Err(IngressError::CapacityRejected {
                kind: info.input_type.to_string(),
            });
        }

        let reporter = StateReporter::new(self.info_service.clone(), info.clone());
        let handler = Arc::new(Handler::new(info.clone(), self.factory.clone(), reporter));
        let resource_id = source.resource_id().map(str::to_string);
        if let Some(resource_id) = &resource_id {
            self.resources
                .insert(resource_id.clone(), info.ingress_id.clone());
        }
        self.handlers
            .insert(info.ingress_id.clone(), handler.clone());
        self.monitor.ingress_started(&info);
        log::info!(
            "starting {} ingress {} for room {}",
            info.input_type,
            info.ingress_id,
            info.room_name
        );

        let handle = self.handle.clone();
        tokio::spawn(async move {
            let info = handler.handle_ingress(source).await;
            let _ = handle.send(ManagerMessage::IngressEnded { info, resource_id });
        });
        Ok(())
    }

    pub async fn run(mut self) {
        while let Some(message) = self.incoming.recv().await {
            if let Err(err) = self.process_message(message) {
                log::error!("{}", err);
            };
        }
    }
}

fn respond<P>(responder: Responder<P>, value: P) -> Result<()> {
    responder.send(value).map_err(|_| IngressError::Internal {
        message: "Failed to send response".to_string(),
    })
}

/// Starts an ingress for an externally terminated WHIP session.
pub async fn handle_whip_publish(
    handle: &ManagerHandle,
    info_service: &dyn InfoService,
    stream_key: &str,
    resource_id: ResourceId,
) -> Result<IngressInfo> {
    let info = info_service.get_ingress_info(stream_key).await?;
    if info.input_type != InputType::Whip {
        return Err(IngressError::UnsupportedInput {
            id: info.ingress_id,
            kind: info.input_type.to_string(),
        });
    }
    transport::start_ingress(handle, info.clone(), InputSource::Whip { resource_id }).await?;
    Ok(info)
}

/// Routes control-plane calls to the handler that owns the ingress.
#[derive(Clone)]
pub struct RpcServer {
    handle: ManagerHandle,
}

impl RpcServer {
    pub fn new(handle: ManagerHandle) -> Self {
        Self { handle }
    }

    async fn handler(&self, ingress_id: &str) -> Result<Arc<Handler>> {
        transport::get_handler(&self.handle, ingress_id)
            .await?
            .ok_or_else(|| IngressError::NotFound {
                id: ingress_id.to_string(),
            })
    }
}

#[async_trait]
impl IngressRpc for RpcServer {
    async fn update_ingress(
        &self,
        ctx: &CancellationToken,
        req: UpdateIngressRequest,
    ) -> Result<IngressState> {
        let handler = self.handler(&req.ingress_id).await?;
        handler.update_ingress(ctx, req).await
    }

    async fn delete_ingress(
        &self,
        ctx: &CancellationToken,
        req: DeleteIngressRequest,
    ) -> Result<IngressState> {
        let handler = self.handler(&req.ingress_id).await?;
        handler.delete_ingress(ctx, req).await
    }

    async fn delete_whip_resource(
        &self,
        ctx: &CancellationToken,
        req: DeleteWhipResourceRequest,
    ) -> Result<()> {
        let handler = transport::get_handler_by_resource(&self.handle, &req.resource_id)
            .await?
            .ok_or_else(|| IngressError::NotFound {
                id: req.resource_id.clone(),
            })?;
        if !req.stream_key.is_empty() && handler.info().stream_key != req.stream_key {
            return Err(IngressError::InvalidRequest {
                message: format!(
                    "resource {} does not belong to stream key {}",
                    req.resource_id, req.stream_key
                ),
            });
        }
        handler.delete_whip_resource(ctx, req).await
    }
}
