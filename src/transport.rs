use crate::errors::Result;
use crate::handler::Handler;
use crate::ingress::{IngressId, IngressInfo, ResourceId};
use crate::pipeline::InputSource;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub type Responder<P> = oneshot::Sender<P>;

pub enum ManagerMessage {
    /// Admit and start a session for `info`.
    StartIngress {
        info: IngressInfo,
        source: InputSource,
        responder: Responder<Result<()>>,
    },
    GetHandler {
        ingress_id: IngressId,
        responder: Responder<Option<Arc<Handler>>>,
    },
    GetHandlerByResource {
        resource_id: ResourceId,
        responder: Responder<Option<Arc<Handler>>>,
    },
    IngressEnded {
        info: IngressInfo,
        resource_id: Option<ResourceId>,
    },
}

pub type ManagerHandle = mpsc::UnboundedSender<ManagerMessage>;
pub(crate) type ManagerReceiver = mpsc::UnboundedReceiver<ManagerMessage>;

/// Sends `StartIngress` and waits for the admission result.
pub async fn start_ingress(
    handle: &ManagerHandle,
    info: IngressInfo,
    source: InputSource,
) -> Result<()> {
    let (responder, response) = oneshot::channel();
    handle.send(ManagerMessage::StartIngress {
        info,
        source,
        responder,
    })?;
    response.await?
}

pub async fn get_handler(handle: &ManagerHandle, ingress_id: &str) -> Result<Option<Arc<Handler>>> {
    let (responder, response) = oneshot::channel();
    handle.send(ManagerMessage::GetHandler {
        ingress_id: ingress_id.to_string(),
        responder,
    })?;
    Ok(response.await?)
}

pub async fn get_handler_by_resource(
    handle: &ManagerHandle,
    resource_id: &str,
) -> Result<Option<Arc<Handler>>> {
    let (responder, response) = oneshot::channel();
    handle.send(ManagerMessage::GetHandlerByResource {
        resource_id: resource_id.to_string(),
        responder,
    })?;
    Ok(response.await?)
}
