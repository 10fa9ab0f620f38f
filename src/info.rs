use crate::errors::{IngressError, Result};
use crate::ingress::{IngressInfo, IngressState};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;

pub const INGRESS_KEY_PREFIX: &str = "ingress:";
pub const STATE_KEY_PREFIX: &str = "ingress_state:";
pub const UPDATES_CHANNEL: &str = "ingress_updates";

/// Control-plane lookup and state reporting.
#[async_trait]
pub trait InfoService: Send + Sync + 'static {
    /// Resolves a stream key to its ingress; `IngressError::NotFound` when unknown.
    async fn get_ingress_info(&self, stream_key: &str) -> Result<IngressInfo>;

    async fn update_ingress_state(&self, ingress_id: &str, state: &IngressState) -> Result<()>;
}

#[derive(Serialize)]
struct StateUpdate<'a> {
    ingress_id: &'a str,
    state: &'a IngressState,
}

#[derive(Clone)]
pub struct RedisInfo {
    pub client: redis::Client,
}

impl RedisInfo {
    pub fn new(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl InfoService for RedisInfo {
    async fn get_ingress_info(&self, stream_key: &str) -> Result<IngressInfo> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = conn
            .get(format!("{}{}", INGRESS_KEY_PREFIX, stream_key))
            .await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(IngressError::NotFound {
                id: stream_key.to_string(),
            }),
        }
    }

    async fn update_ingress_state(&self, ingress_id: &str, state: &IngressState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let mut conn = self.client.get_async_connection().await?;
        conn.set::<_, _, ()>(format!("{}{}", STATE_KEY_PREFIX, ingress_id), &json)
            .await?;
        let update = serde_json::to_string(&StateUpdate { ingress_id, state })?;
        conn.publish::<_, _, ()>(UPDATES_CHANNEL, update).await?;
        Ok(())
    }
}

/// In-process info service: a fixed set of ingresses and a log of every
/// state update it received.
#[derive(Default)]
pub struct MemoryInfo {
    ingresses: Mutex<HashMap<String, IngressInfo>>,
    updates: Mutex<Vec<(String, IngressState)>>,
}

impl MemoryInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: IngressInfo) {
        self.ingresses.lock().insert(info.stream_key.clone(), info);
    }

    pub fn updates(&self) -> Vec<(String, IngressState)> {
        self.updates.lock().clone()
    }

    /// Last state reported for `ingress_id`.
    pub fn last_state(&self, ingress_id: &str) -> Option<IngressState> {
        self.updates
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == ingress_id)
            .map(|(_, state)| state.clone())
    }
}

#[async_trait]
impl InfoService for MemoryInfo {
    async fn get_ingress_info(&self, stream_key: &str) -> Result<IngressInfo> {
        self.ingresses
            .lock()
            .get(stream_key)
            .cloned()
            .ok_or_else(|| IngressError::NotFound {
                id: stream_key.to_string(),
            })
    }

    async fn update_ingress_state(&self, ingress_id: &str, state: &IngressState) -> Result<()> {
        self.updates
            .lock()
            .push((ingress_id.to_string(), state.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::{InputType, Status};

    #[tokio::test]
    async fn test_memory_info_lookup_and_updates() {
        let info = MemoryInfo::new();
        info.insert(IngressInfo::new("IN_1", "key", InputType::Rtmp, "room"));

        assert_eq!(info.get_ingress_info("key").await.unwrap().ingress_id, "IN_1");
        assert!(matches!(
            info.get_ingress_info("other").await,
            Err(IngressError::NotFound { .. })
        ));

        let mut state = IngressState::default();
        state.status = Status::EndpointBuffering;
        info.update_ingress_state("IN_1", &state).await.unwrap();
        assert_eq!(info.last_state("IN_1").unwrap().status, Status::EndpointBuffering);
        assert!(info.last_state("IN_2").is_none());
    }
}
