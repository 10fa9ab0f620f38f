use crate::connection::{Connection, ConnectionContext};
use anyhow::Result;
use futures::{Stream, StreamExt};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// RTMP listener. Connections are unauthenticated until they ask to publish.
pub struct Service {
    ctx: ConnectionContext,
    client_id: u64,
}

impl Service {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx, client_id: 0 }
    }

    pub async fn run(mut self, port: i32) {
        if port == crate::config::RTMP_DISABLED {
            log::info!("RTMP listener disabled");
            return;
        }
        if let Err(err) = self.handle_rtmp(port).await {
            log::error!("{}", err);
        }
    }

    async fn handle_rtmp(&mut self, port: i32) -> Result<()> {
        let addr = format!("[::]:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("Listening for RTMP connections on {}", addr);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&mut self, listener: TcpListener) {
        let incoming = futures::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await.map(|(stream, addr)| {
                log::debug!("Accepted connection from {}", addr);
                stream
            });
            Some((accepted, listener))
        });
        self.serve_incoming(Box::pin(incoming)).await
    }

    /// Spawns a connection for every accepted stream. A failed accept (e.g.
    /// out of file descriptors) is logged and retried after a pause. Returns
    /// once `incoming` ends.
    pub async fn serve_incoming<I, S>(&mut self, mut incoming: I)
    where
        I: Stream<Item = io::Result<S>> + Unpin,
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        while let Some(accepted) = incoming.next().await {
            match accepted {
                Ok(stream) => {
                    self.process(stream);
                    self.client_id += 1;
                }
                Err(e) => {
                    log::error!("Failed to accept RTMP connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    pub fn process<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        log::info!("New client connection: {}", &self.client_id);
        let id = self.client_id;
        let conn = Connection::new(id, stream, self.ctx.clone());

        tokio::spawn(async move {
            if let Err(err) = conn.run().await {
                if err.is_protocol_violation() {
                    log::warn!("Client {}: {}", id, err);
                } else {
                    log::info!("Client {}: {}", id, err);
                }
            }
        });
    }
}
