use crate::codec::flv::writer::Writer;
use crate::codec::flv::{AudioData, VideoData};
use crate::codec::FlvError;
use crate::error::Error;
use crate::info::InfoService;
use crate::ingress::InputType;
use crate::metrics::NodeMetrics;
use crate::packet::Packet;
use crate::pipeline::InputSource;
use crate::registry::{Registration, SessionRegistry, StreamSink};
use crate::rtmp::{Event, Protocol};
use crate::transport::{self, ManagerHandle};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::{BytesCodec, Framed};

const REJECT_CODE: &str = "NetStream.Publish.BadName";

/// Shared by every connection a listener accepts.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<SessionRegistry>,
    pub info_service: Arc<dyn InfoService>,
    pub manager_handle: ManagerHandle,
    pub metrics: NodeMetrics,
    pub read_timeout: Duration,
    pub sink_capacity: usize,
}

struct Streaming {
    registration: Registration,
    writer: Writer<Arc<StreamSink>>,
}

enum State {
    AwaitingHandshake,
    AwaitingPublish,
    Streaming(Streaming),
    Closed,
}

enum Input {
    Data(Option<io::Result<BytesMut>>),
    ForcedClose,
}

pub struct Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    id: u64,
    bytes_stream: Framed<S, BytesCodec>,
    ctx: ConnectionContext,
    proto: Protocol,
    state: State,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, stream: S, ctx: ConnectionContext) -> Self {
        ctx.metrics.connection_opened();
        Self {
            id,
            bytes_stream: Framed::new(stream, BytesCodec::new()),
            ctx,
            proto: Protocol::new(),
            state: State::AwaitingHandshake,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        let res = self.serve().await;
        if let Err(e) = &res {
            if e.is_protocol_violation() {
                self.ctx.metrics.protocol_errors_total.inc();
            }
        }
        self.state = State::Closed;
        res
    }

    async fn serve(&mut self) -> Result<(), Error> {
        loop {
            let forced_close = match &self.state {
                State::Closed => return Ok(()),
                State::Streaming(streaming) => Some(streaming.registration.sink().clone()),
                _ => None,
            };

            let read = timeout(self.ctx.read_timeout, self.bytes_stream.next());
            let input = match forced_close {
                Some(sink) => tokio::select! {
                    res = read => Input::Data(res?),
                    _ = sink.closed() => Input::ForcedClose,
                },
                None => Input::Data(read.await?),
            };

            match input {
                Input::Data(Some(Ok(data))) => {
                    let events = self.proto.handle_bytes(&data)?;
                    if let State::AwaitingHandshake = self.state {
                        if self.proto.handshake_completed() {
                            self.state = State::AwaitingPublish;
                        }
                    }
                    for event in events {
                        self.handle_event(event).await?;
                        if let State::Closed = self.state {
                            break;
                        }
                    }
                }
                Input::Data(Some(Err(e))) => return Err(e.into()),
                Input::Data(None) => {
                    log::debug!("Client {} closed the connection", self.id);
                    self.state = State::Closed;
                }
                Input::ForcedClose => {
                    if let State::Streaming(streaming) = &self.state {
                        log::info!(
                            "Closing publisher {} of {}: sink closed by consumer",
                            self.id,
                            streaming.registration.stream_key()
                        );
                    }
                    self.state = State::Closed;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::ReturnData(data) => self.bytes_stream.send(data).await?,
            Event::PublishRequested {
                request_id,
                app_name,
                stream_key,
            } => self.handle_publish(request_id, app_name, stream_key).await?,
            Event::Metadata { timestamp, data } => {
                self.forward(Packet::new_metadata(timestamp, data)).await
            }
            Event::MalformedData(e) => self.drop_tag("meta", e),
            Event::Audio { timestamp, data } => match AudioData::try_from(data.as_ref()) {
                Ok(audio) => {
                    if audio.is_sequence_header() {
                        log::debug!("Client {} sent audio sequence header", self.id);
                    }
                    self.forward(Packet::new_audio(timestamp, data)).await
                }
                Err(e) => self.drop_tag("audio", e),
            },
            Event::Video { timestamp, data } => match VideoData::try_from(data.as_ref()) {
                Ok(video) => {
                    if video.is_sequence_header() {
                        log::debug!("Client {} sent {:?} sequence header", self.id, video.codec);
                    }
                    self.forward(Packet::new_video(timestamp, data)).await
                }
                Err(source) => {
                    self.ctx
                        .metrics
                        .tags_dropped_total
                        .with_label_values(&["video"])
                        .inc();
                    return Err(Error::MediaDecode {
                        kind: "video",
                        source,
                    });
                }
            },
            Event::PublishFinished => {
                log::info!("Client {} finished publishing", self.id);
                self.state = State::Closed;
            }
        }
        Ok(())
    }

    async fn handle_publish(
        &mut self,
        request_id: u32,
        app_name: String,
        stream_key: String,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::AwaitingPublish) {
            self.reject(request_id, "already publishing").await?;
            return Err(Error::RequestRejected(
                stream_key,
                "connection is already publishing".to_string(),
            ));
        }
        if stream_key.is_empty() {
            self.reject(request_id, "stream key can not be empty").await?;
            return Err(Error::EmptyStreamKey);
        }
        log::info!(
            "Client {} requests to publish {} on app {}",
            self.id,
            stream_key,
            app_name
        );

        let info = match self.ctx.info_service.get_ingress_info(&stream_key).await {
            Ok(info) if info.input_type == InputType::Rtmp => info,
            Ok(info) => {
                return self
                    .refuse(request_id, stream_key, format!("ingress {} is not rtmp", info.ingress_id))
                    .await
            }
            Err(e) => return self.refuse(request_id, stream_key, e.to_string()).await,
        };

        // registration 在任何退出路径上被 drop 时都会关闭 sink 并注销
        let (sink, source) = StreamSink::pair(stream_key.clone(), self.ctx.sink_capacity);
        let registration = match self.ctx.registry.register(stream_key.clone(), sink.clone()) {
            Ok(registration) => registration,
            Err(_) => {
                return self
                    .refuse(request_id, stream_key, "stream key already publishing".to_string())
                    .await
            }
        };

        let ingress_id = info.ingress_id.clone();
        if let Err(e) =
            transport::start_ingress(&self.ctx.manager_handle, info, InputSource::Rtmp(source)).await
        {
            drop(registration);
            return self.refuse(request_id, stream_key, e.to_string()).await;
        }

        let events = self.proto.accept_request(request_id)?;
        self.send_return_data(events).await?;

        let writer = Writer::new(sink)
            .await
            .map_err(|_| Error::SinkClosed(stream_key.clone()))?;
        log::info!(
            "Client {} publishing {} for ingress {}",
            self.id,
            stream_key,
            ingress_id
        );
        self.state = State::Streaming(Streaming {
            registration,
            writer,
        });
        Ok(())
    }

    async fn refuse(
        &mut self,
        request_id: u32,
        stream_key: String,
        reason: String,
    ) -> Result<(), Error> {
        self.reject(request_id, &reason).await?;
        Err(Error::RequestRejected(stream_key, reason))
    }

    async fn reject(&mut self, request_id: u32, reason: &str) -> Result<(), Error> {
        log::warn!("Client {} publish rejected: {}", self.id, reason);
        let events = self.proto.reject_request(request_id, REJECT_CODE, reason)?;
        self.send_return_data(events).await
    }

    async fn send_return_data(&mut self, events: Vec<Event>) -> Result<(), Error> {
        for event in events {
            match event {
                Event::ReturnData(data) => self.bytes_stream.send(data).await?,
                other => log::debug!("Client {} ignoring {:?}", self.id, other),
            }
        }
        Ok(())
    }

    /// Writes one tag to the sink. Encode failures drop the tag; a closed
    /// sink ends the session.
    async fn forward(&mut self, packet: Packet) {
        let streaming = match &mut self.state {
            State::Streaming(streaming) => streaming,
            _ => {
                log::debug!("Client {} sent media before publishing", self.id);
                return;
            }
        };
        let kind = packet.kind.label();
        match streaming.writer.write(&packet).await {
            Ok(()) => self
                .ctx
                .metrics
                .tags_forwarded_total
                .with_label_values(&[kind])
                .inc(),
            Err(FlvError::Io(e)) => {
                log::info!("Stream sink {} closed: {}", streaming.registration.stream_key(), e);
                self.state = State::Closed;
            }
            Err(e) => {
                log::warn!(
                    "Dropping {} tag of {}: {}",
                    kind,
                    streaming.registration.stream_key(),
                    e
                );
                self.ctx
                    .metrics
                    .tags_dropped_total
                    .with_label_values(&[kind])
                    .inc();
            }
        }
    }

    fn drop_tag(&self, kind: &'static str, err: FlvError) {
        log::warn!("Client {} sent an undecodable {} tag: {}", self.id, kind, err);
        self.ctx
            .metrics
            .tags_dropped_total
            .with_label_values(&[kind])
            .inc();
    }
}

impl<S> Drop for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        self.ctx.metrics.connection_closed();
        log::info!("Client {} disconnected", self.id);
    }
}
