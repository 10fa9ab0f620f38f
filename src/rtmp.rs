use crate::codec::flv::ScriptData;
use crate::codec::FlvError;
use crate::error::Error;
use bytes::Bytes;
use rml_rtmp::chunk_io::{ChunkDeserializer, ChunkSerializer};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::{MessagePayload, RtmpMessage};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use rml_rtmp::time::RtmpTimestamp;
use std::collections::VecDeque;
use std::convert::TryFrom;

const SET_CHUNK_SIZE: u8 = 1;
const AMF3_DATA: u8 = 15;
const AMF0_DATA: u8 = 18;

// 每条消息在会话内只占一个 chunk
const SESSION_CHUNK_SIZE: u32 = 0x00FF_FFFF;

/// Things the connection has to act on after feeding bytes to the protocol.
#[derive(Debug)]
pub enum Event {
    ReturnData(Bytes),
    PublishRequested {
        request_id: u32,
        app_name: String,
        stream_key: String,
    },
    /// `onMetaData` tag body as the publisher encoded it.
    Metadata {
        timestamp: u32,
        data: Bytes,
    },
    /// A data message that could not be decoded.
    MalformedData(FlvError),
    Audio {
        timestamp: u32,
        data: Bytes,
    },
    Video {
        timestamp: u32,
        data: Bytes,
    },
    PublishFinished,
}

/// Server side of one RTMP connection: handshake, then chunk stream session.
/// Connect requests are accepted here; publish requests are surfaced.
///
/// Chunks are reassembled here first. Data messages (`onMetaData`) are
/// decoded locally and never reach the `ServerSession`; every other
/// message is re-chunked and fed to it.
pub struct Protocol {
    handshake: Option<Handshake>,
    session: Option<ServerSession>,
    deserializer: ChunkDeserializer,
    serializer: ChunkSerializer,
}

impl Protocol {
    pub fn new() -> Self {
        Self {
            handshake: Some(Handshake::new(PeerType::Server)),
            session: None,
            deserializer: ChunkDeserializer::new(),
            serializer: ChunkSerializer::new(),
        }
    }

    pub fn handshake_completed(&self) -> bool {
        self.session.is_some()
    }

    pub fn handle_bytes(&mut self, input: &[u8]) -> Result<Vec<Event>, Error> {
        if let Some(handshake) = self.handshake.as_mut() {
            let result = handshake
                .process_bytes(input)
                .map_err(|e| Error::HandshakeFailed(format!("{:?}", e)))?;
            return match result {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    Ok(vec![Event::ReturnData(response_bytes.into())])
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    log::debug!("handshake completed");
                    self.handshake = None;
                    let mut events = vec![Event::ReturnData(response_bytes.into())];
                    events.extend(self.start_session(&remaining_bytes)?);
                    Ok(events)
                }
            };
        }

        let mut input = input;
        let mut events = Vec::new();
        loop {
            let payload = self
                .deserializer
                .get_next_message(input)
                .map_err(|e| Error::Session(format!("{:?}", e)))?;
            input = &[];
            match payload {
                Some(payload) => events.extend(self.handle_message(payload)?),
                None => return Ok(events),
            }
        }
    }

    fn handle_message(&mut self, payload: MessagePayload) -> Result<Vec<Event>, Error> {
        match payload.type_id {
            AMF0_DATA | AMF3_DATA => Ok(self.handle_data(payload).into_iter().collect()),
            SET_CHUNK_SIZE => {
                // 只影响客户端到本端的 chunk 大小
                match payload.to_rtmp_message() {
                    Ok(RtmpMessage::SetChunkSize { size }) => self
                        .deserializer
                        .set_max_chunk_size(size as usize)
                        .map_err(|e| Error::Session(format!("{:?}", e)))?,
                    other => log::debug!("bad set chunk size message: {:?}", other),
                }
                Ok(Vec::new())
            }
            _ => self.feed_session(&payload),
        }
    }

    fn handle_data(&self, payload: MessagePayload) -> Option<Event> {
        let mut data = payload.data;
        if payload.type_id == AMF3_DATA && data.first() == Some(&0) {
            data = data.slice(1..);
        }
        match ScriptData::try_from(data) {
            Ok(script) if script.is_metadata() => Some(Event::Metadata {
                timestamp: payload.timestamp.value,
                data: script.body,
            }),
            Ok(script) => {
                log::debug!("ignored {} data message", script.name);
                None
            }
            Err(e) => Some(Event::MalformedData(e)),
        }
    }

    fn feed_session(&mut self, payload: &MessagePayload) -> Result<Vec<Event>, Error> {
        let packet = self
            .serializer
            .serialize(payload, false, false)
            .map_err(|e| Error::Session(format!("{:?}", e)))?;
        let results = self
            .session_mut()?
            .handle_input(&packet.bytes)
            .map_err(|e| Error::Session(format!("{:?}", e)))?;
        self.handle_results(results)
    }

    fn start_session(&mut self, remaining_bytes: &[u8]) -> Result<Vec<Event>, Error> {
        let config = ServerSessionConfig::new();
        let (session, results) =
            ServerSession::new(config).map_err(|e| Error::Session(format!("{:?}", e)))?;
        self.session = Some(session);
        let mut events = self.handle_results(results)?;

        let packet = self
            .serializer
            .set_max_chunk_size(SESSION_CHUNK_SIZE, RtmpTimestamp::new(0))
            .map_err(|e| Error::Session(format!("{:?}", e)))?;
        let results = self
            .session_mut()?
            .handle_input(&packet.bytes)
            .map_err(|e| Error::Session(format!("{:?}", e)))?;
        events.extend(self.handle_results(results)?);

        if !remaining_bytes.is_empty() {
            events.extend(self.handle_bytes(remaining_bytes)?);
        }
        Ok(events)
    }

    pub fn accept_request(&mut self, request_id: u32) -> Result<Vec<Event>, Error> {
        let results = self
            .session_mut()?
            .accept_request(request_id)
            .map_err(|e| Error::Session(format!("{:?}", e)))?;
        self.handle_results(results)
    }

    pub fn reject_request(
        &mut self,
        request_id: u32,
        code: &str,
        description: &str,
    ) -> Result<Vec<Event>, Error> {
        let results = self
            .session_mut()?
            .reject_request(request_id, code, description)
            .map_err(|e| Error::Session(format!("{:?}", e)))?;
        self.handle_results(results)
    }

    fn session_mut(&mut self) -> Result<&mut ServerSession, Error> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Session("session used before handshake completed".to_string()))
    }

    fn handle_results(&mut self, results: Vec<ServerSessionResult>) -> Result<Vec<Event>, Error> {
        let mut queue: VecDeque<ServerSessionResult> = results.into();
        let mut events = Vec::new();
        while let Some(result) = queue.pop_front() {
            match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    events.push(Event::ReturnData(packet.bytes.into()))
                }
                ServerSessionResult::RaisedEvent(event) => match event {
                    ServerSessionEvent::ConnectionRequested {
                        request_id,
                        app_name,
                    } => {
                        log::debug!("connect request for app {}", app_name);
                        let accepted = self
                            .session_mut()?
                            .accept_request(request_id)
                            .map_err(|e| Error::Session(format!("{:?}", e)))?;
                        queue.extend(accepted);
                    }
                    ServerSessionEvent::PublishStreamRequested {
                        request_id,
                        app_name,
                        stream_key,
                        mode: _,
                    } => events.push(Event::PublishRequested {
                        request_id,
                        app_name,
                        stream_key,
                    }),
                    ServerSessionEvent::PublishStreamFinished { .. } => {
                        events.push(Event::PublishFinished)
                    }
                    ServerSessionEvent::AudioDataReceived {
                        data, timestamp, ..
                    } => events.push(Event::Audio {
                        timestamp: timestamp.value,
                        data,
                    }),
                    ServerSessionEvent::VideoDataReceived {
                        data, timestamp, ..
                    } => events.push(Event::Video {
                        timestamp: timestamp.value,
                        data,
                    }),
                    other => log::trace!("ignored rtmp event {:?}", other),
                },
                ServerSessionResult::UnhandleableMessageReceived(payload) => {
                    log::debug!("unhandleable rtmp message of type {}", payload.type_id)
                }
            }
        }
        Ok(events)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new()
    }
}
