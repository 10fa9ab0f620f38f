use bytes::Bytes;
use rml_amf0::Amf0Value;
use rml_rtmp::chunk_io::ChunkSerializer;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::messages::MessagePayload;
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const AMF0_DATA: u8 = 18;

/// Minimal RTMP publisher driving one end of an in-memory pipe.
pub struct TestClient {
    stream: DuplexStream,
    session: ClientSession,
    /// Chunks hand-built data messages; shares the session's chunk size.
    raw: ChunkSerializer,
}

impl TestClient {
    /// Handshakes and connects to `app`.
    pub async fn connect(mut stream: DuplexStream, app: &str) -> Self {
        let mut handshake = Handshake::new(PeerType::Client);
        let p0_p1 = handshake.generate_outbound_p0_and_p1().unwrap();
        stream.write_all(&p0_p1).await.unwrap();

        let mut buf = vec![0u8; 8192];
        let leftover = loop {
            let n = timeout(READ_TIMEOUT, stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "server closed during handshake");
            match handshake.process_bytes(&buf[..n]).unwrap() {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    stream.write_all(&response_bytes).await.unwrap();
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    stream.write_all(&response_bytes).await.unwrap();
                    break remaining_bytes;
                }
            }
        };

        let config = ClientSessionConfig::new();
        let mut raw = ChunkSerializer::new();
        // the session announces this chunk size itself
        raw.set_max_chunk_size(config.chunk_size, RtmpTimestamp::new(0))
            .unwrap();
        let (session, results) = ClientSession::new(config).unwrap();
        let mut client = Self {
            stream,
            session,
            raw,
        };
        client.send_results(results).await;
        if !leftover.is_empty() {
            let results = client.session.handle_input(&leftover).unwrap();
            client.send_results(results).await;
        }

        let request = client.session.request_connection(app.to_string()).unwrap();
        client.send_result(request).await;
        let connected = client
            .wait_for(|e| matches!(e, ClientSessionEvent::ConnectionRequestAccepted))
            .await;
        assert!(connected, "connect request was not accepted");
        client
    }

    /// Requests to publish `stream_key`. Returns false when the server refuses
    /// and hangs up.
    pub async fn publish(&mut self, stream_key: &str) -> bool {
        let request = self
            .session
            .request_publishing(stream_key.to_string(), PublishRequestType::Live)
            .unwrap();
        self.send_result(request).await;
        self.wait_for(|e| matches!(e, ClientSessionEvent::PublishRequestAccepted))
            .await
    }

    pub async fn send_metadata(&mut self, width: u32, height: u32) {
        let mut metadata = StreamMetadata::new();
        metadata.video_width = Some(width);
        metadata.video_height = Some(height);
        let result = self.session.publish_metadata(&metadata).unwrap();
        self.send_result(result).await;
    }

    pub async fn send_audio(&mut self, timestamp: u32, data: &'static [u8]) {
        let result = self
            .session
            .publish_audio_data(Bytes::from_static(data), RtmpTimestamp::new(timestamp), false)
            .unwrap();
        self.send_result(result).await;
    }

    pub async fn send_video(&mut self, timestamp: u32, data: &'static [u8]) {
        let result = self
            .session
            .publish_video_data(Bytes::from_static(data), RtmpTimestamp::new(timestamp), false)
            .unwrap();
        self.send_result(result).await;
    }

    /// Sends `data` as the body of an AMF0 data message, bypassing the
    /// session's own encoding. Uses a full chunk header, so it must not be
    /// followed by `send_metadata`.
    pub async fn send_raw_data(&mut self, timestamp: u32, data: Vec<u8>) {
        let payload = MessagePayload {
            timestamp: RtmpTimestamp::new(timestamp),
            type_id: AMF0_DATA,
            message_stream_id: 1,
            data: Bytes::from(data),
        };
        let packet = self.raw.serialize(&payload, true, false).unwrap();
        self.stream.write_all(&packet.bytes).await.unwrap();
    }

    pub async fn send_data(&mut self, timestamp: u32, values: Vec<Amf0Value>) {
        let data = rml_amf0::serialize(&values).unwrap();
        self.send_raw_data(timestamp, data).await;
    }

    /// Reads until the server closes the pipe. Returns false on timeout.
    pub async fn wait_closed(&mut self) -> bool {
        let mut buf = vec![0u8; 4096];
        loop {
            match timeout(READ_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Processes server traffic until `pred` matches a raised event.
    /// Returns false if the server hangs up first.
    async fn wait_for(&mut self, pred: impl Fn(&ClientSessionEvent) -> bool) -> bool {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = match timeout(READ_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for the server")
            {
                Ok(0) | Err(_) => return false,
                Ok(n) => n,
            };
            let results = self.session.handle_input(&buf[..n]).unwrap();
            let mut matched = false;
            for result in results {
                match result {
                    ClientSessionResult::OutboundResponse(packet) => {
                        // the server may already be gone after a refusal
                        let _ = self.stream.write_all(&packet.bytes).await;
                    }
                    ClientSessionResult::RaisedEvent(event) => matched |= pred(&event),
                    _ => {}
                }
            }
            if matched {
                return true;
            }
        }
    }

    async fn send_results(&mut self, results: Vec<ClientSessionResult>) {
        for result in results {
            self.send_result(result).await;
        }
    }

    async fn send_result(&mut self, result: ClientSessionResult) {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            self.stream.write_all(&packet.bytes).await.unwrap();
        }
    }

    /// Drops the pipe, as a publisher that just disconnects would.
    pub fn disconnect(self) {
        drop(self.stream);
    }
}
