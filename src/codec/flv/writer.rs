use crate::codec::flv::{error::FlvError, TagType};
use crate::packet::{Packet, PacketType};
use crate::{put_i24_be, put_i32_be, FLV_HEADER};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;

const TAG_HEADER_LEN: usize = 11;
const MAX_TAG_BODY: usize = 0x00FF_FFFF;

/// Destination for an FLV byte-stream.
#[async_trait]
pub trait TagSink: Send + Sync {
    async fn write_chunk(&self, chunk: Bytes) -> io::Result<()>;
}

/// Encodes one packet as a complete FLV tag followed by its previous-tag-size trailer.
pub fn encode_tag(packet: &Packet) -> Result<Bytes, FlvError> {
    let tag_type = match packet.kind {
        PacketType::Audio => TagType::Audio,
        PacketType::Meta => TagType::ScriptData,
        PacketType::Video => TagType::Video,
    };
    let type_id = tag_type as u8;

    let data_len = packet.payload.len();
    if data_len > MAX_TAG_BODY {
        return Err(FlvError::TagTooLarge(data_len));
    }
    let timestamp: u64 = match packet.timestamp {
        Some(u) => u.into(),
        None => 0,
    };

    let pre_data_len = data_len + TAG_HEADER_LEN;
    let timestamp_base = timestamp & 0xffffff;
    let timestamp_ext = timestamp >> 24 & 0xff;
    let mut h = [0u8; TAG_HEADER_LEN];

    h[0] = type_id;
    put_i24_be(&mut h[1..4], data_len as i32);
    put_i24_be(&mut h[4..7], timestamp_base as i32);
    h[7] = timestamp_ext as u8;
    // h[8..11] stream id, always 0

    let mut out = BytesMut::with_capacity(pre_data_len + 4);
    out.put_slice(&h);
    out.put_slice(&packet.payload);
    let mut size = [0u8; 4];
    put_i32_be(&mut size, pre_data_len as i32);
    out.put_slice(&size);
    Ok(out.freeze())
}

pub struct Writer<S: TagSink> {
    sink: S,
}

impl<S: TagSink> Writer<S> {
    /// Opens a fresh FLV stream on `sink`, writing the file header first.
    pub async fn new(sink: S) -> io::Result<Self> {
        sink.write_chunk(Bytes::from_static(&FLV_HEADER)).await?;
        Ok(Self { sink })
    }

    pub async fn write(&mut self, packet: &Packet) -> Result<(), FlvError> {
        let tag = encode_tag(packet)?;
        self.sink.write_chunk(tag).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct VecSink(Arc<Mutex<Vec<u8>>>);

    #[async_trait]
    impl TagSink for VecSink {
        async fn write_chunk(&self, chunk: Bytes) -> io::Result<()> {
            self.0.lock().extend_from_slice(&chunk);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writer_emits_header_and_tags() {
        let sink = VecSink::default();
        let mut writer = Writer::new(sink.clone()).await.unwrap();
        writer
            .write(&Packet::new_audio(0x01020304u32, vec![0xAF, 0x01, 0x55]))
            .await
            .unwrap();

        let out = sink.0.lock().clone();
        assert_eq!(&out[..13], &FLV_HEADER);
        let tag = &out[13..];
        assert_eq!(tag[0], 8);
        assert_eq!(&tag[1..4], &[0, 0, 3]);
        // lower 24 bits then the extended byte
        assert_eq!(&tag[4..8], &[0x02, 0x03, 0x04, 0x01]);
        assert_eq!(&tag[8..11], &[0, 0, 0]);
        assert_eq!(&tag[11..14], &[0xAF, 0x01, 0x55]);
        assert_eq!(&tag[14..18], &[0, 0, 0, 14]);
        assert_eq!(tag.len(), 18);
    }

    #[test]
    fn test_metadata_tag_without_timestamp() {
        let packet = Packet::new(PacketType::Meta, None::<u32>, vec![0x02]);
        let tag = encode_tag(&packet).unwrap();
        assert_eq!(tag[0], 18);
        assert_eq!(&tag[4..8], &[0, 0, 0, 0]);
    }
}
