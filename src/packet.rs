use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Timestamp {
    value: u64,
}

impl From<u32> for Timestamp {
    fn from(val: u32) -> Self {
        Self { value: val.into() }
    }
}

impl From<Timestamp> for u32 {
    fn from(val: Timestamp) -> Self {
        val.value as u32
    }
}

impl From<u64> for Timestamp {
    fn from(val: u64) -> Self {
        Self { value: val }
    }
}

impl From<Timestamp> for u64 {
    fn from(val: Timestamp) -> Self {
        val.value
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PacketType {
    Meta,
    Video,
    Audio,
}

impl PacketType {
    pub fn label(&self) -> &'static str {
        match self {
            PacketType::Meta => "meta",
            PacketType::Video => "video",
            PacketType::Audio => "audio",
        }
    }
}

/// One demuxed RTMP media message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketType,
    pub timestamp: Option<Timestamp>,
    pub payload: Bytes,
}

impl Packet {
    pub fn new<T, B>(kind: PacketType, timestamp: Option<T>, payload: B) -> Self
    where
        T: Into<Timestamp>,
        B: Into<Bytes>,
    {
        let timestamp = timestamp.map(|v| v.into());
        Self {
            kind,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn new_video<T, B>(timestamp: T, payload: B) -> Self
    where
        T: Into<Timestamp>,
        B: Into<Bytes>,
    {
        Self::new(PacketType::Video, Some(timestamp), payload)
    }

    pub fn new_audio<T, B>(timestamp: T, payload: B) -> Self
    where
        T: Into<Timestamp>,
        B: Into<Bytes>,
    {
        Self::new(PacketType::Audio, Some(timestamp), payload)
    }

    /// Script data packet; `payload` is the `onMetaData` tag body.
    pub fn new_metadata<T, B>(timestamp: T, payload: B) -> Self
    where
        T: Into<Timestamp>,
        B: Into<Bytes>,
    {
        Self::new(PacketType::Meta, Some(timestamp), payload)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}
