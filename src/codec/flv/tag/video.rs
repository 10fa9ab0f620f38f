use bytes::BufMut;

use {
    crate::codec::flv::error::FlvError,
    bytes::{Buf, Bytes},
    std::{
        convert::TryFrom,
        fmt::{self, Debug},
        io::Cursor,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum FrameType {
    KeyFrame,
    InterFrame,
    DisposableInterFrame,
    GeneratedKeyframe,
    VideoInfoFrame,
}

impl TryFrom<u8> for FrameType {
    type Error = FlvError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            1 => Self::KeyFrame,
            2 => Self::InterFrame,
            3 => Self::DisposableInterFrame,
            4 => Self::GeneratedKeyframe,
            5 => Self::VideoInfoFrame,
            x => return Err(FlvError::UnknownFrameType(x)),
        })
    }
}

impl From<FrameType> for u8 {
    fn from(val: FrameType) -> u8 {
        match val {
            FrameType::KeyFrame => 1,
            FrameType::InterFrame => 2,
            FrameType::DisposableInterFrame => 3,
            FrameType::GeneratedKeyframe => 4,
            FrameType::VideoInfoFrame => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum Codec {
    SorensonH263,
    ScreenVideo,
    Vp6,
    Vp6Alpha,
    ScreenVideo2,
    H264,
    H265,
}

impl Codec {
    fn id(&self) -> u8 {
        match self {
            Codec::SorensonH263 => 2,
            Codec::ScreenVideo => 3,
            Codec::Vp6 => 4,
            Codec::Vp6Alpha => 5,
            Codec::ScreenVideo2 => 6,
            Codec::H264 => 7,
            Codec::H265 => 12,
        }
    }

    /// AVC-style codecs carry a packet type and composition time after the first byte.
    pub fn has_avc_header(&self) -> bool {
        matches!(self, Codec::H264 | Codec::H265)
    }
}

impl TryFrom<u8> for Codec {
    type Error = FlvError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            2 => Self::SorensonH263,
            3 => Self::ScreenVideo,
            4 => Self::Vp6,
            5 => Self::Vp6Alpha,
            6 => Self::ScreenVideo2,
            7 => Self::H264,
            12 => Self::H265,
            x => return Err(FlvError::UnsupportedVideoFormat(x)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum AvcPacketType {
    SequenceHeader,
    NalUnit,
    EndOfSequence,
    None,
}

impl TryFrom<u8> for AvcPacketType {
    type Error = FlvError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0 => Self::SequenceHeader,
            1 => Self::NalUnit,
            2 => Self::EndOfSequence,
            x => return Err(FlvError::UnknownPackageType(x)),
        })
    }
}

// Field                | Type
// -------------------- | ---
// Frame Type           | u4
// Codec ID             | u4
// AVC Packet Type      | u8   (H264/H265 only)
// Composition Time     | i24  (H264/H265 only)
// Body                 | [u8]
#[derive(Clone)]
pub struct VideoData {
    pub frame_type: FrameType,
    pub packet_type: AvcPacketType,
    pub composition_time: i32,
    pub codec: Codec,
    pub body: Bytes,
}

impl VideoData {
    pub fn is_sequence_header(&self) -> bool {
        self.packet_type == AvcPacketType::SequenceHeader
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut a = Vec::with_capacity(self.body.len() + 5);
        let ft: u8 = self.frame_type.into();
        a.put_u8(ft << 4 | self.codec.id());
        if self.codec.has_avc_header() {
            let pt: u32 = match self.packet_type {
                AvcPacketType::SequenceHeader => 0,
                AvcPacketType::NalUnit => 1,
                AvcPacketType::EndOfSequence | AvcPacketType::None => 2,
            };
            let t = (self.composition_time as u32 & 0x00_FF_FF_FF) | pt << 24;
            a.put_u32(t);
        }
        a.extend_from_slice(&self.body);
        a
    }
}

impl Debug for VideoData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Video")
            .field("codec", &self.codec)
            .field("frame_type", &self.frame_type)
            .field("packet_type", &self.packet_type)
            .field("composition_time", &self.composition_time)
            .finish()
    }
}

impl TryFrom<&[u8]> for VideoData {
    type Error = FlvError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.is_empty() {
            return Err(FlvError::NotEnoughData("FLV Video Tag header"));
        }

        let mut buf = Cursor::new(bytes);
        let header_a = buf.get_u8();
        let codec = Codec::try_from(header_a & 0x0F)?;
        let frame_type = FrameType::try_from(header_a >> 4)?;

        let (packet_type, composition_time) = if codec.has_avc_header() {
            if bytes.len() < 5 {
                return Err(FlvError::NotEnoughData("FLV AVC Video Tag header"));
            }
            let header_b = buf.get_u32();
            let packet_type = AvcPacketType::try_from((header_b >> 24) as u8)?;
            // sign-extend the 24 bit composition time
            let composition_time = ((header_b << 8) as i32) >> 8;
            (packet_type, composition_time)
        } else {
            (AvcPacketType::None, 0)
        };

        let pos = buf.position() as usize;
        Ok(Self {
            frame_type,
            packet_type,
            composition_time,
            body: Bytes::copy_from_slice(&bytes[pos..]),
            codec,
        })
    }
}
