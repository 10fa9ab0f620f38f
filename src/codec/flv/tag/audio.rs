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
pub enum AudioFormat {
    LinearPcmPlatformEndian,
    Adpcm,
    Mp3,
    LinearPcmLittleEndian,
    Nellymoser16kMono,
    Nellymoser8kMono,
    Nellymoser,
    G711ALaw,
    G711MuLaw,
    Reserved,
    Aac,
    Speex,
    Mp3_8k,
    DeviceSpecific,
}

impl From<u8> for AudioFormat {
    fn from(val: u8) -> Self {
        match val & 0x0F {
            0 => Self::LinearPcmPlatformEndian,
            1 => Self::Adpcm,
            2 => Self::Mp3,
            3 => Self::LinearPcmLittleEndian,
            4 => Self::Nellymoser16kMono,
            5 => Self::Nellymoser8kMono,
            6 => Self::Nellymoser,
            7 => Self::G711ALaw,
            8 => Self::G711MuLaw,
            10 => Self::Aac,
            11 => Self::Speex,
            14 => Self::Mp3_8k,
            15 => Self::DeviceSpecific,
            _ => Self::Reserved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum AacPacketType {
    SequenceHeader,
    Raw,
    None,
}

// Field                | Type
// -------------------- | ---
// Sound Format         | u4
// Sound Rate           | u2
// Sound Size           | u1
// Sound Type           | u1
// AAC Packet Type      | u8 (AAC only)
// Body                 | [u8]
#[derive(Clone)]
pub struct AudioData {
    pub format: AudioFormat,
    pub sound_rate: u8,
    pub sound_size: u8,
    pub sound_type: u8,
    pub packet_type: AacPacketType,
    pub body: Bytes,
}

impl AudioData {
    pub fn is_sequence_header(&self) -> bool {
        self.packet_type == AacPacketType::SequenceHeader
    }

    pub fn header_byte(&self) -> u8 {
        let format = match self.format {
            AudioFormat::LinearPcmPlatformEndian => 0,
            AudioFormat::Adpcm => 1,
            AudioFormat::Mp3 => 2,
            AudioFormat::LinearPcmLittleEndian => 3,
            AudioFormat::Nellymoser16kMono => 4,
            AudioFormat::Nellymoser8kMono => 5,
            AudioFormat::Nellymoser => 6,
            AudioFormat::G711ALaw => 7,
            AudioFormat::G711MuLaw => 8,
            AudioFormat::Reserved => 9,
            AudioFormat::Aac => 10,
            AudioFormat::Speex => 11,
            AudioFormat::Mp3_8k => 14,
            AudioFormat::DeviceSpecific => 15,
        };
        format << 4 | (self.sound_rate & 0x03) << 2 | (self.sound_size & 0x01) << 1 | (self.sound_type & 0x01)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut a = Vec::with_capacity(self.body.len() + 2);
        a.push(self.header_byte());
        match self.packet_type {
            AacPacketType::SequenceHeader => a.push(0),
            AacPacketType::Raw => a.push(1),
            AacPacketType::None => {}
        }
        a.extend_from_slice(&self.body);
        a
    }
}

impl Debug for AudioData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Audio")
            .field("format", &self.format)
            .field("packet_type", &self.packet_type)
            .field("len", &self.body.len())
            .finish()
    }
}

impl TryFrom<&[u8]> for AudioData {
    type Error = FlvError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.is_empty() {
            return Err(FlvError::NotEnoughData("FLV Audio Tag header"));
        }

        let mut buf = Cursor::new(bytes);
        let header = buf.get_u8();
        let format = AudioFormat::from(header >> 4);
        let sound_rate = (header >> 2) & 0x03;
        let sound_size = (header >> 1) & 0x01;
        let sound_type = header & 0x01;

        let packet_type = if format == AudioFormat::Aac {
            if !buf.has_remaining() {
                return Err(FlvError::NotEnoughData("AAC packet type"));
            }
            match buf.get_u8() {
                0 => AacPacketType::SequenceHeader,
                1 => AacPacketType::Raw,
                x => return Err(FlvError::UnknownPackageType(x)),
            }
        } else {
            AacPacketType::None
        };

        let pos = buf.position() as usize;
        Ok(Self {
            format,
            sound_rate,
            sound_size,
            sound_type,
            packet_type,
            body: Bytes::copy_from_slice(&bytes[pos..]),
        })
    }
}
