use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlvError {
    #[error("Not enough data: {0}")]
    NotEnoughData(&'static str),

    #[error("Unsupported or unknown video format {0}")]
    UnsupportedVideoFormat(u8),

    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("Unknown package type {0}")]
    UnknownPackageType(u8),

    #[error("Undecodable script data: {0}")]
    ScriptDecoding(String),

    #[error("Tag body too large: {0} bytes")]
    TagTooLarge(usize),

    #[error("Io error: {0}")]
    Io(#[from] io::Error),
}
