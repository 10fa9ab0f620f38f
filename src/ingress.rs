use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type IngressId = String;
pub type ResourceId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputType {
    Rtmp,
    Whip,
}

impl InputType {
    pub fn label(&self) -> &'static str {
        match self {
            InputType::Rtmp => "rtmp",
            InputType::Whip => "whip",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioCodec {
    Opus,
    Aac,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoCodec {
    H264Baseline,
    H264Main,
    H264High,
    Vp8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioOptions {
    pub name: String,
    pub codec: AudioCodec,
    pub bitrate: u32,
    pub channels: u32,
    #[serde(default)]
    pub disable_dtx: bool,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            name: "audio".to_string(),
            codec: AudioCodec::Opus,
            bitrate: 64_000,
            channels: 2,
            disable_dtx: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoOptions {
    pub name: String,
    pub codec: VideoCodec,
    pub frame_rate: f64,
    pub layers: Vec<VideoLayer>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            name: "video".to_string(),
            codec: VideoCodec::H264Baseline,
            frame_rate: 30.0,
            layers: vec![VideoLayer {
                quality: VideoQuality::High,
                width: 1280,
                height: 720,
                bitrate: 3_000_000,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    EndpointInactive,
    EndpointBuffering,
    #[serde(alias = "ACTIVE")]
    EndpointPublishing,
    EndpointError,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::EndpointInactive | Status::EndpointError)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IngressState {
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    /// unix 毫秒
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: i64,
}

impl IngressState {
    /// Same status and error text: publishing this again would not be a transition.
    pub fn same_transition(&self, other: &IngressState) -> bool {
        self.status == other.status && self.error == other.error
    }
}

/// Logical ingress configuration, created by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngressInfo {
    pub ingress_id: IngressId,
    #[serde(default)]
    pub name: String,
    pub stream_key: String,
    #[serde(default)]
    pub url: String,
    pub input_type: InputType,
    pub room_name: String,
    #[serde(default)]
    pub participant_identity: String,
    #[serde(default)]
    pub participant_name: String,
    #[serde(default)]
    pub reusable: bool,
    #[serde(default)]
    pub bypass_transcoding: bool,
    #[serde(default)]
    pub audio: AudioOptions,
    #[serde(default)]
    pub video: VideoOptions,
    #[serde(default)]
    pub state: IngressState,
}

impl IngressInfo {
    pub fn new(
        ingress_id: impl Into<String>,
        stream_key: impl Into<String>,
        input_type: InputType,
        room_name: impl Into<String>,
    ) -> Self {
        Self {
            ingress_id: ingress_id.into(),
            name: String::new(),
            stream_key: stream_key.into(),
            url: String::new(),
            input_type,
            room_name: room_name.into(),
            participant_identity: String::new(),
            participant_name: String::new(),
            reusable: false,
            bypass_transcoding: false,
            audio: AudioOptions::default(),
            video: VideoOptions::default(),
            state: IngressState::default(),
        }
    }

    pub fn with_bypass_transcoding(mut self, bypass: bool) -> Self {
        self.bypass_transcoding = bypass;
        self
    }

    /// Label used for the `transcoding` metric dimension.
    pub fn transcoding_label(&self) -> &'static str {
        if self.bypass_transcoding {
            "false"
        } else {
            "true"
        }
    }

    pub fn set_status(&mut self, status: Status, error: Option<String>) {
        let now = Utc::now().timestamp_millis();
        match status {
            Status::EndpointBuffering if self.state.started_at == 0 => self.state.started_at = now,
            s if s.is_terminal() => self.state.ended_at = now,
            _ => {}
        }
        self.state.status = status;
        self.state.error = error.unwrap_or_default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateIngressRequest {
    pub ingress_id: IngressId,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteIngressRequest {
    pub ingress_id: IngressId,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteWhipResourceRequest {
    pub resource_id: ResourceId,
    pub stream_key: String,
}
