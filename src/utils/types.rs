use crate::utils::error::RtmpError;
use bytes::Bytes;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "rtmp-streams")]
#[command(about = "RTMP message-stream server")]
pub struct Args {
    #[arg(short, long, default_value = "127.0.0.1:1935")]
    pub bind: String,

    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,
}

pub type Result<T> = std::result::Result<T, RtmpError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Outbound chunk size announced to every peer.
    pub chunk_size: usize,
    pub max_connections: usize,
    /// Consecutive decode errors tolerated on one connection before it is dropped.
    pub max_consecutive_errors: u32,
}

/// Chunk size every RTMP peer starts with until told otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Largest value accepted in a Set Chunk Size message.
pub const MAX_CHUNK_SIZE: usize = 0x7FFF_FFFF;
/// Timestamps at or above this value move to the extended timestamp field.
pub const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;
pub const MAX_MESSAGE_LENGTH: usize = 0xFF_FFFF;

pub const CONTROL_CHUNK_STREAM: u32 = 2;
pub const COMMAND_CHUNK_STREAM: u32 = 3;
pub const AUDIO_CHUNK_STREAM: u32 = 4;
pub const DATA_CHUNK_STREAM: u32 = 5;
pub const VIDEO_CHUNK_STREAM: u32 = 6;

impl TryFrom<u8> for MessageType {
    type Error = RtmpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::SetChunkSize),
            2 => Ok(MessageType::Abort),
            3 => Ok(MessageType::Acknowledgement),
            4 => Ok(MessageType::UserControl),
            5 => Ok(MessageType::WindowAckSize),
            6 => Ok(MessageType::SetPeerBandwidth),
            8 => Ok(MessageType::Audio),
            9 => Ok(MessageType::Video),
            15 => Ok(MessageType::DataAmf3),
            16 => Ok(MessageType::SharedObjectAmf3),
            17 => Ok(MessageType::CommandAmf3),
            18 => Ok(MessageType::DataAmf0),
            19 => Ok(MessageType::SharedObjectAmf0),
            20 => Ok(MessageType::CommandAmf0),
            22 => Ok(MessageType::Aggregate),
            _ => Err(RtmpError::Protocol(format!("Unknown message type: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SetChunkSize = 1,
    Abort = 2,
    Acknowledgement = 3,
    UserControl = 4,
    WindowAckSize = 5,
    SetPeerBandwidth = 6,
    Audio = 8,
    Video = 9,
    DataAmf3 = 15,
    SharedObjectAmf3 = 16,
    CommandAmf3 = 17,
    DataAmf0 = 18,
    SharedObjectAmf0 = 19,
    CommandAmf0 = 20,
    Aggregate = 22,
}

/// The logical sub-channel a message belongs to once demultiplexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control,
    Data,
    Command,
}

impl MessageType {
    /// Returns the sub-channel carrying this message type, if any of ours does.
    pub fn channel(self) -> Option<Channel> {
        match self {
            MessageType::SetChunkSize
            | MessageType::Abort
            | MessageType::Acknowledgement
            | MessageType::UserControl
            | MessageType::WindowAckSize
            | MessageType::SetPeerBandwidth => Some(Channel::Control),
            MessageType::Audio
            | MessageType::Video
            | MessageType::DataAmf3
            | MessageType::DataAmf0 => Some(Channel::Data),
            MessageType::CommandAmf3 | MessageType::CommandAmf0 => Some(Channel::Command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub format: u8,
    pub chunk_stream_id: u32,
    pub timestamp: u32,
    pub message_length: u32,
    pub message_type: u8,
    pub message_stream_id: u32,
}

impl ChunkHeader {
    pub fn new(chunk_stream_id: u32, message_type: MessageType, message_stream_id: u32) -> Self {
        Self {
            format: 0,
            chunk_stream_id,
            timestamp: 0,
            message_length: 0,
            message_type: message_type as u8,
            message_stream_id,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One complete RTMP message as it travels between the wire and a message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub data: Bytes,
}

impl Chunk {
    /// Builds a chunk around `data`, fixing up the header's message length.
    pub fn new(mut header: ChunkHeader, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        header.message_length = data.len() as u32;
        Self { header, data }
    }

    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.header.message_type)
    }
}
