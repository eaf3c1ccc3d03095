use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use rml_amf0::Amf0Value;
use tokio::sync::mpsc;

use crate::chunk::writer::ChunkWriter;
use crate::stream::message::{Chunker, MessageStream, Parser};
use crate::utils::error::RtmpError;
use crate::utils::types::{
    Chunk, ChunkHeader, MessageType, Result, AUDIO_CHUNK_STREAM, DATA_CHUNK_STREAM,
    VIDEO_CHUNK_STREAM,
};

/// A media or metadata frame carried on a data sub-channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DataFrame {
    Audio {
        timestamp: u32,
        stream_id: u32,
        payload: Bytes,
    },
    Video {
        timestamp: u32,
        stream_id: u32,
        payload: Bytes,
    },
    /// Script data such as `@setDataFrame`/`onMetaData`.
    Metadata {
        timestamp: u32,
        stream_id: u32,
        values: Vec<Amf0Value>,
    },
}

impl DataFrame {
    pub fn timestamp(&self) -> u32 {
        match self {
            DataFrame::Audio { timestamp, .. }
            | DataFrame::Video { timestamp, .. }
            | DataFrame::Metadata { timestamp, .. } => *timestamp,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            DataFrame::Audio { stream_id, .. }
            | DataFrame::Video { stream_id, .. }
            | DataFrame::Metadata { stream_id, .. } => *stream_id,
        }
    }
}

pub type DataStream = MessageStream<DataFrame>;

impl DataStream {
    /// Data stream using the standard frame parser and chunker.
    pub fn with_defaults(chunks: mpsc::Receiver<Chunk>, writer: Arc<dyn ChunkWriter>) -> Self {
        MessageStream::new(chunks, writer, DataParser, DataChunker)
    }

    /// Writes a frame back to the peer. Same as [`MessageStream::send`].
    pub async fn write(&self, frame: &DataFrame) -> Result<()> {
        self.send(frame).await
    }
}

pub(crate) fn decode_amf0(payload: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut cursor = Cursor::new(payload);
    rml_amf0::deserialize(&mut cursor)
        .map_err(|e| RtmpError::Amf0(format!("AMF0 deserialization error: {:?}", e)))
}

pub(crate) fn encode_amf0(values: &Vec<Amf0Value>) -> Result<Vec<u8>> {
    rml_amf0::serialize(values).map_err(|e| RtmpError::Amf0(format!("serialize error: {:?}", e)))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DataParser;

impl Parser<DataFrame> for DataParser {
    fn parse(&self, chunk: &Chunk) -> Result<DataFrame> {
        let header = &chunk.header;
        match chunk.message_type()? {
            MessageType::Audio | MessageType::Video if chunk.data.is_empty() => {
                Err(RtmpError::Decode("Empty media payload".to_string()))
            }
            MessageType::Audio => Ok(DataFrame::Audio {
                timestamp: header.timestamp,
                stream_id: header.message_stream_id,
                payload: chunk.data.clone(),
            }),
            MessageType::Video => Ok(DataFrame::Video {
                timestamp: header.timestamp,
                stream_id: header.message_stream_id,
                payload: chunk.data.clone(),
            }),
            MessageType::DataAmf0 | MessageType::DataAmf3 => {
                // AMF3 data messages lead with a format byte, then carry AMF0.
                let payload = match chunk.message_type()? {
                    MessageType::DataAmf3 => chunk.data.get(1..).unwrap_or_default(),
                    _ => &chunk.data[..],
                };
                let values = decode_amf0(payload)?;
                if values.is_empty() {
                    return Err(RtmpError::Decode("Empty data message".to_string()));
                }
                Ok(DataFrame::Metadata {
                    timestamp: header.timestamp,
                    stream_id: header.message_stream_id,
                    values,
                })
            }
            other => Err(RtmpError::Decode(format!("Not a data message: {:?}", other))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DataChunker;

impl Chunker<DataFrame> for DataChunker {
    fn chunk(&self, frame: &DataFrame) -> Result<Chunk> {
        let (chunk_stream_id, message_type, data) = match frame {
            DataFrame::Audio { payload, .. } => {
                (AUDIO_CHUNK_STREAM, MessageType::Audio, payload.clone())
            }
            DataFrame::Video { payload, .. } => {
                (VIDEO_CHUNK_STREAM, MessageType::Video, payload.clone())
            }
            DataFrame::Metadata { values, .. } => (
                DATA_CHUNK_STREAM,
                MessageType::DataAmf0,
                Bytes::from(encode_amf0(values)?),
            ),
        };

        let header = ChunkHeader::new(chunk_stream_id, message_type, frame.stream_id())
            .with_timestamp(frame.timestamp());
        Ok(Chunk::new(header, data))
    }
}
