use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::chunk::writer::ChunkWriter;
use crate::stream::message::{Chunker, MessageStream, Parser};
use crate::utils::error::RtmpError;
use crate::utils::types::{Chunk, ChunkHeader, MessageType, Result, CONTROL_CHUNK_STREAM};

/// RTMP protocol control messages and user control events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SetChunkSize(u32),
    Abort { chunk_stream_id: u32 },
    Acknowledgement { sequence_number: u32 },
    UserControl { event_type: u16, data: Bytes },
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
}

pub type ControlStream = MessageStream<ControlMessage>;

impl ControlStream {
    /// Control stream using the standard control parser and chunker.
    pub fn with_defaults(chunks: mpsc::Receiver<Chunk>, writer: Arc<dyn ChunkWriter>) -> Self {
        MessageStream::new(chunks, writer, ControlParser, ControlChunker)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ControlParser;

fn read_u32(payload: &[u8], what: &str) -> Result<u32> {
    if payload.len() < 4 {
        return Err(RtmpError::Decode(format!("Invalid {} message", what)));
    }
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

impl Parser<ControlMessage> for ControlParser {
    fn parse(&self, chunk: &Chunk) -> Result<ControlMessage> {
        let payload = &chunk.data[..];
        match chunk.message_type()? {
            MessageType::SetChunkSize => {
                let chunk_size = read_u32(payload, "chunk size")?;
                if chunk_size == 0 || chunk_size & 0x8000_0000 != 0 {
                    return Err(RtmpError::Decode(format!(
                        "Invalid chunk size: {}",
                        chunk_size
                    )));
                }
                Ok(ControlMessage::SetChunkSize(chunk_size))
            }
            MessageType::Abort => Ok(ControlMessage::Abort {
                chunk_stream_id: read_u32(payload, "abort")?,
            }),
            MessageType::Acknowledgement => Ok(ControlMessage::Acknowledgement {
                sequence_number: read_u32(payload, "acknowledgement")?,
            }),
            MessageType::UserControl => {
                if payload.len() < 2 {
                    return Err(RtmpError::Decode(
                        "Invalid user control message".to_string(),
                    ));
                }
                Ok(ControlMessage::UserControl {
                    event_type: u16::from_be_bytes([payload[0], payload[1]]),
                    data: chunk.data.slice(2..),
                })
            }
            MessageType::WindowAckSize => Ok(ControlMessage::WindowAckSize(read_u32(
                payload,
                "window ack size",
            )?)),
            MessageType::SetPeerBandwidth => {
                if payload.len() < 5 {
                    return Err(RtmpError::Decode(
                        "Invalid peer bandwidth message".to_string(),
                    ));
                }
                Ok(ControlMessage::SetPeerBandwidth {
                    size: read_u32(payload, "peer bandwidth")?,
                    limit_type: payload[4],
                })
            }
            other => Err(RtmpError::Decode(format!(
                "Not a control message: {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ControlChunker;

impl Chunker<ControlMessage> for ControlChunker {
    fn chunk(&self, message: &ControlMessage) -> Result<Chunk> {
        let mut payload = BytesMut::with_capacity(6);
        let message_type = match message {
            ControlMessage::SetChunkSize(size) => {
                if *size == 0 || size & 0x8000_0000 != 0 {
                    return Err(RtmpError::Encode(format!("Invalid chunk size: {}", size)));
                }
                payload.put_u32(*size);
                MessageType::SetChunkSize
            }
            ControlMessage::Abort { chunk_stream_id } => {
                payload.put_u32(*chunk_stream_id);
                MessageType::Abort
            }
            ControlMessage::Acknowledgement { sequence_number } => {
                payload.put_u32(*sequence_number);
                MessageType::Acknowledgement
            }
            ControlMessage::UserControl { event_type, data } => {
                payload.put_u16(*event_type);
                payload.extend_from_slice(data);
                MessageType::UserControl
            }
            ControlMessage::WindowAckSize(size) => {
                payload.put_u32(*size);
                MessageType::WindowAckSize
            }
            ControlMessage::SetPeerBandwidth { size, limit_type } => {
                payload.put_u32(*size);
                payload.put_u8(*limit_type);
                MessageType::SetPeerBandwidth
            }
        };

        Ok(Chunk::new(
            ChunkHeader::new(CONTROL_CHUNK_STREAM, message_type, 0),
            payload.freeze(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_chunk(message_type: MessageType, payload: &[u8]) -> Chunk {
        Chunk::new(
            ChunkHeader::new(CONTROL_CHUNK_STREAM, message_type, 0),
            payload.to_vec(),
        )
    }

    #[test]
    fn parses_protocol_control_messages() {
        let parser = ControlParser;
        let cases = [
            (
                control_chunk(MessageType::SetChunkSize, &[0, 0, 0x10, 0]),
                ControlMessage::SetChunkSize(4096),
            ),
            (
                control_chunk(MessageType::WindowAckSize, &[0, 0x26, 0x25, 0xA0]),
                ControlMessage::WindowAckSize(2_500_000),
            ),
            (
                control_chunk(MessageType::SetPeerBandwidth, &[0, 0x26, 0x25, 0xA0, 2]),
                ControlMessage::SetPeerBandwidth {
                    size: 2_500_000,
                    limit_type: 2,
                },
            ),
            (
                control_chunk(MessageType::UserControl, &[0, 0, 0, 0, 0, 1]),
                ControlMessage::UserControl {
                    event_type: 0,
                    data: Bytes::from_static(&[0, 0, 0, 1]),
                },
            ),
        ];

        for (chunk, expected) in cases {
            assert_eq!(parser.parse(&chunk).unwrap(), expected);
        }
    }

    #[test]
    fn rejects_truncated_and_foreign_messages() {
        let parser = ControlParser;
        assert!(parser
            .parse(&control_chunk(MessageType::Acknowledgement, &[0, 1]))
            .is_err());
        assert!(parser
            .parse(&control_chunk(MessageType::SetChunkSize, &[0x80, 0, 0, 1]))
            .is_err());
        assert!(parser.parse(&control_chunk(MessageType::Audio, &[0xAF])).is_err());

        let mut unknown = control_chunk(MessageType::Abort, &[0, 0, 0, 1]);
        unknown.header.message_type = 7;
        assert!(matches!(parser.parse(&unknown), Err(RtmpError::Protocol(_))));
    }

    #[test]
    fn chunker_targets_the_control_chunk_stream() {
        let chunk = ControlChunker
            .chunk(&ControlMessage::SetPeerBandwidth {
                size: 5_000_000,
                limit_type: 2,
            })
            .unwrap();

        assert_eq!(chunk.header.chunk_stream_id, CONTROL_CHUNK_STREAM);
        assert_eq!(chunk.header.message_stream_id, 0);
        assert_eq!(chunk.header.message_type, MessageType::SetPeerBandwidth as u8);
        assert_eq!(&chunk.data[..], &[0, 0x4C, 0x4B, 0x40, 2]);
        assert!(ControlChunker.chunk(&ControlMessage::SetChunkSize(0)).is_err());
    }
}
