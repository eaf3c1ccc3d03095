use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::utils::error::RtmpError;
use crate::utils::types::{
    Chunk, ChunkHeader, MessageType, Result, DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP,
    MAX_CHUNK_SIZE, MAX_MESSAGE_LENGTH,
};

/// Highest chunk stream id a three-byte basic header can carry.
const MAX_CHUNK_STREAM_ID: u32 = 65599;

/// Per chunk stream reassembly state.
struct StreamState {
    header: ChunkHeader,
    extended: bool,
    buffer: BytesMut,
}

/// Frames RTMP chunks on one TCP connection.
///
/// Decoding reassembles the interleaved chunk streams into complete
/// messages, one [`Chunk`] each. Encoding writes a format 0 chunk followed
/// by format 3 continuations split at the write chunk size. Set Chunk Size
/// messages passing through either direction update the matching size.
pub struct ChunkCodec {
    read_chunk_size: usize,
    write_chunk_size: usize,
    streams: HashMap<u32, StreamState>,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCodec {
    pub fn new() -> Self {
        Self {
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            write_chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    pub fn write_chunk_size(&self) -> usize {
        self.write_chunk_size
    }

    fn apply_inbound(&mut self, chunk: &Chunk) {
        match MessageType::try_from(chunk.header.message_type) {
            Ok(MessageType::SetChunkSize) => match chunk_size_from(&chunk.data) {
                Some(size) => {
                    debug!("Peer set chunk size to: {}", size);
                    self.read_chunk_size = size;
                }
                None => warn!("Ignoring invalid inbound chunk size message"),
            },
            Ok(MessageType::Abort) if chunk.data.len() >= 4 => {
                let data = &chunk.data;
                let chunk_stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                if let Some(state) = self.streams.get_mut(&chunk_stream_id) {
                    debug!("Aborting partial message on chunk stream {}", chunk_stream_id);
                    state.buffer.clear();
                }
            }
            _ => {}
        }
    }
}

fn chunk_size_from(data: &[u8]) -> Option<usize> {
    if data.len() < 4 {
        return None;
    }
    let size = (u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7FFF_FFFF) as usize;
    (1..=MAX_CHUNK_SIZE).contains(&size).then_some(size)
}

fn read_u24(data: &[u8]) -> u32 {
    u32::from_be_bytes([0, data[0], data[1], data[2]])
}

/// Parses the 1-3 byte basic header, returning (format, chunk stream id, length).
fn parse_basic_header(data: &[u8]) -> Option<(u8, u32, usize)> {
    let first_byte = *data.first()?;
    let format = (first_byte >> 6) & 0x03;
    match (first_byte & 0x3F) as u32 {
        0 => {
            let ext = data.get(1)?;
            Some((format, (*ext as u32) + 64, 2))
        }
        1 => {
            let ext = data.get(1..3)?;
            Some((format, (ext[0] as u32) + ((ext[1] as u32) << 8) + 64, 3))
        }
        chunk_stream_id => Some((format, chunk_stream_id, 1)),
    }
}

fn put_basic_header(dst: &mut BytesMut, format: u8, chunk_stream_id: u32) {
    let format = format << 6;
    match chunk_stream_id {
        2..=63 => dst.put_u8(format | chunk_stream_id as u8),
        64..=319 => {
            dst.put_u8(format);
            dst.put_u8((chunk_stream_id - 64) as u8);
        }
        _ => {
            let id = chunk_stream_id - 64;
            dst.put_u8(format | 1);
            dst.put_u8((id & 0xFF) as u8);
            dst.put_u8((id >> 8) as u8);
        }
    }
}

impl Decoder for ChunkCodec {
    type Item = Chunk;
    type Error = RtmpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Chunk>> {
        loop {
            let Some((format, chunk_stream_id, mut offset)) = parse_basic_header(&src[..]) else {
                return Ok(None);
            };

            let message_header_size = match format {
                0 => 11, // timestamp(3) + length(3) + type(1) + stream_id(4)
                1 => 7,  // timestamp_delta(3) + length(3) + type(1)
                2 => 3,  // timestamp_delta(3)
                _ => 0,  // no additional header
            };
            if src.len() < offset + message_header_size {
                return Ok(None);
            }

            let previous = self
                .streams
                .get(&chunk_stream_id)
                .map(|state| (state.header.clone(), state.extended, state.buffer.len()));
            let prev = match (&previous, format) {
                (_, 0) => None,
                (Some((header, _, _)), _) => Some(header),
                (None, _) => {
                    return Err(RtmpError::InvalidChunk(format!(
                        "format {} chunk on unknown chunk stream {}",
                        format, chunk_stream_id
                    )))
                }
            };

            let mut fields = [0u8; 11];
            fields[..message_header_size].copy_from_slice(&src[offset..offset + message_header_size]);
            let timestamp_field = if message_header_size >= 3 { read_u24(&fields) } else { 0 };
            let extended = match format {
                3 => previous.as_ref().map_or(false, |(_, extended, _)| *extended),
                _ => timestamp_field == EXTENDED_TIMESTAMP,
            };
            offset += message_header_size;

            let mut timestamp = timestamp_field;
            if extended {
                let Some(ext) = src.get(offset..offset + 4) else {
                    return Ok(None);
                };
                timestamp = u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]);
                offset += 4;
            }

            let header = match (format, prev) {
                (0, _) => ChunkHeader {
                    format,
                    chunk_stream_id,
                    timestamp,
                    message_length: read_u24(&fields[3..6]),
                    message_type: fields[6],
                    message_stream_id: u32::from_le_bytes([
                        fields[7], fields[8], fields[9], fields[10],
                    ]),
                },
                (1, Some(prev)) => ChunkHeader {
                    format,
                    chunk_stream_id,
                    timestamp: prev.timestamp.wrapping_add(timestamp),
                    message_length: read_u24(&fields[3..6]),
                    message_type: fields[6],
                    message_stream_id: prev.message_stream_id,
                },
                (2, Some(prev)) => ChunkHeader {
                    format,
                    timestamp: prev.timestamp.wrapping_add(timestamp),
                    ..prev.clone()
                },
                (_, Some(prev)) => ChunkHeader {
                    format,
                    ..prev.clone()
                },
                (_, None) => return Err(RtmpError::InvalidChunk("missing previous header".into())),
            };

            // Only format 3 chunks continue a partially received message.
            let buffered = match (format, &previous) {
                (3, Some((_, _, buffered))) => *buffered,
                _ => 0,
            };
            let remaining = (header.message_length as usize).saturating_sub(buffered);
            let payload_size = remaining.min(self.read_chunk_size);
            if src.len() < offset + payload_size {
                src.reserve(offset + payload_size - src.len());
                return Ok(None);
            }

            src.advance(offset);
            let payload = src.split_to(payload_size);

            let state = self
                .streams
                .entry(chunk_stream_id)
                .or_insert_with(|| StreamState {
                    header: header.clone(),
                    extended,
                    buffer: BytesMut::new(),
                });
            if format != 3 && !state.buffer.is_empty() {
                warn!(
                    "Discarding {} bytes of incomplete message on chunk stream {}",
                    state.buffer.len(),
                    chunk_stream_id
                );
                state.buffer.clear();
            }
            state.header = header.clone();
            state.extended = extended;
            state.buffer.extend_from_slice(&payload);

            if state.buffer.len() >= header.message_length as usize {
                let data = state.buffer.split().freeze();
                debug!(
                    "Complete message: stream_id={}, type={}, length={}",
                    chunk_stream_id, header.message_type, header.message_length
                );
                let chunk = Chunk { header, data };
                self.apply_inbound(&chunk);
                return Ok(Some(chunk));
            }
        }
    }
}

impl Encoder<Chunk> for ChunkCodec {
    type Error = RtmpError;

    fn encode(&mut self, chunk: Chunk, dst: &mut BytesMut) -> Result<()> {
        let Chunk { header, data } = chunk;
        if data.len() > MAX_MESSAGE_LENGTH {
            return Err(RtmpError::Encode(format!(
                "message of {} bytes exceeds the maximum length",
                data.len()
            )));
        }
        if !(2..=MAX_CHUNK_STREAM_ID).contains(&header.chunk_stream_id) {
            return Err(RtmpError::Encode(format!(
                "invalid chunk stream id {}",
                header.chunk_stream_id
            )));
        }

        let extended = header.timestamp >= EXTENDED_TIMESTAMP;
        let pieces = data.len().div_ceil(self.write_chunk_size).max(1);
        dst.reserve(data.len() + 18 + pieces * 7);

        put_basic_header(dst, 0, header.chunk_stream_id);
        dst.put_uint(header.timestamp.min(EXTENDED_TIMESTAMP) as u64, 3);
        dst.put_uint(data.len() as u64, 3);
        dst.put_u8(header.message_type);
        dst.put_u32_le(header.message_stream_id);
        if extended {
            dst.put_u32(header.timestamp);
        }

        for (i, piece) in data.chunks(self.write_chunk_size).enumerate() {
            if i > 0 {
                put_basic_header(dst, 3, header.chunk_stream_id);
                if extended {
                    dst.put_u32(header.timestamp);
                }
            }
            dst.extend_from_slice(piece);
        }

        if header.message_type == MessageType::SetChunkSize as u8 {
            if let Some(size) = chunk_size_from(&data) {
                debug!("Outbound chunk size set to: {}", size);
                self.write_chunk_size = size;
            }
        }

        Ok(())
    }
}
