use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::chunk::codec::ChunkCodec;
use crate::utils::types::{Chunk, Result};

/// Pushes outbound chunks onto the wire.
///
/// Implementations are shared between a message stream and any external
/// callers of `send`, so they synchronize their own writes.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    async fn write(&self, chunk: Chunk) -> Result<()>;
}

/// Discards everything written to it.
pub struct NoopWriter;

#[async_trait]
impl ChunkWriter for NoopWriter {
    async fn write(&self, _chunk: Chunk) -> Result<()> {
        Ok(())
    }
}

/// Writes chunks through a [`ChunkCodec`] onto any async writer, flushing
/// after every message.
pub struct FramedChunkWriter<W> {
    sink: Mutex<FramedWrite<W, ChunkCodec>>,
}

impl<W: AsyncWrite + Unpin + Send> FramedChunkWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            sink: Mutex::new(FramedWrite::new(writer, ChunkCodec::new())),
        }
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner().into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkWriter for FramedChunkWriter<W> {
    async fn write(&self, chunk: Chunk) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::RtmpError;
    use crate::utils::types::{ChunkHeader, MessageType, COMMAND_CHUNK_STREAM};
    use bytes::BytesMut;
    use tokio_util::codec::Encoder;

    fn command_chunk(len: usize) -> Chunk {
        Chunk::new(
            ChunkHeader::new(COMMAND_CHUNK_STREAM, MessageType::CommandAmf0, 0),
            vec![0x02; len],
        )
    }

    #[tokio::test]
    async fn writes_encoded_chunks() {
        let chunk = command_chunk(200);
        let mut expected = BytesMut::new();
        ChunkCodec::new().encode(chunk.clone(), &mut expected).unwrap();

        let socket = tokio_test::io::Builder::new().write(&expected).build();
        let writer = FramedChunkWriter::new(socket);
        writer.write(chunk).await.unwrap();
    }

    #[tokio::test]
    async fn codec_state_persists_between_writes() {
        let writer = FramedChunkWriter::new(Vec::new());
        writer.write(command_chunk(10)).await.unwrap();
        writer.write(command_chunk(20)).await.unwrap();

        let written = writer.into_inner();
        assert_eq!(written.len(), 10 + 12 + 20 + 12);
    }

    #[tokio::test]
    async fn surfaces_io_failures() {
        let socket = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let writer = FramedChunkWriter::new(socket);

        let err = writer.write(command_chunk(4)).await.unwrap_err();
        assert!(matches!(err, RtmpError::Io(_)));
    }
}
