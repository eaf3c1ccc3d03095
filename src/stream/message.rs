use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chunk::writer::ChunkWriter;
use crate::utils::error::RtmpError;
use crate::utils::types::{Chunk, Result};

/// Capacity of the produced-message and error feeds. A single slot keeps
/// the relay in lock step with its consumer.
const FEED_CAPACITY: usize = 1;

/// Turns one inbound chunk into a decoded message.
pub trait Parser<M>: Send + Sync {
    fn parse(&self, chunk: &Chunk) -> Result<M>;
}

/// Turns an outbound message into a chunk ready for a [`ChunkWriter`].
pub trait Chunker<M>: Send + Sync {
    fn chunk(&self, message: &M) -> Result<Chunk>;
}

/// Everything the relay task owns once started.
struct Relay<M> {
    chunks: mpsc::Receiver<Chunk>,
    parser: Box<dyn Parser<M>>,
    messages: mpsc::Sender<M>,
    errors: mpsc::Sender<RtmpError>,
    shutdown: CancellationToken,
}

/// A bi-directional RTMP sub-channel.
///
/// Inbound chunks are parsed on a dedicated task and published either on
/// the message feed or, when parsing fails, on the error feed. A bad chunk
/// never ends the stream. Outbound messages go through [`MessageStream::send`],
/// which is independent of the relay task.
///
/// Both feeds close exactly once, when the relay task exits, which happens
/// after [`MessageStream::close`] or when the chunk source is exhausted.
pub struct MessageStream<M> {
    relay: Option<Relay<M>>,
    messages: Option<mpsc::Receiver<M>>,
    errors: Option<mpsc::Receiver<RtmpError>>,
    chunker: Box<dyn Chunker<M>>,
    writer: Arc<dyn ChunkWriter>,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

impl<M: Send + 'static> MessageStream<M> {
    /// Creates a stream that is ready but not yet running.
    pub fn new(
        chunks: mpsc::Receiver<Chunk>,
        writer: Arc<dyn ChunkWriter>,
        parser: impl Parser<M> + 'static,
        chunker: impl Chunker<M> + 'static,
    ) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(FEED_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(FEED_CAPACITY);
        let shutdown = CancellationToken::new();

        Self {
            relay: Some(Relay {
                chunks,
                parser: Box::new(parser),
                messages: messages_tx,
                errors: errors_tx,
                shutdown: shutdown.clone(),
            }),
            messages: Some(messages_rx),
            errors: Some(errors_rx),
            chunker: Box::new(chunker),
            writer,
            shutdown,
            finished: CancellationToken::new(),
        }
    }

    /// Replaces the parser. Only possible before [`start`](Self::start).
    pub fn set_parser(&mut self, parser: impl Parser<M> + 'static) -> Result<()> {
        let relay = self.relay.as_mut().ok_or(RtmpError::AlreadyStarted)?;
        relay.parser = Box::new(parser);
        Ok(())
    }

    /// Feed of decoded messages in chunk arrival order. Handed out once.
    pub fn messages(&mut self) -> Option<mpsc::Receiver<M>> {
        self.messages.take()
    }

    /// Feed of parse errors in chunk arrival order. Handed out once.
    pub fn errors(&mut self) -> Option<mpsc::Receiver<RtmpError>> {
        self.errors.take()
    }

    /// Encodes `message` and writes it out, returning the first failure.
    pub async fn send(&self, message: &M) -> Result<()> {
        let chunk = self.chunker.chunk(message)?;
        self.writer.write(chunk).await
    }

    /// Spawns the relay task.
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        let relay = self.relay.take().ok_or(RtmpError::AlreadyStarted)?;
        let finished = self.finished.clone();

        Ok(tokio::spawn(async move {
            let _finished = finished.drop_guard();
            relay.run().await;
        }))
    }

    /// Stops the relay task and waits for it to exit.
    ///
    /// Safe to call any number of times, and returns straight away if the
    /// task already stopped on its own.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if self.relay.is_none() {
            self.finished.cancelled().await;
        }
    }

    /// True once the relay task has exited.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

impl<M: Send + 'static> Relay<M> {
    async fn run(mut self) {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Message stream closed");
                    break;
                }
                chunk = self.chunks.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => {
                        debug!("Chunk source exhausted");
                        break;
                    }
                },
            };

            let delivered = match self.parser.parse(&chunk) {
                Ok(message) => publish(&self.messages, message, &self.shutdown).await,
                Err(e) => {
                    debug!(
                        "Failed to parse chunk on stream {}: {}",
                        chunk.header.chunk_stream_id, e
                    );
                    publish(&self.errors, e, &self.shutdown).await
                }
            };
            if !delivered {
                break;
            }
        }
    }
}

/// Hands `item` to the consumer, giving up if the stream is closed first.
async fn publish<T>(feed: &mpsc::Sender<T>, item: T, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = feed.send(item) => {
            if sent.is_err() {
                trace!("Feed dropped by consumer, discarding item");
            }
            true
        }
    }
}
