use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::codec::ChunkCodec;
use crate::chunk::writer::{ChunkWriter, FramedChunkWriter};
use crate::server::client::Client;
use crate::stream::command::CommandStream;
use crate::stream::control::{ControlMessage, ControlStream};
use crate::stream::data::DataStream;
use crate::stream::message::MessageStream;
use crate::utils::error::RtmpError;
use crate::utils::types::{Channel, Chunk, Config, Result};

/// Chunks buffered per sub-channel between the socket reader and its relay.
const ROUTE_CAPACITY: usize = 16;

/// Drives one accepted client: reads chunks off the socket and fans them
/// out to the control, data and command streams.
pub struct Session {
    client: Client,
    config: Config,
}

impl Session {
    pub fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    /// Runs until the peer disconnects, the chunk framing breaks, or too
    /// many messages in a row fail to decode.
    pub async fn run(self) -> Result<()> {
        let chunk_size = u32::try_from(self.config.chunk_size).map_err(|_| {
            RtmpError::Protocol(format!("Chunk size {} out of range", self.config.chunk_size))
        })?;

        let (stream, addr) = self.client.into_parts();
        let (read_half, write_half) = stream.into_split();
        let writer: Arc<dyn ChunkWriter> = Arc::new(FramedChunkWriter::new(write_half));
        let mut chunks = FramedRead::new(read_half, ChunkCodec::new());

        let (control_tx, control_rx) = mpsc::channel(ROUTE_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(ROUTE_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(ROUTE_CAPACITY);
        let routes = Routes {
            control: control_tx,
            data: data_tx,
            command: command_tx,
        };

        let mut control = ControlStream::with_defaults(control_rx, Arc::clone(&writer));
        let mut data = DataStream::with_defaults(data_rx, Arc::clone(&writer));
        let mut commands = CommandStream::with_defaults(command_rx, Arc::clone(&writer));

        let health = Health::new(self.config.max_consecutive_errors);
        let monitors = [
            monitor(addr, "control", &mut control, &health)?,
            monitor(addr, "data", &mut data, &health)?,
            monitor(addr, "command", &mut commands, &health)?,
        ];
        control.start()?;
        data.start()?;
        commands.start()?;

        info!("Session started for {}", addr);
        let result = match control.send(&ControlMessage::SetChunkSize(chunk_size)).await {
            Ok(()) => route(addr, &mut chunks, &routes, &health).await,
            Err(e) => Err(e),
        };

        drop(routes);
        control.close().await;
        data.close().await;
        commands.close().await;
        for handle in monitors {
            if let Err(e) = handle.await {
                warn!("Feed monitor for {} failed: {}", addr, e);
            }
        }

        info!("Session ended for {}", addr);
        result
    }
}

struct Routes {
    control: mpsc::Sender<Chunk>,
    data: mpsc::Sender<Chunk>,
    command: mpsc::Sender<Chunk>,
}

impl Routes {
    fn for_chunk(&self, chunk: &Chunk) -> Option<&mpsc::Sender<Chunk>> {
        match chunk.message_type().ok()?.channel()? {
            Channel::Control => Some(&self.control),
            Channel::Data => Some(&self.data),
            Channel::Command => Some(&self.command),
        }
    }
}

/// Decode-error policy shared by a session's streams. Each stream keeps its
/// own [`Streak`]; the first one to reach the limit ends the session.
struct Health {
    limit: u32,
    exhausted: CancellationToken,
}

impl Health {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            exhausted: CancellationToken::new(),
        }
    }

    fn streak(&self) -> Streak {
        Streak {
            errors: 0,
            limit: self.limit,
        }
    }
}

/// Consecutive decode failures on one stream, in the order its monitor
/// observes them.
struct Streak {
    errors: u32,
    limit: u32,
}

impl Streak {
    fn success(&mut self) {
        self.errors = 0;
    }

    /// Returns true once the limit is reached.
    fn failure(&mut self) -> bool {
        self.errors = self.errors.saturating_add(1);
        self.errors >= self.limit
    }
}

async fn route(
    addr: SocketAddr,
    chunks: &mut FramedRead<OwnedReadHalf, ChunkCodec>,
    routes: &Routes,
    health: &Health,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = health.exhausted.cancelled() => {
                warn!("Too many consecutive decode errors from {}, closing", addr);
                return Ok(());
            }
            next = chunks.next() => next,
        };

        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!("Chunk stream from {} is broken: {}", addr, e);
                return Err(e);
            }
            None => {
                debug!("{} closed the connection", addr);
                return Ok(());
            }
        };

        let Some(route) = routes.for_chunk(&chunk) else {
            debug!(
                "Dropping message type {} from {}",
                chunk.header.message_type, addr
            );
            continue;
        };

        tokio::select! {
            biased;
            _ = health.exhausted.cancelled() => {}
            sent = route.send(chunk) => {
                if sent.is_err() {
                    debug!("Sub-channel for {} already closed", addr);
                    return Ok(());
                }
            }
        }
    }
}

/// Logs whatever a stream produces and trips `health` when its error streak runs out.
fn monitor<M>(
    addr: SocketAddr,
    name: &'static str,
    stream: &mut MessageStream<M>,
    health: &Health,
) -> Result<JoinHandle<()>>
where
    M: Debug + Send + 'static,
{
    let (Some(mut messages), Some(mut errors)) = (stream.messages(), stream.errors()) else {
        return Err(RtmpError::Protocol(format!("{} feeds already taken", name)));
    };
    let exhausted = health.exhausted.clone();
    let mut streak = health.streak();

    Ok(tokio::spawn(async move {
        let (mut messages_open, mut errors_open) = (true, true);
        while messages_open || errors_open {
            tokio::select! {
                message = messages.recv(), if messages_open => match message {
                    Some(message) => {
                        streak.success();
                        debug!("{} {} message: {:?}", addr, name, message);
                    }
                    None => messages_open = false,
                },
                error = errors.recv(), if errors_open => match error {
                    Some(e) => {
                        warn!("Bad {} message from {}: {}", name, addr, e);
                        if streak.failure() {
                            exhausted.cancel();
                        }
                    }
                    None => errors_open = false,
                },
            }
        }
    }))
}
