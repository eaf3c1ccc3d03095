use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rml_amf0::Amf0Value;
use tokio::sync::mpsc;

use crate::chunk::writer::ChunkWriter;
use crate::stream::data::{decode_amf0, encode_amf0};
use crate::stream::message::{Chunker, MessageStream, Parser};
use crate::utils::error::RtmpError;
use crate::utils::types::{Chunk, ChunkHeader, MessageType, Result, COMMAND_CHUNK_STREAM};

/// An AMF0 command such as `connect`, `play` or `onStatus`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: Amf0Value,
    pub arguments: Vec<Amf0Value>,
    /// Message stream the command arrived on or is addressed to.
    pub stream_id: u32,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            command_object: Amf0Value::Null,
            arguments: Vec::new(),
            stream_id: 0,
        }
    }

    /// First string argument, which is where `play` and `publish` put the stream name.
    pub fn stream_name(&self) -> Option<&str> {
        self.arguments.iter().find_map(|value| match value {
            Amf0Value::Utf8String(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Status,
    Warning,
    Error,
}

impl StatusLevel {
    fn as_str(self) -> &'static str {
        match self {
            StatusLevel::Status => "status",
            StatusLevel::Warning => "warning",
            StatusLevel::Error => "error",
        }
    }
}

/// Payload of an `onStatus` command.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub level: StatusLevel,
    pub code: String,
    pub description: String,
}

impl Status {
    pub fn new(level: StatusLevel, code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level,
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn into_command(self, stream_id: u32) -> Command {
        let info: HashMap<String, Amf0Value> = [
            ("level", Amf0Value::Utf8String(self.level.as_str().into())),
            ("code", Amf0Value::Utf8String(self.code)),
            ("description", Amf0Value::Utf8String(self.description)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        Command {
            arguments: vec![Amf0Value::Object(info)],
            stream_id,
            ..Command::new("onStatus", 0.0)
        }
    }
}

pub type CommandStream = MessageStream<Command>;

impl CommandStream {
    /// Command stream using the standard AMF0 command parser and chunker.
    pub fn with_defaults(chunks: mpsc::Receiver<Chunk>, writer: Arc<dyn ChunkWriter>) -> Self {
        MessageStream::new(chunks, writer, CommandParser, CommandChunker)
    }

    /// Sends `status` to the peer as an `onStatus` command on `stream_id`.
    pub async fn write_status(&self, stream_id: u32, status: Status) -> Result<()> {
        self.send(&status.into_command(stream_id)).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandParser;

impl Parser<Command> for CommandParser {
    fn parse(&self, chunk: &Chunk) -> Result<Command> {
        let payload = match chunk.message_type()? {
            MessageType::CommandAmf0 => &chunk.data[..],
            // AMF3 commands lead with a format byte, then carry AMF0.
            MessageType::CommandAmf3 => chunk.data.get(1..).unwrap_or_default(),
            other => {
                return Err(RtmpError::Decode(format!(
                    "Not a command message: {:?}",
                    other
                )))
            }
        };

        let mut values = decode_amf0(payload)?.into_iter();
        let name = match values.next() {
            Some(Amf0Value::Utf8String(name)) => name,
            Some(other) => {
                return Err(RtmpError::Decode(format!(
                    "First AMF0 value is not a string: {:?}",
                    other
                )))
            }
            None => return Err(RtmpError::Decode("Empty AMF0 command".to_string())),
        };
        let transaction_id = match values.next() {
            Some(Amf0Value::Number(id)) => id,
            other => {
                return Err(RtmpError::Decode(format!(
                    "Command {} has no transaction id: {:?}",
                    name, other
                )))
            }
        };

        Ok(Command {
            name,
            transaction_id,
            command_object: values.next().unwrap_or(Amf0Value::Null),
            arguments: values.collect(),
            stream_id: chunk.header.message_stream_id,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandChunker;

impl Chunker<Command> for CommandChunker {
    fn chunk(&self, command: &Command) -> Result<Chunk> {
        let mut values = Vec::with_capacity(3 + command.arguments.len());
        values.push(Amf0Value::Utf8String(command.name.clone()));
        values.push(Amf0Value::Number(command.transaction_id));
        values.push(command.command_object.clone());
        values.extend(command.arguments.iter().cloned());

        let data = encode_amf0(&values)?;
        Ok(Chunk::new(
            ChunkHeader::new(COMMAND_CHUNK_STREAM, MessageType::CommandAmf0, command.stream_id),
            Bytes::from(data),
        ))
    }
}
