use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtmpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid chunk format: {0}")]
    InvalidChunk(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("AMF0 error: {0}")]
    Amf0(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("Stream already started")]
    AlreadyStarted,
}
