pub mod chunk {
    pub mod codec;
    pub mod writer;
}

pub mod stream {
    pub mod command;
    pub mod control;
    pub mod data;
    pub mod message;
}

pub mod server {
    pub mod client;
    pub mod error;
    pub mod listener;
    pub mod session;
}

pub mod utils {
    pub mod config;
    pub mod error;
    pub mod types;
}

pub use server::client::Client;
pub use server::error::ServerError;
pub use server::listener::{Server, State};
pub use stream::message::{Chunker, MessageStream, Parser};
pub use utils::error::RtmpError;
