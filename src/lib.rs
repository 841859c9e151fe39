pub mod cli;
pub mod protocol;

pub use cli::{Command, CommandError, prompt};
pub use protocol::{Client, ClientConfig, Server, ServerConfig, ServerHandle};
