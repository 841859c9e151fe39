//! Operator console for the Lighthouse server.
//!
//! The console reads one command per line and drives connected devices
//! through a [`ServerHandle`](crate::protocol::ServerHandle):
//!
//! - `.exit`: Stop the server.
//! - `.sessions`: List connected client IDs.
//! - `ping <client>`: Round-trip a PING to a device.
//! - `disconnect <client>`: Close a device's session.
//! - `execute <client> <command> [json]`: Run a device command. The JSON
//!   parameters default to `{}`.
//!
//! # Example
//! ```rust
//! use lighthouse::cli::Command;
//!
//! let cmd: Command = "ping kitchen-light".try_into().unwrap();
//! assert_eq!(cmd, Command::Ping("kitchen-light".to_string()));
//! ```
use std::io::{self, BufRead, Write};

use serde_json::Value;
use thiserror::Error;

use crate::protocol::JsonObject;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("console IO error: {0}")]
    Io(#[from] io::Error),
}

/// Commands an operator can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Stop the server and exit.
    Exit,
    /// List connected sessions.
    Sessions,
    /// PING the named client.
    Ping(String),
    /// Close the named client's session.
    Disconnect(String),
    /// Send an EXECUTE to the named client.
    Execute {
        client: String,
        command: u32,
        params: JsonObject,
    },
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word {
            "" => Err(CommandError::Empty),
            ".exit" => Ok(Command::Exit),
            ".sessions" => Ok(Command::Sessions),
            "ping" => Ok(Command::Ping(single_client("ping", rest)?)),
            "disconnect" => Ok(Command::Disconnect(single_client("disconnect", rest)?)),
            "execute" => parse_execute(rest),
            s => Err(CommandError::UnrecognizedCommand(s.to_string())),
        }
    }
}

fn single_client(command: &str, args: &str) -> Result<String, CommandError> {
    if args.is_empty() || args.contains(char::is_whitespace) {
        return Err(invalid(
            command,
            &format!("requires one client id. Example: {command} lamp-1"),
        ));
    }
    Ok(args.to_string())
}

fn parse_execute(args: &str) -> Result<Command, CommandError> {
    const USAGE: &str = "requires client id and command number. Example: execute lamp-1 1 {\"on\": true}";

    let mut parts = args.splitn(3, char::is_whitespace);
    let (Some(client), Some(command)) = (parts.next().filter(|s| !s.is_empty()), parts.next())
    else {
        return Err(invalid("execute", USAGE));
    };
    let command = command.parse::<u32>().map_err(|_| {
        invalid(
            "execute",
            "command should be a non-negative 32-bit integer.",
        )
    })?;

    let params = match parts.next().map(str::trim).unwrap_or_default() {
        "" => JsonObject::new(),
        json => match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(params)) => params,
            Ok(Value::Null) => JsonObject::new(),
            Ok(_) => return Err(invalid("execute", "parameters should be a JSON object.")),
            Err(e) => return Err(invalid("execute", &format!("invalid JSON parameters: {e}"))),
        },
    };

    Ok(Command::Execute {
        client: client.to_string(),
        command,
        params,
    })
}

fn invalid(command: &str, reason: &str) -> CommandError {
    CommandError::InvalidCommandArguments {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

/// Prompt the operator for a command. End of input reads as [`Command::Exit`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    write!(&mut writer, "> ")?;
    writer.flush()?;

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(Command::Exit);
    }
    line.as_str().try_into()
}
