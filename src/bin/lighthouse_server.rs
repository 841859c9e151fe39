use std::{
    error::Error,
    io::{self, Write},
    net::SocketAddr,
    process, thread,
    time::{Duration, Instant},
};

use clap::Parser;
use lighthouse::{
    Command, CommandError, prompt,
    protocol::{DEFAULT_ADDRESS, ExecutePayload, SendPayload, Server, ServerConfig, ServerHandle},
};
use log::{error, info};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for devices at address
    #[arg(default_value = DEFAULT_ADDRESS)]
    address: SocketAddr,
    /// Close sessions that stay silent for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,
    /// Refuse devices beyond this many sessions
    #[arg(long)]
    max_sessions: Option<usize>,
    /// Seconds to wait for a device to answer console commands
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        address: cli.address,
        idle_timeout: cli.idle_timeout.filter(|s| *s > 0).map(Duration::from_secs),
        max_sessions: cli.max_sessions,
        ..Default::default()
    };
    let server = Server::bind(config)?.with_send_handler(|client: &str, send: SendPayload| {
        info!("[{client}] SEND {} with {} bytes", send.id, send.data.len());
        Some(send.data)
    });
    let handle = server.handle();

    ctrlc::set_handler(|| {
        info!("interrupted, shutting down");
        process::exit(0);
    })?;

    thread::Builder::new()
        .name("listener".to_string())
        .spawn(move || {
            if let Err(e) = server.listen() {
                error!("listener stopped: {e}");
                process::exit(1);
            }
        })?;

    let timeout = Duration::from_secs(cli.timeout);
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(cmd) => cmd,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            cmd => run(&handle, cmd, Instant::now() + timeout, &mut stdout.lock())?,
        }
    }

    Ok(())
}

fn run<W: Write>(
    handle: &ServerHandle,
    cmd: Command,
    deadline: Instant,
    out: &mut W,
) -> io::Result<()> {
    match cmd {
        Command::Exit => {}
        Command::Sessions => {
            let ids = handle.client_ids();
            if ids.is_empty() {
                writeln!(out, "no devices connected")?;
            }
            for id in ids {
                writeln!(out, "{id}")?;
            }
        }
        Command::Disconnect(client) => {
            if handle.disconnect(&client) {
                writeln!(out, "disconnected {client}")?;
            } else {
                writeln!(out, "{client} is not connected")?;
            }
        }
        Command::Ping(client) => {
            let sent = Instant::now();
            match handle.ping(&client, deadline) {
                Ok(id) => writeln!(out, "PONG {id} from {client} in {:?}", sent.elapsed())?,
                Err(e) => writeln!(out, "ping failed: {e}")?,
            }
        }
        Command::Execute {
            client,
            command,
            params,
        } => {
            let payload = ExecutePayload {
                id: rand::random(),
                command,
                params,
            };
            match handle.execute(&client, payload, deadline) {
                Ok(response) => writeln!(
                    out,
                    "{:?} {}",
                    response.status,
                    serde_json::Value::Object(response.state)
                )?,
                Err(e) => writeln!(out, "{:?}: {e}", e.status())?,
            }
        }
    }
    Ok(())
}
