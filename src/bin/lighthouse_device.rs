use std::{
    error::Error,
    net::SocketAddr,
    time::{Duration, Instant},
};

use clap::Parser;
use lighthouse::protocol::{
    Client, ClientConfig, ExecutePayload, ExecuteResponsePayload, ExecuteStatus,
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the Lighthouse server
    address: SocketAddr,
    /// Identifier this device registers under
    client_id: String,
    /// Seconds between keepalive pings
    #[arg(long)]
    keepalive: Option<u64>,
    /// Seconds allowed for dialing and the handshake
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::new(cli.address, cli.client_id).with_execute_handler(execute);
    if let Some(secs) = cli.keepalive.filter(|s| *s > 0) {
        config = config.with_keepalive(Duration::from_secs(secs));
    }

    let deadline = Instant::now() + Duration::from_secs(cli.connect_timeout);
    let client = Client::connect(config, deadline)?;
    info!("[{}] waiting for commands", client.client_id());

    client.wait();
    info!("server closed the connection");
    Ok(())
}

fn execute(payload: ExecutePayload) -> ExecuteResponsePayload {
    info!("EXECUTE {} command {}", payload.id, payload.command);
    let mut state = payload.params;
    state.insert("online".to_string(), true.into());
    ExecuteResponsePayload {
        id: payload.id,
        status: ExecuteStatus::Success,
        state,
    }
}
