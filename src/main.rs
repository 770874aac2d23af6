//! Entry point for `tcp-sim`.
//!
//! Wires one simulated channel, one demultiplexer and two endpoints, then
//! runs a single exchange: the server listens, the client connects and
//! sends a message, both sides close.  All protocol work is delegated to the
//! library; `main.rs` owns only process setup (logging, argument parsing).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tcp_sim::{
    ChannelConfig, ConnectionEndpoint, ConnectionState, Demultiplexer, EndpointConfig,
    SimulatedChannel,
};

/// TCP-like reliable byte stream over a simulated lossy channel.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Probability in [0, 1] that the channel drops a segment.
    #[arg(short, long, default_value_t = 0.0)]
    loss: f64,

    /// Text the client sends to the server.
    #[arg(short, long, default_value = "Hello world!")]
    message: String,

    #[arg(long, default_value_t = 10)]
    client_port: u16,

    #[arg(long, default_value_t = 20)]
    server_port: u16,

    /// Seed for the loss model; omit for a different pattern every run.
    #[arg(long)]
    seed: Option<u64>,

    /// Retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    rto_ms: u64,

    /// Retransmissions before a connection is abandoned.
    #[arg(long, default_value_t = 5)]
    max_retries: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> tcp_sim::Result<()> {
    let channel = Arc::new(SimulatedChannel::new(ChannelConfig {
        drop_probability: cli.loss,
        seed: cli.seed,
        ..ChannelConfig::default()
    })?);
    let config = EndpointConfig {
        rto: Duration::from_millis(cli.rto_ms),
        max_retries: cli.max_retries,
        ..EndpointConfig::default()
    };

    let demux = Arc::new(Demultiplexer::new(Arc::clone(&channel)));
    let client = ConnectionEndpoint::new(cli.client_port, Arc::clone(&channel), config.clone())?;
    let server = ConnectionEndpoint::new(cli.server_port, Arc::clone(&channel), config)?;
    demux.register(client.clone());
    demux.register(server.clone());
    let dispatcher = demux.spawn();

    let message = cli.message.into_bytes();
    let server_task = tokio::spawn({
        let server = server.clone();
        let len = message.len();
        async move {
            if server.listen().await != ConnectionState::Established {
                return None;
            }
            let mut buf = vec![0u8; len];
            let n = server.receive_data(&mut buf).await;
            buf.truncate(n);
            Some(buf)
        }
    });

    while server.state() != ConnectionState::Listen {
        tokio::task::yield_now().await;
    }
    log::info!("Client connecting to port {}", cli.server_port);
    if client.connect(cli.server_port).await != ConnectionState::Established {
        log::warn!("Handshake failed; connection aborted");
        dispatcher.abort();
        return Ok(());
    }

    let queued = client.send_data(&message).await;
    let confirmed = client.flush().await;
    log::info!("Client queued {queued} bytes, all acknowledged: {confirmed}");

    let received = server_task.await.ok().flatten().unwrap_or_default();
    println!("Server received: {}", String::from_utf8_lossy(&received));

    client.close().await;
    server.close().await;
    for _ in 0..50 {
        if client.state() == ConnectionState::Closed && server.state() == ConnectionState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    log::info!("Final states: client {}, server {}", client.state(), server.state());
    log::info!("Channel: {:?}", channel.stats());
    log::info!("Client: {:?}", client.stats());
    log::info!("Server: {:?}", server.stats());

    dispatcher.abort();
    Ok(())
}
