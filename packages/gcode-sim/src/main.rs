//! main.rs — G-code firmware simulator entry point
//!
//! Listens on a TCP port and speaks the same line-oriented G-code
//! protocol the real motion controller speaks over serial (spec §6
//! Glossary): G21/G90/G91/G28/G0/G1/M114/M302/M400/M112, answering `ok`
//! after each accepted command. Point `SERIAL_PORT` at a TCP bridge (e.g.
//! `socat`) or adapt the control core's serial backend in a dev build to
//! develop the scanner logic without bench hardware.
//!
//! Each connection gets an independent `FirmwareState` and an optional
//! artificial response-latency jitter, so the request pump's windowed
//! read logic gets exercised the same way it would against real
//! hardware with USB-serial latency.

mod firmware;

use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use firmware::{jitter_millis, FirmwareState};

#[derive(Parser, Debug)]
#[command(name = "gcode-sim", about = "G-code firmware simulator for the scanner control core")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:5556")]
    bind_addr: String,
    /// Baseline response latency in milliseconds.
    #[arg(long, default_value = "5")]
    latency_ms: u64,
    /// Extra random jitter on top of the baseline latency, in milliseconds.
    #[arg(long, default_value = "10")]
    jitter_ms: u64,
}

async fn handle_connection(stream: tokio::net::TcpStream, peer: std::net::SocketAddr, latency_ms: u64, jitter_ms: u64) {
    info!("gcode-sim: connection from {peer}");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut state = FirmwareState::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("gcode-sim: read error from {peer}: {e}");
                break;
            }
        };

        let responses = state.process_line(&line);
        tokio::time::sleep(Duration::from_millis(jitter_millis(latency_ms, jitter_ms))).await;

        for response in responses {
            if let Err(e) = writer.write_all(format!("{response}\n").as_bytes()).await {
                warn!("gcode-sim: write error to {peer}: {e}");
                return;
            }
        }
    }
    info!("gcode-sim: connection closed from {peer}");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gcode_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let listener = TcpListener::bind(&args.bind_addr).await.expect("failed to bind simulator listener");
    info!("gcode-sim: listening on {}", args.bind_addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let latency_ms = args.latency_ms;
                let jitter_ms = args.jitter_ms;
                tokio::spawn(async move {
                    handle_connection(stream, peer, latency_ms, jitter_ms).await;
                });
            }
            Err(e) => warn!("gcode-sim: accept failed: {e}"),
        }
    }
}
