//! Two-terminal demo. Each side prints its descriptor; paste the peer's one
//! back in, and the tunnel punches itself through. Run with `--listen` on
//! one side to print what the other side types.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use env_logger::Env;
use tokio::io::{AsyncBufReadExt, BufReader};

use punch_tunnel::{NatDescriptor, Signal, Tunnel, TunnelConfig};

/// Copy/paste signaling over stdin/stdout.
struct StdinSignal;

#[async_trait]
impl Signal for StdinSignal {
    async fn send_signal(&self, descriptor: &NatDescriptor) -> punch_tunnel::Result<()> {
        let json = descriptor.to_json()?;
        println!("Send local nat descriptor to the peer:");
        println!("{json}");
        Ok(())
    }

    async fn read_signal(&self) -> punch_tunnel::Result<NatDescriptor> {
        println!("Paste remote nat descriptor:");
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(punch_tunnel::Error::Io)?;
            if n == 0 {
                return Err(punch_tunnel::Error::Signal("stdin closed".to_string()));
            }
            if line.trim().is_empty() {
                continue;
            }
            return NatDescriptor::from_json(line.trim());
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Print what the peer sends instead of reading lines from stdin.
    #[arg(short, long)]
    listen: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args { listen } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();

    let tunnel = Tunnel::connect(Arc::new(StdinSignal), TunnelConfig::default()).await?;
    println!(
        "tunnel up: local {}, remote {}",
        tunnel.local_addr(),
        tunnel.remote_addr()
    );
    tunnel.spawn_keepalive();

    if listen {
        tunnel
            .serve(|payload| println!("peer: {}", String::from_utf8_lossy(payload)))
            .await?;
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            tunnel.send_data(line.as_bytes()).await?;
        }
    }
    tunnel.close();
    Ok(())
}
