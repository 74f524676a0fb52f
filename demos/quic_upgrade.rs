//! Punch a tunnel, then upgrade the punched socket to a QUIC stream. One
//! side runs with `--serve` and echoes; the other opens a stream and sends
//! stdin lines through it.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use env_logger::Env;
use tokio::io::{AsyncBufReadExt, BufReader};

use punch_tunnel::{quic, NatDescriptor, Signal, Tunnel, TunnelConfig};

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
    /// Accept the QUIC connection and echo streams back.
    #[arg(short, long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args { serve } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();

    let tunnel = Tunnel::connect(Arc::new(StdinSignal), TunnelConfig::default()).await?;
    println!(
        "tunnel up: local {}, remote {}",
        tunnel.local_addr(),
        tunnel.remote_addr()
    );
    let (socket, remote_addr) = tunnel.into_socket().await?;

    if serve {
        let connection = quic::upgrade_server(socket).await?;
        println!("quic connection from {}", connection.remote_address());
        while let Ok((mut tx, mut rx)) = connection.accept_bi().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                while let Ok(Some(n)) = rx.read(&mut buf).await {
                    println!("peer: {}", String::from_utf8_lossy(&buf[..n]));
                    if tx.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    } else {
        let connection = quic::upgrade_client(socket, remote_addr).await?;
        println!("quic connection to {}", connection.remote_address());
        let (mut tx, mut rx) = connection.open_bi().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok(Some(n)) = rx.read(&mut buf).await {
                println!("echo: {}", String::from_utf8_lossy(&buf[..n]));
            }
        });
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            tx.write_all(line.as_bytes()).await?;
        }
    }
    Ok(())
}
