//! A minimal node: it listens for envelopes, and optionally sends a number of numbered envelopes
//!  to a peer. Start two of them pointing at each other:
//!
//! ```text
//! cargo run --example ping_node -- 127.0.0.1:9001 --node-id 1 --peer 127.0.0.1:9002
//! cargo run --example ping_node -- 127.0.0.1:9002 --node-id 2 --peer 127.0.0.1:9001
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use dagnet::messaging::config::TransportConfig;
use dagnet::messaging::envelope::Envelope;
use dagnet::messaging::receiver::Receiver;
use dagnet::messaging::sender::Sender;
use tokio::select;
use tracing::{info, Level};

const KIND_PING: u32 = 1;

#[derive(Parser)]
struct Args {
    listen_address: String,

    #[clap(long, default_value_t = 0)]
    node_id: u64,

    #[clap(long)]
    peer: Option<String>,

    #[clap(long, default_value_t = 10)]
    count: u32,

    #[clap(long, default_value_t = 500)]
    interval_millis: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = Arc::new(TransportConfig::new());
    let mut receiver = Receiver::bind(&args.listen_address, config.clone()).await?;
    let sender = Sender::new(config)?;

    let send_pings = async {
        if let Some(peer) = &args.peer {
            let mut ticks = tokio::time::interval(Duration::from_millis(args.interval_millis));
            for n in 0..args.count {
                ticks.tick().await;
                sender.send_to(peer.clone(), Envelope::new(args.node_id, KIND_PING, format!("ping #{}", n))).await;
            }
        }
        // keep receiving after all pings are sent
        std::future::pending::<()>().await
    };

    select! {
        _ = send_pings => {}
        _ = async {
            while let Some(envelope) = receiver.recv().await {
                info!(from = envelope.origin_id(), kind = envelope.kind(), "received {:?}", String::from_utf8_lossy(envelope.payload()));
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    sender.shutdown().await?;
    receiver.shutdown().await;
    Ok(())
}
