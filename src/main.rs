use fragment_ring::config::NodeConfig;
use fragment_ring::membership::types::NodeId;
use fragment_ring::node::machine::Node;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;

fn usage(program: &str) {
    eprintln!(
        "Usage: {} --id <n> --bind <addr:port> --peer-id <n> --peer <addr:port> --network-size <n> \
         [--redundancy <r>] [--split-threshold <bytes>]",
        program
    );
    eprintln!(
        "Example: {} --id 1 --bind 127.0.0.1:7001 --peer-id 2 --peer 127.0.0.1:7002 --network-size 4",
        program
    );
}

fn value<'a>(args: &'a [String], i: usize) -> anyhow::Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{} needs a value", args[i]))
}

fn parse_config(args: &[String]) -> anyhow::Result<NodeConfig> {
    let mut id: Option<u64> = None;
    let mut bind_addr: Option<SocketAddr> = None;
    let mut peer_id: Option<u64> = None;
    let mut peer_addr: Option<SocketAddr> = None;
    let mut network_size: Option<u64> = None;
    let mut redundancy: Option<usize> = None;
    let mut split_threshold: Option<u64> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" => id = Some(value(args, i)?.parse()?),
            "--bind" => bind_addr = Some(value(args, i)?.parse()?),
            "--peer-id" => peer_id = Some(value(args, i)?.parse()?),
            "--peer" => peer_addr = Some(value(args, i)?.parse()?),
            "--network-size" => network_size = Some(value(args, i)?.parse()?),
            "--redundancy" => redundancy = Some(value(args, i)?.parse()?),
            "--split-threshold" => split_threshold = Some(value(args, i)?.parse()?),
            other => anyhow::bail!("unknown argument {}", other),
        }
        i += 2;
    }

    let mut config = NodeConfig::new(
        NodeId(id.ok_or_else(|| anyhow::anyhow!("--id is required"))?),
        bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?,
        NodeId(peer_id.ok_or_else(|| anyhow::anyhow!("--peer-id is required"))?),
        peer_addr.ok_or_else(|| anyhow::anyhow!("--peer is required"))?,
        network_size.ok_or_else(|| anyhow::anyhow!("--network-size is required"))?,
    );
    if let Some(redundancy) = redundancy {
        config = config.with_redundancy(redundancy);
    }
    if let Some(threshold) = split_threshold {
        config = config.with_split_threshold(threshold);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match parse_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            usage(&args[0]);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Starting node {} on {} (successor {} at {}, ring of {})",
        config.id,
        config.addr,
        config.successor_id,
        config.successor_addr,
        config.network_size
    );
    if config.is_boot_index() {
        tracing::info!("This node leads the ring at boot");
    }

    let node = Node::bind(config).await?;
    let mut status = node.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(node.run(shutdown_rx));

    // Stats reporter:
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let current = status.borrow_and_update().clone();
            tracing::info!(
                "Node {} [{}]: ring of {} (deaths {}), index {:?}, {} fragments held, {} files indexed, {} placements pending",
                current.id,
                current.state,
                current.network_size,
                current.deaths,
                current.index,
                current.fragments,
                current.files_indexed,
                current.pending_placements
            );
            tracing::info!(
                "Node {} links: forward {:?} sent {} B, backward {:?} received {} B",
                current.id,
                current.forward,
                current.forward_link.tx_bytes,
                current.backward,
                current.backward_link.rx_bytes
            );
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    shutdown_tx.send(true)?;

    let node = handle.await?;
    tracing::info!(
        "Node {} shut down holding {} fragments",
        node.id(),
        node.store().fragment_total()
    );
    Ok(())
}
