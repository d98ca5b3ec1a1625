//! trellis-node -- run a standalone peer node.
//!
//! Usage:
//!   trellis-node --co-listen tcpip:0.0.0.0:4242
//!   trellis-node --co-listen tcpip:0.0.0.0:4242 --co-globals timeout_ms=5000
//!   trellis-node --config node.toml connect tcpip:10.0.0.2:4242
//!
//! Exit codes: 0 success, 1 listener failure, 2 client-side handshake
//! failure.

use clap::{Parser, Subcommand};

use trellis_node::{ConnectionDesc, LocalNode, NodeConfig, Peer};

#[derive(Parser)]
#[command(name = "trellis-node", about = "Trellis peer node runtime")]
struct Cli {
    /// Add a listener description; may repeat.
    #[arg(long = "co-listen", value_name = "DESC")]
    listen: Vec<String>,

    /// Override global tunables, comma-separated k=v pairs.
    #[arg(long = "co-globals", value_name = "KV")]
    globals: Option<String>,

    /// Optional TOML config file; flags take precedence.
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run until interrupted (default).
    Run,
    /// Connect a remote node by description, ping it, then exit.
    Connect {
        /// Target description, e.g. tcpip:10.0.0.2:4242
        desc: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_node=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Rebuild the core flag vector; init_local owns its parsing. CLI
    // flags take precedence: CLI listeners replace the config file's,
    // and the config's globals go first so CLI overrides win per field.
    let mut args = Vec::new();
    if let Some(path) = &cli.config {
        let cfg = NodeConfig::load_or_default(std::path::Path::new(path))?;
        if cli.listen.is_empty() {
            for listen in &cfg.listen {
                args.push("--co-listen".to_string());
                args.push(listen.clone());
            }
        }
        if let Some(globals) = &cfg.globals {
            args.push("--co-globals".to_string());
            args.push(globals.to_kv());
        }
    }
    for listen in &cli.listen {
        args.push("--co-listen".to_string());
        args.push(listen.clone());
    }
    if let Some(globals) = &cli.globals {
        args.push("--co-globals".to_string());
        args.push(globals.clone());
    }

    let node = match LocalNode::init_local(&args).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "cannot set up listeners");
            std::process::exit(1);
        }
    };
    tracing::info!(node = %node.id(), "node up");

    match cli.command {
        Some(Commands::Connect { desc }) => {
            let desc: ConnectionDesc = desc.parse()?;
            let peer = Peer::unknown();
            peer.set_descs(vec![desc]);
            match node.connect_peer(&peer).await {
                Ok(peer) => {
                    node.ping(&peer).await.ok();
                    tracing::info!(peer = %peer.id(), "connected");
                }
                Err(e) => {
                    tracing::error!(error = %e, "handshake failed");
                    node.close().await.ok();
                    std::process::exit(2);
                }
            }
        }
        Some(Commands::Run) | None => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupted, shutting down");
        }
    }

    node.close().await?;
    Ok(())
}
