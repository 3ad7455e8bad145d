//! ferryd: peer-to-peer file transfer node and directory server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use ferry_core::{FerryConfig, FileId, Message};
use ferryd::{DirectoryClient, DirectoryServer, NodeHandle, PeerNode, TransferEvent};

/// How long `list` and `get` wait on the directory or the owning peer.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

fn print_usage() {
    println!("ferryd: peer-to-peer file transfer");
    println!();
    println!("Usage: ferryd <command>");
    println!();
    println!("Commands:");
    println!("  directory          Run the directory server");
    println!("  peer [PATH...]     Share files with the directory and serve them");
    println!("  list               Print the directory's file listing");
    println!("  get <ID>           Download a file by its listing id");
    println!("  help               Show this message");
    println!();
    println!("Configuration: $FERRY_CONFIG, else ~/.config/ferry/config.toml");
    println!("Logging: RUST_LOG (e.g. RUST_LOG=ferryd=debug)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FerryConfig::load().context("loading configuration")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["directory"] => cmd_directory(config).await,
        ["peer", paths @ ..] => {
            let paths = paths.iter().map(PathBuf::from).collect::<Vec<_>>();
            cmd_peer(config, &paths).await
        }
        ["list"] => cmd_list(config).await,
        ["get", id] => {
            let file_id: FileId = id.parse().context("file id must be a number")?;
            cmd_get(config, file_id).await
        }
        ["--version"] | ["-V"] => {
            println!("ferryd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

/// Bind and start a node; ctrl-c triggers an orderly shutdown.
async fn start_node(config: FerryConfig) -> Result<NodeHandle> {
    let node = PeerNode::bind(config)
        .await
        .context("failed to bind primary socket")?
        .start();

    let signal_node = node.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        signal_node.shutdown();
    });
    Ok(node)
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_directory(mut config: FerryConfig) -> Result<()> {
    // Clients are configured with one address; probing upward would hide it.
    config.network.bind_attempts = 1;
    let node = start_node(config).await?;

    let directory = tokio::spawn(DirectoryServer::new(node.clone()).run());

    let mut shutdown = node.subscribe_shutdown();
    tokio::select! {
        _ = shutdown.recv() => {}
        r = directory => {
            r.context("directory task panicked")??;
            node.shutdown();
        }
    }
    node.join().await
}

async fn cmd_peer(config: FerryConfig, paths: &[PathBuf]) -> Result<()> {
    let directory_addr = config.network.directory_addr.clone();
    let node = start_node(config).await?;

    let client = DirectoryClient::connect(node.clone(), &directory_addr)
        .await
        .with_context(|| format!("connecting to directory at {directory_addr}"))?;
    let shared = client.share(paths).await?;
    for _ in 0..shared.messages {
        match client.next_response(RESPONSE_TIMEOUT).await {
            Ok(reply) => println!("{}", reply.text),
            Err(e) => {
                tracing::warn!(error = %e, "no acknowledgement from directory");
                break;
            }
        }
    }

    // Serve transfers until interrupted, logging each one.
    let mut completions = node.subscribe_completions();
    let mut shutdown = node.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = completions.recv() => match event {
                Ok(TransferEvent::Sent { file_id, socket_id, chunks }) => {
                    tracing::info!(file_id, socket_id, chunks, "served file");
                }
                Ok(TransferEvent::Failed { file_id, reason }) => {
                    tracing::warn!(file_id, reason = %reason, "transfer failed");
                }
                Ok(TransferEvent::Received { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(missed = n, "completion events lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    node.join().await
}

async fn cmd_list(config: FerryConfig) -> Result<()> {
    let directory_addr = config.network.directory_addr.clone();
    let node = start_node(config).await?;
    let client = DirectoryClient::connect(node.clone(), &directory_addr)
        .await
        .with_context(|| format!("connecting to directory at {directory_addr}"))?;

    client.list().await?;
    let reply = client
        .next_response(RESPONSE_TIMEOUT)
        .await
        .context("waiting for listing")?;
    println!("{}", reply.text);

    node.shutdown();
    node.join().await
}

async fn cmd_get(config: FerryConfig, file_id: FileId) -> Result<()> {
    let directory_addr = config.network.directory_addr.clone();
    let node = start_node(config).await?;
    let client = DirectoryClient::connect(node.clone(), &directory_addr)
        .await
        .with_context(|| format!("connecting to directory at {directory_addr}"))?;

    let mut completions = node.subscribe_completions();
    client.request_file(file_id).await?;

    let outcome = tokio::time::timeout(RESPONSE_TIMEOUT, async {
        loop {
            tokio::select! {
                event = completions.recv() => match event {
                    Ok(TransferEvent::Received { file_id: id, path }) if id == file_id => {
                        return Ok::<_, anyhow::Error>(path);
                    }
                    Ok(TransferEvent::Failed { file_id: id, reason }) if id == file_id => {
                        anyhow::bail!("download of file {file_id} failed: {reason}");
                    }
                    Ok(_) => {}
                    Err(e) => anyhow::bail!("completion channel closed: {e}"),
                },
                reply = client.next_response(RESPONSE_TIMEOUT) => {
                    let reply = reply?;
                    if let Ok(Message::FileAddress(None)) = Message::parse(&reply.text) {
                        anyhow::bail!("file {file_id} is not in the listing");
                    }
                    println!("{}", reply.text);
                }
            }
        }
    })
    .await
    .with_context(|| format!("timed out waiting for file {file_id}"))?;

    let result = match outcome {
        Ok(path) => {
            println!("Downloaded file {file_id} to {}", path.display());
            print!("{}", node.downloads().progress_report());
            Ok(())
        }
        Err(e) => Err(e),
    };

    node.shutdown();
    node.join().await?;
    result
}
