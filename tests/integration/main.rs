//! ferry integration test harness.
//!
//! Every test runs real nodes on 127.0.0.1 with OS-assigned ports, so tests
//! need no privileges and can run in parallel. Each test owns its nodes and
//! shuts them down before returning.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use ferry_core::FerryConfig;
use ferryd::{DirectoryClient, DirectoryServer, NodeHandle, PeerNode};

mod capacity;
mod directory;
mod files;
mod queue;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// Scratch directory unique to this test process and `tag`.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ferry-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// A loopback node with its own staging and download directories.
pub async fn start_node(tag: &str, max_connections: usize) -> NodeHandle {
    let root = scratch_dir(tag);
    let mut config = FerryConfig::default();
    config.network.listen_host = "127.0.0.1".into();
    config.network.base_port = 0;
    config.network.bind_attempts = 1;
    config.network.max_connections = max_connections;
    config.transfer.staging_dir = root.join("p2p-staging");
    config.transfer.download_dir = root.join("downloads");

    PeerNode::bind(config)
        .await
        .expect("bind loopback node")
        .start()
}

/// A node running the directory server. Returns the node, the server task,
/// and the `host:port` clients should dial.
pub async fn start_directory(tag: &str) -> (NodeHandle, JoinHandle<Result<()>>, String) {
    let node = start_node(tag, 8).await;
    let task = tokio::spawn(DirectoryServer::new(node.clone()).run());
    let addr = format!("127.0.0.1:{}", node.public_port());
    (node, task, addr)
}

/// A fresh peer node already connected to the directory at `addr`.
pub async fn start_client(tag: &str, addr: &str) -> DirectoryClient {
    let node = start_node(tag, 4).await;
    DirectoryClient::connect(node, addr)
        .await
        .expect("connect to directory")
}

/// Next queued response text, failing the test after `WAIT`.
pub async fn next_text(client: &DirectoryClient) -> String {
    client
        .next_response(WAIT)
        .await
        .expect("response from directory")
        .text
}

/// Poll `cond` until it holds or `WAIT` elapses.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Read one NUL-terminated message from a raw stream.
pub async fn read_message(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let read = async {
        loop {
            let byte = stream.read_u8().await.context("stream closed mid-message")?;
            if byte == 0 {
                return Ok::<_, anyhow::Error>(());
            }
            buf.push(byte);
        }
    };
    tokio::time::timeout(WAIT, read)
        .await
        .context("timed out reading message")??;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Stop every node in `nodes` and wait for their loops to exit.
pub async fn stop(nodes: &[&NodeHandle]) {
    for node in nodes {
        node.shutdown();
    }
    for node in nodes {
        node.join().await.expect("event loop exited cleanly");
    }
}
