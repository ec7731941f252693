use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

const DEFAULT_ADDR: &str = "127.0.0.1:8008";
const MAX_CLIENTS: usize = 1024;
const BUFFER_SIZE: usize = 4096;

// A local target for the harness: accepts up to MAX_CLIENTS connections at a
// time and echoes every chunk back verbatim until the client hangs up.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    // To limit the number of concurrent clients we borrow a permit from the
    // semaphore per accepted connection; the echo task returns it when the
    // client goes away.
    let semaphore = Arc::new(Semaphore::new(MAX_CLIENTS));
    let listener = TcpListener::bind(&addr)
        .await
        .context("Error binding listener")?;
    tracing::info!("Echoing at {}", addr);
    loop {
        // Reserve the slot before waiting for a client so an accepted
        // connection never has to wait for a permit.
        let permit = semaphore.clone().acquire_owned().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-c received, closing listener");
                break;
            }
            res = listener.accept() => {
                let (stream, peer) = res?;
                tracing::debug!(
                    "Client accepted [peer={} permits={}]",
                    peer,
                    semaphore.available_permits()
                );
                tokio::spawn(async move {
                    if let Err(err) = echo(stream).await {
                        tracing::debug!("Echo loop ended [peer={}]: {}", peer, err);
                    }
                    drop(permit);
                });
            }
        }
    }
    Ok(())
}

async fn echo(mut stream: TcpStream) -> anyhow::Result<()> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write_all(&buf[..n]).await?;
    }
}
