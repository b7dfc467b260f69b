//! Accept loop for inbound TCP connections.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::net::{handshake, TcpTransport};

/// Handles a single incoming connection: runs the hello exchange and hands
/// the stream to the transport, which announces it to the node.
pub async fn handle_connection(transport: Arc<TcpTransport>, mut stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let remote = handshake(&mut stream, transport.local()).await?;
    debug!(peer = %remote.id, addr = %remote.addr, "accepted connection");
    transport.attach(remote, stream).await;
    Ok(())
}

/// Accept connections on `listener` until it fails.
pub async fn serve(listener: TcpListener, transport: Arc<TcpTransport>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening for peers");
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(transport, stream).await {
                debug!(%remote_addr, "inbound connection failed: {err:?}");
            }
        });
    }
}
