//! TCP listener and outbound dialing

use crate::network::peer::PeerError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listening socket
    pub async fn bind(bind_addr: &str, port: u16) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind((bind_addr, port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer, giving up after `timeout`
pub async fn connect_to_peer(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, PeerError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| PeerError::Timeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
