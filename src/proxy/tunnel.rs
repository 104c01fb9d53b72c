//! Byte relay for CONNECT tunnels

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::Result;

/// Relays an established tunnel until either side closes
pub struct TunnelHandler;

impl TunnelHandler {
    /// Copy data both ways, half-closing each direction as its source ends
    #[instrument(skip(client, server))]
    pub async fn copy_bidirectional<C, S>(client: C, server: S) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let client_to_server = async {
            let result = tokio::io::copy(&mut client_read, &mut server_write).await;
            let _ = server_write.shutdown().await;
            result
        };

        let server_to_client = async {
            let result = tokio::io::copy(&mut server_read, &mut client_write).await;
            let _ = client_write.shutdown().await;
            result
        };

        let (sent, received) = tokio::join!(client_to_server, server_to_client);

        let bytes_sent = sent.unwrap_or_else(|e| {
            debug!("Client to upstream copy ended: {}", e);
            0
        });
        let bytes_received = received.unwrap_or_else(|e| {
            debug!("Upstream to client copy ended: {}", e);
            0
        });

        debug!(bytes_sent, bytes_received, "Tunnel closed");
        Ok((bytes_sent, bytes_received))
    }

    /// Relay a hyper-upgraded client connection over an upstream stream
    pub async fn relay_upgraded<S>(upgraded: Upgraded, server: S) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Self::copy_bidirectional(TokioIo::new(upgraded), server).await
    }
}
