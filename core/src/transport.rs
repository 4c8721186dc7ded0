/// Transport seam between the connection manager and a relay
///
/// A `Dialer` opens one duplex link; the connection manager only ever sees
/// frame channels, so TCP and in-process relays look the same to it.
use crate::error::{ChatError, Result};
use crate::protocol::{read_frame, write_frame, ClientFrame, ServerFrame};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One established duplex link. Dropping `outbound` closes the link.
#[derive(Debug)]
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<RelayLink>;
}

/// Dials the relay over TCP with length-prefixed JSON frames
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<RelayLink> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| ChatError::Connection(format!("connect {}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", self.addr);

        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerFrame>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            // Dropping the write half shuts the socket down
        });

        let addr = self.addr;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = in_tx.closed() => break,
                    frame = read_frame::<_, ServerFrame>(&mut reader) => match frame {
                        Ok(Some(frame)) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("Relay {} closed the connection", addr);
                            break;
                        }
                        Err(e) => {
                            warn!("Relay read failed: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
