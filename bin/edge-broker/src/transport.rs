//! ZeroMQ transport for the broker facade
//!
//! Each configured socket is owned by its own task. Inbound messages from all
//! sockets are merged into one channel tagged with the socket role; outbound
//! messages are handed to the owning task through a per-socket channel.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use broker_api::{SocketConfig, SocketKind};
use broker_proxy::{Multipart, SocketRole, Transport};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeromq::{DealerSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

const CHANNEL_CAPACITY: usize = 1024;

pub struct ZmqTransport {
    inbound: mpsc::Receiver<(SocketRole, Multipart)>,
    outbound: BTreeMap<SocketRole, mpsc::Sender<Multipart>>,
}

impl ZmqTransport {
    /// Bind router sockets and connect dealer sockets
    pub async fn open(sockets: Vec<(SocketRole, SocketConfig)>) -> Result<Self> {
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let mut outbound = BTreeMap::new();

        for (role, config) in sockets {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            match config.kind {
                SocketKind::Router => {
                    let mut socket = RouterSocket::new();
                    let endpoint = socket.bind(&bind_address(&config.uri)).await?;
                    info!("{} socket listening on {}", role, endpoint);
                    tokio::spawn(pump(role, socket, inbound_tx.clone(), rx));
                }
                SocketKind::Dealer => {
                    let mut socket = DealerSocket::new();
                    socket.connect(&config.uri).await?;
                    info!("{} socket connected to {}", role, config.uri);
                    tokio::spawn(pump(role, socket, inbound_tx.clone(), rx));
                }
            }
            outbound.insert(role, tx);
        }

        Ok(Self { inbound, outbound })
    }
}

// Wildcard host as written in broker configs
fn bind_address(uri: &str) -> String {
    uri.replacen("://*:", "://0.0.0.0:", 1)
}

async fn pump<S>(
    role: SocketRole,
    mut socket: S,
    inbound: mpsc::Sender<(SocketRole, Multipart)>,
    mut outbound: mpsc::Receiver<Multipart>,
) where
    S: SocketRecv + SocketSend + Send,
{
    loop {
        tokio::select! {
            received = socket.recv() => match received {
                Ok(message) => {
                    let msg = Multipart::from_frames(message.into_vec());
                    if inbound.send((role, msg)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Receive on {} socket failed: {}", role, e);
                    break;
                }
            },
            outgoing = outbound.recv() => match outgoing {
                Some(msg) => match ZmqMessage::try_from(msg.into_frames()) {
                    Ok(message) => {
                        if let Err(e) = socket.send(message).await {
                            warn!("Send on {} socket failed: {}", role, e);
                        }
                    }
                    Err(_) => warn!("Dropping empty message for {} socket", role),
                },
                None => break,
            },
        }
    }
    debug!("{} socket task finished", role);
}

#[async_trait]
impl Transport for ZmqTransport {
    async fn recv(&mut self) -> Result<Option<(SocketRole, Multipart)>> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, role: SocketRole, msg: Multipart) -> Result<()> {
        let Some(socket) = self.outbound.get(&role) else {
            bail!("no {} socket configured", role);
        };
        socket
            .send(msg)
            .await
            .map_err(|_| anyhow!("{} socket task stopped", role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_expands_wildcard() {
        assert_eq!(bind_address("tcp://*:5555"), "tcp://0.0.0.0:5555");
        assert_eq!(bind_address("tcp://10.0.0.4:5555"), "tcp://10.0.0.4:5555");
    }

    #[tokio::test]
    async fn test_send_to_unconfigured_socket_fails() {
        let mut transport = ZmqTransport::open(Vec::new()).await.unwrap();
        assert!(transport
            .send(SocketRole::Distribute, Multipart::new())
            .await
            .is_err());
        // Every socket task is gone, so the inbound side is closed
        assert!(transport.recv().await.unwrap().is_none());
    }
}
