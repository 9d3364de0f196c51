//! Broker facade: drives a [`Broker`] from a [`Transport`]
//!
//! The facade owns the broker and runs a single cooperative loop. Each
//! inbound message is handled to completion and the resulting outbound
//! messages are flushed before the next event is awaited.

use crate::broker::{Broker, SocketRole};
use crate::wire::Multipart;
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default period of the statistics tick
pub const DEFAULT_TICK: Duration = Duration::from_millis(2500);

/// Socket layer used by the facade
#[async_trait]
pub trait Transport: Send {
    /// Next inbound message, or `None` once the transport is closed
    async fn recv(&mut self) -> Result<Option<(SocketRole, Multipart)>>;

    async fn send(&mut self, role: SocketRole, msg: Multipart) -> Result<()>;
}

pub struct BrokerFacade<T: Transport> {
    broker: Broker,
    transport: T,
    tick: Duration,
}

impl<T: Transport> BrokerFacade<T> {
    pub fn new(broker: Broker, transport: T) -> Self {
        Self {
            broker,
            transport,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }

    /// Send every queued outbound message. Send failures are logged and the
    /// message is dropped.
    pub async fn flush(&mut self) {
        for (role, msg) in self.broker.take_outbound() {
            if let Err(e) = self.transport.send(role, msg).await {
                warn!("Failed to send on {} socket: {}", role, e);
            }
        }
    }

    /// Run until `shutdown` resolves or the transport closes
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        // Anything queued during installation (upstream registration)
        self.flush().await;

        let mut ticker = tokio::time::interval(self.tick);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Broker shutting down");
                    break;
                }
                received = self.transport.recv() => {
                    match received? {
                        Some((role, msg)) => {
                            self.broker.on_message(role, msg);
                        }
                        None => {
                            info!("Transport closed");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    match serde_json::to_string(&self.broker.stats()) {
                        Ok(stats) => debug!("Broker stats: {}", stats),
                        Err(e) => warn!("Failed to render broker stats: {}", e),
                    }
                }
            }
            self.flush().await;
        }

        self.flush().await;
        Ok(())
    }
}

/// In-process transport backed by channels
pub struct ChannelTransport {
    inbound: mpsc::Receiver<(SocketRole, Multipart)>,
    outbound: mpsc::Sender<(SocketRole, Multipart)>,
}

/// The other end of a [`ChannelTransport`]
pub struct ChannelPeer {
    pub sender: mpsc::Sender<(SocketRole, Multipart)>,
    pub receiver: mpsc::Receiver<(SocketRole, Multipart)>,
}

impl ChannelTransport {
    pub fn pair(capacity: usize) -> (Self, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
            },
            ChannelPeer {
                sender: in_tx,
                receiver: out_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<(SocketRole, Multipart)>> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, role: SocketRole, msg: Multipart) -> Result<()> {
        self.outbound
            .send((role, msg))
            .await
            .map_err(|_| anyhow::anyhow!("channel peer closed"))
    }
}
