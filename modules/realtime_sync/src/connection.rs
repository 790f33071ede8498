use std::fmt;

use anyhow::{Context as _, Result};
use futures::{SinkExt, StreamExt};
use tokio::{select, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::manager::ManagerEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a transport task reports back to the manager
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    Closed,
}

/// Instruction for the outbound side of a socket
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Handle on one socket, the socket itself lives in its own task
pub struct TransportConnection {
    pub id: ConnectionId,
    pub url: Url,
    outbound: OutboundSender,
}

impl TransportConnection {
    pub fn open(id: ConnectionId, url: Url, sender: TransportSender) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let worker = TransportWorker {
            url: url.clone(),
            sender,
        };
        tokio::spawn(worker.run(outbound_rx));
        Self {
            id,
            url,
            outbound: outbound_tx,
        }
    }

    pub fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    /// Ask the task to close the socket, it reports `Closed` when done
    pub fn close(&self) {
        if self.outbound.send(Outbound::Close).is_err() {
            debug!(conn = %self.id, "Transport already gone");
        }
    }
}

pub struct TransportSender {
    pub(crate) id: ConnectionId,
    pub(crate) sink: mpsc::Sender<ManagerEvent>,
}

impl TransportSender {
    async fn write(&self, event: TransportEvent) -> Result<()> {
        self.sink
            .send(ManagerEvent::Transport { id: self.id, event })
            .await
            .context("connection manager has shut down")
    }
}

struct TransportWorker {
    url: Url,
    sender: TransportSender,
}

impl TransportWorker {
    async fn run(self, outbound: mpsc::UnboundedReceiver<Outbound>) {
        if let Err(err) = self.do_run(outbound).await {
            warn!(conn = %self.sender.id, "{err:#}");
            let _ = self.sender.write(TransportEvent::Error(format!("{err:#}"))).await;
        }
        let _ = self.sender.write(TransportEvent::Closed).await;
    }

    async fn do_run(&self, mut outbound: mpsc::UnboundedReceiver<Outbound>) -> Result<()> {
        let (stream, _) = select! {
            res = connect_async(self.url.as_str()) => {
                res.with_context(|| format!("cannot connect to {}", self.url))?
            }
            // Closed or dropped before the handshake finished
            _ = outbound.recv() => return Ok(()),
        };
        self.sender.write(TransportEvent::Opened).await?;

        let (mut write, mut read) = stream.split();
        loop {
            select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.sender.write(TransportEvent::Frame(text)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(conn = %self.sender.id, ?frame, "Server closed the connection");
                        return Ok(());
                    }
                    // Protocol pings are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("connection lost"),
                    None => return Ok(()),
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Text(text)) => {
                        write.send(Message::Text(text)).await.context("send failed")?;
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                },
            }
        }
    }
}
