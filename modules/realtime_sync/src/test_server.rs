//! In-process WebSocket server for lifecycle tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use podium_common::messages::{PING, PONG};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::manager::{ConnectionManagerHandle, ConnectionState};

const WAIT: Duration = Duration::from_secs(3);

pub struct TestServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    rejections: Arc<AtomicUsize>,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

/// Server side of one accepted socket
pub struct ServerConnection {
    pub query: Option<String>,
    to_client: Option<mpsc::UnboundedSender<Message>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let rejections = Arc::new(AtomicUsize::new(0));
        let (connections_tx, connections) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        let rejecting = rejections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let reject = rejecting
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                let connections_tx = connections_tx.clone();
                tokio::spawn(serve(stream, reject, connections_tx));
            }
        });

        Self {
            addr,
            accepted,
            rejections,
            connections,
        }
    }

    pub fn endpoint(&self) -> Url {
        Url::parse(&format!("ws://{}/ws", self.addr)).unwrap()
    }

    /// TCP connections accepted so far, rejected handshakes included
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Fail the next `count` handshakes with HTTP 503
    pub fn reject_handshakes(&self, count: usize) {
        self.rejections.store(count, Ordering::SeqCst);
    }

    pub async fn next_connection(&mut self) -> ServerConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection arrived")
            .expect("server stopped")
    }
}

impl ServerConnection {
    pub fn send_text(&self, text: &str) {
        if let Some(to_client) = &self.to_client {
            to_client.send(Message::Text(text.to_string())).unwrap();
        }
    }

    pub async fn recv_text(&mut self) -> String {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("client sent nothing")
            .expect("client disconnected")
    }

    /// Close from the server side
    pub fn close(mut self) {
        if let Some(to_client) = self.to_client.take() {
            let _ = to_client.send(Message::Close(None));
        }
    }

    /// Wait until the client has gone away
    pub async fn wait_closed(&mut self) {
        timeout(WAIT, async {
            while self.from_client.recv().await.is_some() {}
        })
        .await
        .expect("client did not close");
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    reject: bool,
    connections: mpsc::UnboundedSender<ServerConnection>,
) {
    let mut query = None;
    let callback = |request: &Request, response: Response| {
        if reject {
            let mut error = ErrorResponse::new(None);
            *error.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return Err(error);
        }
        query = request.uri().query().map(str::to_string);
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let (to_client, mut outgoing) = mpsc::unbounded_channel::<Message>();
    let (incoming, from_client) = mpsc::unbounded_channel();
    let _ = connections.send(ServerConnection {
        query,
        to_client: Some(to_client),
        from_client,
    });

    let (mut write, mut read) = ws.split();
    let mut outgoing_open = true;
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if text == PING {
                        let _ = write.send(Message::Text(PONG.to_string())).await;
                    }
                    let _ = incoming.send(text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            message = outgoing.recv(), if outgoing_open => match message {
                Some(Message::Close(frame)) => {
                    let _ = write.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
                None => outgoing_open = false,
            },
        }
    }
}

pub async fn wait_for_state(handle: &ConnectionManagerHandle, state: ConnectionState) {
    let mut states = handle.subscribe_state();
    timeout(WAIT, states.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("connection never reached {state}"))
        .unwrap();
}
