//! Connection manager
//!
//! One actor task owns the live connection, the lifecycle state and the
//! reconnect timer. Commands from handles and events from transport tasks
//! are handled one at a time, so no flag is ever observed half-updated.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use podium_common::{ClassId, Frame, SystemStore};
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, debug_span, info, trace, warn};
use url::Url;

use crate::{
    configuration::ConnectionSettings,
    connection::{ConnectionId, TransportConnection, TransportEvent, TransportSender},
    heartbeat::HeartbeatMonitor,
    SyncError,
};

const COMMAND_CHANNEL_SIZE: usize = 16;
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Lifecycle of the real-time connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing attempted yet
    Idle,
    /// Handshake in flight, further connects are ignored
    Connecting,
    Open,
    /// Transport reported an error, waiting for it to close
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Command {
    Connect(Option<ClassId>),
    Disconnect,
    Reconnect,
}

/// Runs before every automatic reconnect, so the authoritative read lands
/// before the new socket delivers anything
pub type Reconcile = Arc<dyn Fn(ClassId) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) enum ManagerEvent {
    Transport {
        id: ConnectionId,
        event: TransportEvent,
    },
    ReconnectDue,
}

/// Endpoint for `class_id`, the server falls back to its default scope without one
pub fn endpoint_url(base: &Url, class_id: Option<ClassId>) -> Url {
    let mut url = base.clone();
    if let Some(class_id) = class_id {
        url.query_pairs_mut().append_pair("class_id", &class_id.to_string());
    }
    url
}

/// Cloneable front of the connection manager
#[derive(Clone)]
pub struct ConnectionManagerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManagerHandle {
    /// Open a connection for `class_id`
    ///
    /// Ignored while an attempt is in flight or when `class_id` is None. An
    /// existing connection is closed first and will not reconnect.
    pub async fn connect(&self, class_id: Option<ClassId>) -> Result<(), SyncError> {
        self.send(Command::Connect(class_id)).await
    }

    /// Close the connection and cancel any pending reconnect
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.send(Command::Disconnect).await
    }

    /// Disconnect, then connect again to the same class
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.send(Command::Reconnect).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).await.map_err(|_| SyncError::ManagerStopped)
    }
}

struct LiveConnection {
    conn: TransportConnection,
    heartbeat: Option<HeartbeatMonitor>,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    store: SystemStore,
    reconcile: Option<Reconcile>,
    next_id: u64,
    current: Option<LiveConnection>,
    class_id: Option<ClassId>,
    manual_disconnect: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<ManagerEvent>,
    events_sender: mpsc::Sender<ManagerEvent>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Start the manager task, it runs until every handle is dropped
    pub fn spawn(settings: ConnectionSettings, store: SystemStore) -> ConnectionManagerHandle {
        Self::spawn_with_reconcile(settings, store, None)
    }

    /// As `spawn`, running `reconcile` after each reconnect delay and before the new connection opens
    pub fn spawn_with_reconcile(
        settings: ConnectionSettings,
        store: SystemStore,
        reconcile: Option<Reconcile>,
    ) -> ConnectionManagerHandle {
        let (commands_sender, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_sender, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state, state_receiver) = watch::channel(ConnectionState::Idle);

        let manager = Self {
            settings,
            store,
            reconcile,
            next_id: 0,
            current: None,
            class_id: None,
            manual_disconnect: false,
            reconnect_timer: None,
            commands,
            events,
            events_sender,
            state,
        };
        tokio::spawn(manager.run());

        ConnectionManagerHandle {
            commands: commands_sender,
            state: state_receiver,
        }
    }

    async fn run(mut self) {
        loop {
            select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event),
            }
        }

        self.disconnect();
        debug!("Connection manager stopped");
    }

    // Deliberately synchronous: transport tasks block on sending to this
    // task, so it must never wait on them in turn.
    fn on_command(&mut self, command: Command) {
        debug!(?command, state = %self.current_state(), "Connection command");
        match command {
            Command::Connect(class_id) => self.connect(class_id),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect => {
                let class_id = self.class_id;
                self.disconnect();
                self.connect(class_id);
            }
        }
    }

    fn on_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Transport { id, event } => self.on_transport_event(id, event),
            ManagerEvent::ReconnectDue => {
                self.reconnect_timer = None;
                if self.manual_disconnect {
                    debug!("Reconnect cancelled by disconnect");
                    return;
                }
                info!(class_id = ?self.class_id, "Reconnecting");
                self.connect(self.class_id);
            }
        }
    }

    fn connect(&mut self, class_id: Option<ClassId>) {
        let Some(class_id) = class_id else {
            warn!("No class selected, not connecting");
            return;
        };
        if self.current_state() == ConnectionState::Connecting {
            debug!("Connection attempt already in flight");
            return;
        }

        self.cancel_reconnect();
        self.detach_current();
        self.manual_disconnect = false;
        self.class_id = Some(class_id);

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let url = endpoint_url(&self.settings.endpoint, Some(class_id));
        info!(conn = %id, %class_id, "Connecting to {url}");

        let sender = TransportSender {
            id,
            sink: self.events_sender.clone(),
        };
        self.current = Some(LiveConnection {
            conn: TransportConnection::open(id, url, sender),
            heartbeat: None,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn disconnect(&mut self) {
        self.manual_disconnect = true;
        self.cancel_reconnect();
        if self.detach_current() {
            info!("Disconnected");
        }
        if self.current_state() != ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
        }
    }

    /// Close the current connection so that its close never reconnects
    fn detach_current(&mut self) -> bool {
        let Some(live) = self.current.take() else {
            return false;
        };
        // Heartbeat goes first so nothing is queued behind the close
        drop(live.heartbeat);
        debug!(conn = %live.conn.id, "Closing connection");
        live.conn.close();
        true
    }

    fn on_transport_event(&mut self, id: ConnectionId, event: TransportEvent) {
        let Some(live) = self.current.as_mut().filter(|live| live.conn.id == id) else {
            match event {
                TransportEvent::Frame(_) => trace!(conn = %id, "Dropping frame from detached connection"),
                event => debug!(conn = %id, ?event, "Ignoring event from detached connection"),
            }
            return;
        };

        match event {
            TransportEvent::Opened => {
                info!(conn = %id, "Connection open");
                live.heartbeat = Some(HeartbeatMonitor::start(
                    id,
                    live.conn.outbound(),
                    self.settings.heartbeat_interval,
                ));
                self.set_state(ConnectionState::Open);
            }
            TransportEvent::Frame(text) => self.handle_frame(id, &text),
            TransportEvent::Error(reason) => {
                // The close that follows decides about reconnecting
                warn!(conn = %id, "Connection error: {reason}");
                self.set_state(ConnectionState::Closing);
            }
            TransportEvent::Closed => {
                self.current = None;
                self.set_state(ConnectionState::Closed);
                if self.manual_disconnect {
                    return;
                }
                warn!(
                    conn = %id,
                    "Connection closed, reconnecting in {:?}",
                    self.settings.reconnect_delay
                );
                self.schedule_reconnect();
            }
        }
    }

    fn handle_frame(&self, id: ConnectionId, text: &str) {
        let span = debug_span!("realtime_sync.frame", conn = %id);
        let _entered = span.enter();

        match Frame::parse(text) {
            Ok(Frame::Control(control)) => trace!(?control, "Heartbeat frame"),
            Ok(Frame::Message(message)) => {
                let changed = self.store.apply(&message);
                debug!(tag = message.tag(), changed, "Applied message");
            }
            Err(e) => warn!("Discarding malformed frame: {e}"),
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_timer.is_some() {
            return;
        }
        let delay = self.settings.reconnect_delay;
        let events = self.events_sender.clone();
        let reconcile = self.reconcile.clone().zip(self.class_id);
        // Aborted as a whole on cancel, reconcile included
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((reconcile, class_id)) = reconcile {
                reconcile(class_id).await;
            }
            let _ = events.send(ManagerEvent::ReconnectDue).await;
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            debug!("Pending reconnect cancelled");
            timer.abort();
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Connection {current} -> {state}");
            *current = state;
            true
        });
    }
}
