//! The server engine. A single demultiplexer task owns the connection table: it receives all
//!  decoded datagrams, accepts new connections, routes messages to per-connection tasks, and
//!  serves the application's requests through a command channel. No other task touches the
//!  table, so it needs no locking.
//!
//! All connections' payloads go into one queue in the order they become deliverable, which is
//!  what [Server::read] consumes. This is fair in the sense that a busy connection can not keep
//!  others from being read.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::config::LspParams;
use crate::connection::{run_connection, ConnectionCommand, Delivery};
use crate::connection_events::{ConnectionEvent, ConnectionEventNotifier};
use crate::connection_state::{CloseReason, ConnectionState};
use crate::epoch_timer::EpochTimer;
use crate::error::{LspError, LspResult};
use crate::ids::{ConnId, Epoch, SeqNum};
use crate::message::Message;
use crate::transport::{receive_loop, send_or_log, DatagramSocket};

#[derive(Debug)]
enum ServerEvent {
    Data(ConnId, Bytes),
    Lost(ConnId),
}

struct ServerDelivery {
    conn_id: ConnId,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Delivery for ServerDelivery {
    fn deliver(&mut self, payload: Bytes) {
        let _ = self.events.send(ServerEvent::Data(self.conn_id, payload));
    }

    fn connection_lost(&mut self, conn_id: ConnId) {
        let _ = self.events.send(ServerEvent::Lost(conn_id));
    }
}

#[derive(Debug)]
enum DemuxCommand {
    Inbound(SocketAddr, Message),
    Write {
        conn_id: ConnId,
        payload: Bytes,
        reply: oneshot::Sender<LspResult<()>>,
    },
    CloseConn {
        conn_id: ConnId,
        reply: oneshot::Sender<LspResult<()>>,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
}

struct ConnectionEntry {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    peer: SocketAddr,
    /// closed locally, waiting for the connection to flush
    closing: bool,
}

struct Demultiplexer {
    socket: Arc<dyn DatagramSocket>,
    params: Arc<LspParams>,
    epochs: watch::Receiver<Epoch>,

    connections: FxHashMap<ConnId, ConnectionEntry>,
    by_addr: FxHashMap<SocketAddr, ConnId>,
    next_conn_id: ConnId,

    /// `None` once the server is shut down
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    notifier: Arc<ConnectionEventNotifier>,
    finished: mpsc::UnboundedSender<(ConnId, Option<CloseReason>)>,
    close_all_replies: Vec<oneshot::Sender<()>>,
}

impl Demultiplexer {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DemuxCommand>, mut finished: mpsc::UnboundedReceiver<(ConnId, Option<CloseReason>)>) {
        loop {
            select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("server went away - terminating demultiplexer");
                        break;
                    }
                },
                Some((conn_id, reason)) = finished.recv() => {
                    self.on_connection_finished(conn_id, reason);
                }
            }
        }
    }

    async fn on_command(&mut self, cmd: DemuxCommand) {
        match cmd {
            DemuxCommand::Inbound(from, message) => self.on_inbound(from, message).await,
            DemuxCommand::Write { conn_id, payload, reply } => {
                let _ = reply.send(self.on_write(conn_id, payload));
            }
            DemuxCommand::CloseConn { conn_id, reply } => {
                let _ = reply.send(self.on_close_conn(conn_id));
            }
            DemuxCommand::CloseAll { reply } => self.on_close_all(reply),
        }
    }

    async fn on_inbound(&mut self, from: SocketAddr, message: Message) {
        if let Message::Connect { .. } = message {
            self.on_connect(from).await;
            return;
        }

        let conn_id = message.conn_id();
        match self.connections.get(&conn_id) {
            Some(entry) if entry.peer == from => {
                // the connection task may have terminated already, the message is irrelevant then
                let _ = entry.commands.send(ConnectionCommand::Inbound(message));
            }
            Some(entry) => {
                warn!("message for connection {} from {:?}, but the connection belongs to {:?} - dropping", conn_id, from, entry.peer);
            }
            None => {
                debug!("message for unknown connection {} from {:?} - dropping", conn_id, from);
            }
        }
    }

    async fn on_connect(&mut self, from: SocketAddr) {
        if let Some(&conn_id) = self.by_addr.get(&from) {
            debug!("repeated connect request from {:?} - acknowledging connection {} again", from, conn_id);
            send_or_log(self.socket.as_ref(), from, &Message::ack(conn_id, SeqNum::ZERO)).await;
            if let Some(entry) = self.connections.get(&conn_id) {
                let _ = entry.commands.send(ConnectionCommand::Inbound(Message::connect()));
            }
            return;
        }
        let events = match &self.events {
            Some(events) if self.close_all_replies.is_empty() => events.clone(),
            _ => {
                debug!("server is shutting down - ignoring connect request from {:?}", from);
                return;
            }
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id = conn_id.next();
        info!("new connection {} from {:?}", conn_id, from);

        let (commands, commands_recv) = mpsc::unbounded_channel();
        let mut epochs = self.epochs.clone();
        let state = ConnectionState::new_active(conn_id, &self.params, *epochs.borrow_and_update());
        let connection = run_connection(
            state,
            self.socket.clone(),
            from,
            commands_recv,
            epochs,
            ServerDelivery { conn_id, events },
        );
        let finished = self.finished.clone();
        tokio::spawn(async move {
            let reason = connection.await;
            let _ = finished.send((conn_id, reason));
        });

        self.connections.insert(conn_id, ConnectionEntry { commands, peer: from, closing: false });
        self.by_addr.insert(from, conn_id);

        send_or_log(self.socket.as_ref(), from, &Message::ack(conn_id, SeqNum::ZERO)).await;
        self.notifier.send_event(ConnectionEvent::Connected { conn_id, peer: from });
    }

    fn open_connection(&self, conn_id: ConnId) -> LspResult<&ConnectionEntry> {
        match self.connections.get(&conn_id) {
            Some(entry) if !entry.closing => Ok(entry),
            _ => Err(LspError::UnknownConnection(conn_id)),
        }
    }

    fn on_write(&self, conn_id: ConnId, payload: Bytes) -> LspResult<()> {
        self.open_connection(conn_id)?
            .commands.send(ConnectionCommand::Write(payload))
            .map_err(|_| LspError::UnknownConnection(conn_id))
    }

    fn on_close_conn(&mut self, conn_id: ConnId) -> LspResult<()> {
        self.open_connection(conn_id)?;
        if let Some(entry) = self.connections.get_mut(&conn_id) {
            debug!("closing connection {}", conn_id);
            entry.closing = true;
            let _ = entry.commands.send(ConnectionCommand::Close);
        }
        Ok(())
    }

    fn on_close_all(&mut self, reply: oneshot::Sender<()>) {
        info!("closing all {} connection(s)", self.connections.len());
        for (conn_id, entry) in self.connections.iter_mut() {
            if !entry.closing {
                debug!("closing connection {}", conn_id);
                entry.closing = true;
                let _ = entry.commands.send(ConnectionCommand::Close);
            }
        }
        self.close_all_replies.push(reply);
        self.check_shutdown_complete();
    }

    fn on_connection_finished(&mut self, conn_id: ConnId, reason: Option<CloseReason>) {
        let Some(entry) = self.connections.remove(&conn_id) else {
            return;
        };
        self.by_addr.remove(&entry.peer);

        match reason {
            Some(CloseReason::Idle) | Some(CloseReason::ConnectTimedOut) => {
                self.notifier.send_event(ConnectionEvent::Lost { conn_id });
            }
            Some(CloseReason::Flushed) | Some(CloseReason::FlushTimedOut) => {
                // the connection task is done, so this comes after all of its payloads
                if let Some(events) = &self.events {
                    let _ = events.send(ServerEvent::Lost(conn_id));
                }
                self.notifier.send_event(ConnectionEvent::Closed { conn_id });
            }
            None => {}
        }
        self.check_shutdown_complete();
    }

    fn check_shutdown_complete(&mut self) {
        if self.close_all_replies.is_empty() || !self.connections.is_empty() {
            return;
        }
        debug!("all connections closed");
        // reads fail once the remaining events are consumed
        self.events = None;
        for reply in self.close_all_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}

/// The server side: accepts connections from any number of clients.
///
/// All methods take `&self`, so the server can be shared between tasks. Dropping the server
///  terminates all connections without flushing them.
pub struct Server {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<DemuxCommand>,
    events: Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
    notifier: Arc<ConnectionEventNotifier>,
    receive_loop: JoinHandle<()>,
    demultiplexer: JoinHandle<()>,
    epoch_timer: EpochTimer,
}

impl Server {
    /// Starts listening on the given UDP port on all IPv4 interfaces; port 0 picks a free port.
    ///  This does not wait for clients.
    pub async fn start(port: u16, params: LspParams) -> LspResult<Server> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        Self::start_with_socket(Arc::new(socket), params)
    }

    pub fn start_with_socket(socket: Arc<dyn DatagramSocket>, params: LspParams) -> LspResult<Server> {
        params.validate()
            .map_err(|e| LspError::InvalidParams(e.to_string()))?;
        let local_addr = socket.local_addr()?;
        info!("starting server on {:?}", local_addr);

        let epoch_timer = EpochTimer::start(params.epoch_duration());
        let notifier = Arc::new(ConnectionEventNotifier::new());
        let (events_send, events) = mpsc::unbounded_channel();
        let (finished_send, finished) = mpsc::unbounded_channel();
        let (commands, commands_recv) = mpsc::unbounded_channel();

        let demultiplexer = Demultiplexer {
            socket: socket.clone(),
            params: Arc::new(params),
            epochs: epoch_timer.subscribe(),
            connections: FxHashMap::default(),
            by_addr: FxHashMap::default(),
            next_conn_id: ConnId::from_raw(1),
            events: Some(events_send),
            notifier: notifier.clone(),
            finished: finished_send,
            close_all_replies: Vec::new(),
        };
        let demultiplexer = tokio::spawn(demultiplexer.run(commands_recv, finished));

        let receive_loop = tokio::spawn(receive_loop(socket, commands.clone(), |from, message| {
            Some(DemuxCommand::Inbound(from, message))
        }));

        Ok(Server {
            local_addr,
            commands,
            events: Mutex::new(events),
            notifier,
            receive_loop,
            demultiplexer,
            epoch_timer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.notifier.subscribe()
    }

    /// Waits for the next payload from any connection. A connection's payloads are returned
    ///  exactly once and in the order the client wrote them.
    ///
    /// Fails with [LspError::ConnectionLost] for a connection that timed out or was closed
    ///  locally, after its last payload was returned. Once [Server::close_all] completed and
    ///  all of that was read, it fails with [LspError::ConnectionClosed].
    pub async fn read(&self) -> LspResult<(ConnId, Bytes)> {
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(ServerEvent::Data(conn_id, payload)) => Ok((conn_id, payload)),
            Some(ServerEvent::Lost(conn_id)) => Err(LspError::ConnectionLost(conn_id)),
            None => Err(LspError::ConnectionClosed),
        }
    }

    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> DemuxCommand) -> LspResult<T> {
        let (reply, reply_recv) = oneshot::channel();
        self.commands.send(cmd(reply))
            .map_err(|_| LspError::ConnectionClosed)?;
        reply_recv.await
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Queues a payload for sending on a connection. This only waits for the connection table
    ///  lookup, not for anything on the network.
    pub async fn write(&self, conn_id: ConnId, payload: impl Into<Bytes>) -> LspResult<()> {
        let payload = payload.into();
        self.request(|reply| DemuxCommand::Write { conn_id, payload, reply }).await?
    }

    /// Closes a connection without waiting: pending data is flushed in the background, and
    ///  writes to the connection fail from now on.
    pub async fn close_conn(&self, conn_id: ConnId) -> LspResult<()> {
        self.request(|reply| DemuxCommand::CloseConn { conn_id, reply }).await?
    }

    /// Closes all connections, waiting until each has flushed its pending data or hit the
    ///  epoch limit for that. New connections are refused from then on.
    pub async fn close_all(&self) -> LspResult<()> {
        self.request(|reply| DemuxCommand::CloseAll { reply }).await?;
        self.receive_loop.abort();
        self.epoch_timer.stop();
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.receive_loop.abort();
        self.demultiplexer.abort();
    }
}
