use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use crate::config::LspParams;
use crate::connection::{run_connection, ConnectionCommand, Delivery};
use crate::connection_state::{CloseReason, ConnectionState};
use crate::epoch_timer::EpochTimer;
use crate::error::{LspError, LspResult};
use crate::ids::ConnId;
use crate::transport::{receive_loop, send_message, DatagramSocket};

struct ClientDelivery {
    established: Option<oneshot::Sender<ConnId>>,
    deliveries: mpsc::UnboundedSender<Bytes>,
}

impl Delivery for ClientDelivery {
    fn established(&mut self, conn_id: ConnId) {
        if let Some(established) = self.established.take() {
            let _ = established.send(conn_id);
        }
    }

    fn deliver(&mut self, payload: Bytes) {
        // the client may be gone, that's fine
        let _ = self.deliveries.send(payload);
    }
}

/// The client side of a connection.
///
/// All methods take `&self`, so a client can be shared between a reading and a writing task.
///  The connection is driven by background tasks that run until the client is closed, the
///  connection is lost, or the client is dropped (which discards unsent data).
pub struct Client {
    conn_id: ConnId,
    server_addr: SocketAddr,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    /// closing of this queue is the termination signal of the connection
    deliveries: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
    connection: Mutex<Option<JoinHandle<Option<CloseReason>>>>,
    receive_loop: JoinHandle<()>,
    epoch_timer: EpochTimer,
}

impl Client {
    /// Connects to a server over a fresh UDP socket, returning once the server acknowledged the
    ///  connection. Fails with [LspError::ConnectTimeout] if there is no acknowledgement within
    ///  `epoch_limit` epochs, and with [LspError::Io] if the connect request can not be sent.
    pub async fn connect(server_addr: SocketAddr, params: LspParams) -> LspResult<Client> {
        let local_addr = if server_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        }
        else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local_addr).await?;
        Self::connect_with_socket(Arc::new(socket), server_addr, params).await
    }

    pub async fn connect_with_socket(socket: Arc<dyn DatagramSocket>, server_addr: SocketAddr, params: LspParams) -> LspResult<Client> {
        params.validate()
            .map_err(|e| LspError::InvalidParams(e.to_string()))?;

        debug!("connecting to {:?}", server_addr);
        let epoch_timer = EpochTimer::start(params.epoch_duration());
        let (state, connect) = ConnectionState::new_connecting(&params, epoch_timer.current());
        send_message(socket.as_ref(), server_addr, &connect).await?;

        let (commands, commands_recv) = mpsc::unbounded_channel();
        let receive_loop = tokio::spawn(receive_loop(socket.clone(), commands.clone(), move |from, message| {
            if from == server_addr {
                Some(ConnectionCommand::Inbound(message))
            }
            else {
                debug!("ignoring message from {:?}", from);
                None
            }
        }));

        let (established, established_recv) = oneshot::channel();
        let (deliveries_send, deliveries) = mpsc::unbounded_channel();
        let delivery = ClientDelivery {
            established: Some(established),
            deliveries: deliveries_send,
        };

        let connection = tokio::spawn(run_connection(
            state,
            socket,
            server_addr,
            commands_recv,
            epoch_timer.subscribe(),
            delivery,
        ));

        match established_recv.await {
            Ok(conn_id) => {
                info!("connected to {:?} as connection {}", server_addr, conn_id);
                Ok(Client {
                    conn_id,
                    server_addr,
                    commands,
                    deliveries: Mutex::new(deliveries),
                    closed: AtomicBool::new(false),
                    connection: Mutex::new(Some(connection)),
                    receive_loop,
                    epoch_timer,
                })
            }
            Err(_) => {
                info!("connecting to {:?} timed out", server_addr);
                receive_loop.abort();
                connection.abort();
                Err(LspError::ConnectTimeout)
            }
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Waits for the next payload from the server. Payloads are returned exactly once and in the
    ///  order the server wrote them.
    ///
    /// Fails with [LspError::ConnectionLost] once the connection is gone, whether it timed out
    ///  or was closed by [Client::close]. Payloads that arrived before that are still returned
    ///  first.
    pub async fn read(&self) -> LspResult<Bytes> {
        let mut deliveries = self.deliveries.lock().await;
        deliveries.recv().await
            .ok_or(LspError::ConnectionLost(self.conn_id))
    }

    /// Queues a payload for sending and returns immediately
    pub fn write(&self, payload: impl Into<Bytes>) -> LspResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LspError::ConnectionClosed);
        }
        self.commands.send(ConnectionCommand::Write(payload.into()))
            .map_err(|_| LspError::ConnectionLost(self.conn_id))
    }

    /// Closes the connection, waiting until all written data is acknowledged by the server or
    ///  `epoch_limit` epochs have passed. Calling it again has no effect.
    pub async fn close(&self) -> LspResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing connection {}", self.conn_id);

        // fails if the connection is gone already, which is fine
        let _ = self.commands.send(ConnectionCommand::Close);
        if let Some(connection) = self.connection.lock().await.take() {
            match connection.await {
                Ok(reason) => debug!("connection {} terminated: {:?}", self.conn_id, reason),
                Err(e) => error!("connection task {} failed: {}", self.conn_id, e),
            }
        }

        self.receive_loop.abort();
        self.epoch_timer.stop();
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receive_loop.abort();
        if let Some(connection) = self.connection.get_mut().take() {
            connection.abort();
        }
    }
}
