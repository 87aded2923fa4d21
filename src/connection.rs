//! The task driving a single connection, used by both client and server. It owns the
//!  connection's [ConnectionState] and is fed through a command channel (inbound messages and
//!  application requests) and the epoch timer's watch channel. Everything it has to tell the
//!  application goes through a [Delivery].

use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};
use crate::connection_state::{CloseReason, ConnectionPhase, ConnectionState};
use crate::ids::{ConnId, Epoch, SeqNum};
use crate::message::Message;
use crate::transport::{send_or_log, DatagramSocket};

#[derive(Debug)]
pub enum ConnectionCommand {
    /// a decoded message from the peer
    Inbound(Message),
    /// an application payload to send
    Write(Bytes),
    Close,
}

pub trait Delivery: Send + Sync + 'static {
    /// the connection was established, i.e. the server acknowledged `Connect`
    fn established(&mut self, _conn_id: ConnId) {}

    /// a payload is ready for the application; called strictly in sequence order
    fn deliver(&mut self, payload: Bytes);

    /// the connection ended without being closed locally (idle timeout or connect timeout).
    ///  Called at most once, and nothing is delivered afterwards.
    fn connection_lost(&mut self, _conn_id: ConnId) {}
}

struct ConnectionDriver<D: Delivery> {
    state: ConnectionState,
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    delivery: D,
}

impl<D: Delivery> ConnectionDriver<D> {
    async fn send_all(&self, messages: &[Message]) {
        for message in messages {
            send_or_log(self.socket.as_ref(), self.peer, message).await;
        }
    }

    async fn on_inbound(&mut self, message: Message) {
        let is_connecting = self.state.phase() == ConnectionPhase::Connecting;
        if let Message::Connect { .. } = message {
            if is_connecting {
                debug!("connection {}: ignoring connect request", self.state.conn_id());
            }
            else {
                trace!("connection {}: peer repeated its connect request", self.state.conn_id());
                self.state.on_connect_repeated();
            }
            return;
        }
        if !is_connecting && message.conn_id() != self.state.conn_id() {
            debug!("connection {}: ignoring message for connection {}", self.state.conn_id(), message.conn_id());
            return;
        }

        match message {
            Message::Connect { .. } => {}
            Message::Ack { conn_id, seq_num } if is_connecting && seq_num == SeqNum::ZERO => {
                if self.state.on_connect_acked(conn_id) {
                    self.delivery.established(conn_id);
                }
            }
            Message::Ack { seq_num, .. } => {
                self.state.on_ack_received(seq_num);
            }
            Message::Cack { seq_num, .. } => {
                self.state.on_cack_received(seq_num);
            }
            Message::Data { seq_num, payload, .. } => {
                let receipt = self.state.on_data_received(seq_num, payload);
                self.send_all(&receipt.acks).await;
                for payload in receipt.deliverable {
                    self.delivery.deliver(payload);
                }
            }
        }
    }

    fn on_write(&mut self, payload: Bytes) {
        match self.state.phase() {
            ConnectionPhase::Connecting | ConnectionPhase::Active => {
                self.state.enqueue_send(payload);
            }
            phase => {
                debug!("connection {}: discarding write in phase {:?}", self.state.conn_id(), phase);
            }
        }
    }

    async fn on_epoch(&mut self, now: Epoch) -> Option<CloseReason> {
        let actions = self.state.on_epoch(now);
        self.send_all(&actions.to_send).await;
        actions.closed
    }

    /// transmits what the window permits, and checks if a closing connection is done
    async fn flush(&mut self) -> Option<CloseReason> {
        let messages = self.state.transmittable();
        self.send_all(&messages).await;
        self.state.check_flushed()
    }

    fn finish(mut self, reason: CloseReason) -> CloseReason {
        let conn_id = self.state.conn_id();
        match reason {
            CloseReason::Idle | CloseReason::ConnectTimedOut => {
                info!("connection {} to {:?} lost: {:?}", conn_id, self.peer, reason);
                self.delivery.connection_lost(conn_id);
            }
            CloseReason::Flushed | CloseReason::FlushTimedOut => {
                debug!("connection {} to {:?} closed: {:?}", conn_id, self.peer, reason);
            }
        }
        reason
    }
}

/// Runs a connection until it is closed, returning the reason. A connecting client sends its
///  first `Connect` before starting this; retries are driven by the epochs.
///
/// Returns `None` if the epoch timer went away, i.e. the owning engine shut down.
pub async fn run_connection<D: Delivery>(
    state: ConnectionState,
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    mut epochs: watch::Receiver<Epoch>,
    delivery: D,
) -> Option<CloseReason> {
    let mut driver = ConnectionDriver { state, socket, peer, delivery };

    let mut commands_open = true;
    loop {
        let closed = select! {
            biased;
            cmd = commands.recv(), if commands_open => {
                match cmd {
                    Some(ConnectionCommand::Inbound(message)) => {
                        trace!("connection {}: received {:?}", driver.state.conn_id(), message);
                        driver.on_inbound(message).await;
                        None
                    }
                    Some(ConnectionCommand::Write(payload)) => {
                        driver.on_write(payload);
                        None
                    }
                    Some(ConnectionCommand::Close) => {
                        debug!("connection {}: closing", driver.state.conn_id());
                        driver.state.begin_close()
                    }
                    None => {
                        debug!("connection {}: owner went away - closing", driver.state.conn_id());
                        commands_open = false;
                        driver.state.begin_close()
                    }
                }
            }
            changed = epochs.changed() => {
                if changed.is_err() {
                    debug!("connection {}: epoch timer stopped - terminating", driver.state.conn_id());
                    return None;
                }
                let now = *epochs.borrow_and_update();
                driver.on_epoch(now).await
            }
        };

        let closed = match closed {
            Some(reason) => Some(reason),
            None => driver.flush().await,
        };
        if let Some(reason) = closed {
            return Some(driver.finish(reason));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use crate::config::LspParams;
    use crate::transport::MockDatagramSocket;

    #[derive(Debug, Eq, PartialEq)]
    enum Delivered {
        Established(ConnId),
        Payload(Bytes),
        Lost(ConnId),
    }

    struct TestDelivery(mpsc::UnboundedSender<Delivered>);
    impl Delivery for TestDelivery {
        fn established(&mut self, conn_id: ConnId) {
            let _ = self.0.send(Delivered::Established(conn_id));
        }
        fn deliver(&mut self, payload: Bytes) {
            let _ = self.0.send(Delivered::Payload(payload));
        }
        fn connection_lost(&mut self, conn_id: ConnId) {
            let _ = self.0.send(Delivered::Lost(conn_id));
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<ConnectionCommand>,
        epochs: watch::Sender<Epoch>,
        sent: mpsc::UnboundedReceiver<Message>,
        delivered: mpsc::UnboundedReceiver<Delivered>,
        handle: JoinHandle<Option<CloseReason>>,
    }

    impl Harness {
        fn start(state: ConnectionState) -> Harness {
            let (sent_send, sent) = mpsc::unbounded_channel();
            let mut socket = MockDatagramSocket::new();
            socket.expect_send_to()
                .returning(move |_, datagram| {
                    let _ = sent_send.send(Message::decode(datagram).unwrap());
                    Ok(())
                });

            let (commands, commands_recv) = mpsc::unbounded_channel();
            let (epochs, epochs_recv) = watch::channel(Epoch::ZERO);
            let (delivered_send, delivered) = mpsc::unbounded_channel();

            let handle = tokio::spawn(run_connection(
                state,
                Arc::new(socket),
                SocketAddr::from(([127, 0, 0, 1], 9876)),
                commands_recv,
                epochs_recv,
                TestDelivery(delivered_send),
            ));
            Harness { commands, epochs, sent, delivered, handle }
        }

        fn inbound(&self, message: Message) {
            self.commands.send(ConnectionCommand::Inbound(message)).unwrap();
        }

        fn tick(&self, epoch: u64) {
            self.epochs.send_replace(Epoch::from_raw(epoch));
        }

        async fn next_sent(&mut self) -> Message {
            timeout(Duration::from_secs(5), self.sent.recv()).await.unwrap().unwrap()
        }

        async fn next_delivered(&mut self) -> Delivered {
            timeout(Duration::from_secs(5), self.delivered.recv()).await.unwrap().unwrap()
        }
    }

    fn conn() -> ConnId {
        ConnId::from_raw(3)
    }

    fn active(params: &LspParams) -> ConnectionState {
        ConnectionState::new_active(conn(), params, Epoch::ZERO)
    }

    #[tokio::test]
    async fn test_data_is_acked_and_delivered() {
        let mut harness = Harness::start(active(&LspParams::new(5, 100, 1)));

        harness.inbound(Message::data(conn(), SeqNum::FIRST, Bytes::from_static(b"hello")));
        assert_eq!(harness.next_sent().await, Message::ack(conn(), SeqNum::FIRST));
        assert_eq!(harness.next_delivered().await, Delivered::Payload(Bytes::from_static(b"hello")));

        // retransmitted duplicate
        harness.inbound(Message::data(conn(), SeqNum::FIRST, Bytes::from_static(b"hello")));
        assert_eq!(harness.next_sent().await, Message::ack(conn(), SeqNum::FIRST));
        assert!(harness.delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_for_other_connections_are_ignored() {
        let mut harness = Harness::start(active(&LspParams::new(5, 100, 1)));

        harness.inbound(Message::data(ConnId::from_raw(99), SeqNum::FIRST, Bytes::from_static(b"x")));
        harness.inbound(Message::data(conn(), SeqNum::FIRST, Bytes::from_static(b"y")));
        assert_eq!(harness.next_sent().await, Message::ack(conn(), SeqNum::FIRST));
        assert_eq!(harness.next_delivered().await, Delivered::Payload(Bytes::from_static(b"y")));
    }

    #[tokio::test]
    async fn test_write_is_resent_until_acked() {
        let mut harness = Harness::start(active(&LspParams::new(5, 100, 1)));
        let expected = Message::data(conn(), SeqNum::FIRST, Bytes::from_static(b"abc"));

        harness.commands.send(ConnectionCommand::Write(Bytes::from_static(b"abc"))).unwrap();
        assert_eq!(harness.next_sent().await, expected);

        harness.tick(1);
        assert_eq!(harness.next_sent().await, expected);

        harness.inbound(Message::ack(conn(), SeqNum::FIRST));
        harness.tick(2);
        assert_eq!(harness.next_sent().await, Message::heartbeat(conn()));
    }

    #[tokio::test]
    async fn test_idle_connection_is_lost() {
        let mut harness = Harness::start(active(&LspParams::new(5, 100, 1)));

        harness.tick(5);
        assert_eq!(harness.next_delivered().await, Delivered::Lost(conn()));
        assert_eq!(harness.handle.await.unwrap(), Some(CloseReason::Idle));
    }

    #[tokio::test]
    async fn test_close_waits_for_acks() {
        let mut harness = Harness::start(active(&LspParams::new(5, 100, 1)));

        harness.commands.send(ConnectionCommand::Write(Bytes::from_static(b"last words"))).unwrap();
        harness.commands.send(ConnectionCommand::Close).unwrap();
        harness.commands.send(ConnectionCommand::Write(Bytes::from_static(b"too late"))).unwrap();
        assert_eq!(harness.next_sent().await.seq_num(), SeqNum::FIRST);
        assert!(!harness.handle.is_finished());

        harness.inbound(Message::ack(conn(), SeqNum::FIRST));
        assert_eq!(harness.handle.await.unwrap(), Some(CloseReason::Flushed));
        assert!(harness.delivered.try_recv().is_err());
        while let Ok(message) = harness.sent.try_recv() {
            assert_ne!(message.seq_num(), SeqNum::from_raw(2));
        }
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let params = LspParams::new(5, 100, 1);
        let (state, _) = ConnectionState::new_connecting(&params, Epoch::ZERO);
        let mut harness = Harness::start(state);

        harness.commands.send(ConnectionCommand::Write(Bytes::from_static(b"early"))).unwrap();
        harness.tick(1);
        assert_eq!(harness.next_sent().await, Message::connect());

        let assigned = ConnId::from_raw(12);
        harness.inbound(Message::ack(assigned, SeqNum::ZERO));
        assert_eq!(harness.next_delivered().await, Delivered::Established(assigned));
        assert_eq!(harness.next_sent().await, Message::data(assigned, SeqNum::FIRST, Bytes::from_static(b"early")));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let params = LspParams::new(3, 100, 1);
        let (state, _) = ConnectionState::new_connecting(&params, Epoch::ZERO);
        let mut harness = Harness::start(state);

        harness.tick(3);
        assert_eq!(harness.next_delivered().await, Delivered::Lost(ConnId::NONE));
        assert_eq!(harness.handle.await.unwrap(), Some(CloseReason::ConnectTimedOut));
    }

    #[tokio::test]
    async fn test_repeated_connect_keeps_connection_alive() {
        let mut harness = Harness::start(active(&LspParams::new(5, 100, 1)));

        harness.tick(3);
        assert_eq!(harness.next_sent().await, Message::heartbeat(conn()));
        harness.inbound(Message::connect());

        // would be idle at epoch 5 without the repeated connect
        harness.tick(7);
        assert_eq!(harness.next_sent().await, Message::heartbeat(conn()));
        harness.tick(8);
        assert_eq!(harness.next_delivered().await, Delivered::Lost(conn()));
    }

    #[tokio::test]
    async fn test_terminates_when_timer_stops() {
        let harness = Harness::start(active(&LspParams::new(5, 100, 1)));
        drop(harness.epochs);
        assert_eq!(harness.handle.await.unwrap(), None);
    }
}
