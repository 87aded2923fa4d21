//! The reliability algorithm of a single connection, shared by client and server. There is no
//!  I/O and no timer in here: the owning driver feeds it inbound messages, application writes
//!  and epoch ticks, and transmits whatever messages it returns.
//!
//! Send side: written payloads get consecutive sequence numbers starting at 1. They wait in a
//!  queue until the send window has room, are then transmitted and kept in the window until
//!  acknowledged, being resent on epoch ticks according to their [RetransmitBackoff].
//!
//! Receive side: data messages are delivered strictly in sequence. Messages arriving early are
//!  buffered until the gap before them is filled, duplicates are acknowledged again but never
//!  delivered twice.

use std::collections::{BTreeMap, VecDeque};
use bytes::Bytes;
use tracing::{debug, trace};
use crate::backoff::RetransmitBackoff;
use crate::config::LspParams;
use crate::ids::{ConnId, Epoch, SeqNum};
use crate::message::Message;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionPhase {
    /// client only: `Connect` was sent, waiting for the server's ack
    Connecting,
    Active,
    /// no more writes accepted, waiting for outstanding messages to be acknowledged
    Closing { since: Epoch },
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// all pending data was acknowledged after a local close
    Flushed,
    /// the closing epoch cap was reached with data still unacknowledged
    FlushTimedOut,
    /// no message was received for `epoch_limit` epochs
    Idle,
    /// no ack for `Connect` within `epoch_limit` epochs
    ConnectTimedOut,
}

/// What the owner has to do after an epoch tick
#[derive(Debug, Default, Eq, PartialEq)]
pub struct EpochActions {
    pub to_send: Vec<Message>,
    pub closed: Option<CloseReason>,
}

/// What the owner has to do after receiving a data message
#[derive(Debug, Default, Eq, PartialEq)]
pub struct DataReceipt {
    /// payloads that became deliverable, in sequence order
    pub deliverable: Vec<Bytes>,
    pub acks: Vec<Message>,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    backoff: RetransmitBackoff,
}

#[derive(Debug)]
pub struct ConnectionState {
    conn_id: ConnId,
    phase: ConnectionPhase,

    epoch_limit: u32,
    window_size: usize,
    max_unacked_messages: usize,
    max_backoff_interval: u32,

    next_send_seq: SeqNum,
    /// written but not transmitted yet because the window is full
    send_queue: VecDeque<(SeqNum, Bytes)>,
    send_window: BTreeMap<SeqNum, InFlight>,

    next_expected_recv_seq: SeqNum,
    receive_buffer: BTreeMap<SeqNum, Bytes>,

    current_epoch: Epoch,
    last_activity: Epoch,
    /// set by every transmission between two epoch ticks, decides about heartbeats
    sent_since_last_epoch: bool,
    connect_attempt: Option<RetransmitBackoff>,
}

impl ConnectionState {
    /// server side: the connection is established on receipt of `Connect`
    pub fn new_active(conn_id: ConnId, params: &LspParams, now: Epoch) -> ConnectionState {
        Self::new(conn_id, ConnectionPhase::Active, params, now)
    }

    /// client side: returns the state together with the `Connect` message to send
    pub fn new_connecting(params: &LspParams, now: Epoch) -> (ConnectionState, Message) {
        let mut state = Self::new(ConnId::NONE, ConnectionPhase::Connecting, params, now);
        state.connect_attempt = Some(RetransmitBackoff::new(now, 0));
        state.sent_since_last_epoch = true;
        (state, Message::connect())
    }

    fn new(conn_id: ConnId, phase: ConnectionPhase, params: &LspParams, now: Epoch) -> ConnectionState {
        ConnectionState {
            conn_id,
            phase,
            epoch_limit: params.epoch_limit,
            window_size: params.window_size,
            max_unacked_messages: params.max_unacked_messages,
            max_backoff_interval: params.max_backoff_interval,
            next_send_seq: SeqNum::FIRST,
            send_queue: VecDeque::new(),
            send_window: BTreeMap::new(),
            next_expected_recv_seq: SeqNum::FIRST,
            receive_buffer: BTreeMap::new(),
            current_epoch: now,
            last_activity: now,
            sent_since_last_epoch: false,
            connect_attempt: None,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// true if written data is not acknowledged yet (sent or not)
    pub fn has_pending_sends(&self) -> bool {
        !self.send_window.is_empty() || !self.send_queue.is_empty()
    }

    /// Assigns the next sequence number to a payload and queues it for sending. Call
    ///  [ConnectionState::transmittable] afterwards to get what can go on the wire now.
    pub fn enqueue_send(&mut self, payload: Bytes) -> SeqNum {
        let seq_num = self.next_send_seq;
        self.next_send_seq = seq_num.next();

        trace!("connection {}: queueing message {} ({} bytes)", self.conn_id, seq_num, payload.len());
        self.send_queue.push_back((seq_num, payload));
        seq_num
    }

    fn window_lower_bound(&self) -> SeqNum {
        self.send_window.keys().next()
            .copied()
            .or_else(|| self.send_queue.front().map(|(seq_num, _)| *seq_num))
            .unwrap_or(self.next_send_seq)
    }

    fn can_transmit(&self, seq_num: SeqNum) -> bool {
        seq_num < self.window_lower_bound().plus(self.window_size)
            && self.send_window.len() < self.max_unacked_messages
    }

    /// Moves queued messages into the send window as far as window size and max unacked count
    ///  permit, returning them for transmission.
    pub fn transmittable(&mut self) -> Vec<Message> {
        let mut result = Vec::new();
        if matches!(self.phase, ConnectionPhase::Connecting | ConnectionPhase::Closed) {
            return result;
        }

        while let Some(&(seq_num, _)) = self.send_queue.front() {
            if !self.can_transmit(seq_num) {
                break;
            }
            if let Some((seq_num, payload)) = self.send_queue.pop_front() {
                // NB: the message is created only now because the conn id may have been
                //      unknown when the payload was written
                let message = Message::data(self.conn_id, seq_num, payload);
                self.send_window.insert(seq_num, InFlight {
                    message: message.clone(),
                    backoff: RetransmitBackoff::new(self.current_epoch, self.max_backoff_interval),
                });
                result.push(message);
            }
        }

        if !result.is_empty() {
            self.sent_since_last_epoch = true;
        }
        result
    }

    fn on_activity(&mut self) {
        self.last_activity = self.current_epoch;
    }

    /// server side: the client repeated `Connect` because the ack got lost. It still waits for
    ///  the ack, so this is the only sign of life from that side.
    pub fn on_connect_repeated(&mut self) {
        self.on_activity();
    }

    /// client side: the server acknowledged `Connect`. Returns false if the connection was not
    ///  waiting for that.
    pub fn on_connect_acked(&mut self, conn_id: ConnId) -> bool {
        self.on_activity();
        if self.phase != ConnectionPhase::Connecting {
            return false;
        }

        debug!("connection {} established", conn_id);
        self.conn_id = conn_id;
        self.phase = ConnectionPhase::Active;
        self.connect_attempt = None;
        true
    }

    /// cumulative ack: retires all outstanding messages up to and including `seq_num`
    pub fn on_ack_received(&mut self, seq_num: SeqNum) {
        self.on_activity();
        if seq_num == SeqNum::ZERO {
            trace!("connection {}: heartbeat", self.conn_id);
            return;
        }

        let still_outstanding = self.send_window.split_off(&seq_num.next());
        let retired = std::mem::replace(&mut self.send_window, still_outstanding);
        if !retired.is_empty() {
            trace!("connection {}: ack {} retired {} message(s)", self.conn_id, seq_num, retired.len());
        }
    }

    /// selective ack: retires exactly `seq_num`
    pub fn on_cack_received(&mut self, seq_num: SeqNum) {
        self.on_activity();
        if self.send_window.remove(&seq_num).is_some() {
            trace!("connection {}: selective ack retired {}", self.conn_id, seq_num);
        }
    }

    /// Buffers the payload if it is new, and returns everything that became deliverable in
    ///  sequence, together with the acks to send: always a cumulative ack for the highest
    ///  contiguous sequence number, plus a selective ack if the message arrived early.
    ///  Early messages are buffered only within `window_size` of the next expected one; a
    ///  peer using the same window never sends beyond that.
    pub fn on_data_received(&mut self, seq_num: SeqNum, payload: Bytes) -> DataReceipt {
        self.on_activity();
        let mut receipt = DataReceipt::default();

        if self.phase == ConnectionPhase::Connecting || seq_num == SeqNum::ZERO {
            debug!("connection {}: ignoring data message {} in phase {:?}", self.conn_id, seq_num, self.phase);
            return receipt;
        }

        if seq_num < self.next_expected_recv_seq {
            trace!("connection {}: duplicate of message {} - acknowledging again", self.conn_id, seq_num);
        }
        else if seq_num == self.next_expected_recv_seq {
            receipt.deliverable.push(payload);
            self.next_expected_recv_seq = seq_num.next();
            while let Some(buffered) = self.receive_buffer.remove(&self.next_expected_recv_seq) {
                receipt.deliverable.push(buffered);
                self.next_expected_recv_seq = self.next_expected_recv_seq.next();
            }
        }
        else if seq_num >= self.next_expected_recv_seq.plus(self.window_size) {
            debug!("connection {}: message {} is beyond the receive window starting at {} - dropping", self.conn_id, seq_num, self.next_expected_recv_seq);
        }
        else {
            trace!("connection {}: message {} arrived before {} - buffering", self.conn_id, seq_num, self.next_expected_recv_seq);
            self.receive_buffer.entry(seq_num).or_insert(payload);
            receipt.acks.push(Message::cack(self.conn_id, seq_num));
        }

        receipt.acks.insert(0, Message::ack(self.conn_id, self.next_expected_recv_seq.prev()));
        self.sent_since_last_epoch = true;
        receipt
    }

    /// Outstanding messages that are due for retransmission at `now`, registering the resend.
    ///  The messages are returned unchanged, i.e. with their original sequence number and
    ///  checksum.
    pub fn pending_retransmits(&mut self, now: Epoch) -> Vec<Message> {
        let mut result = Vec::new();
        for in_flight in self.send_window.values_mut() {
            if in_flight.backoff.is_due(now) {
                in_flight.backoff.on_resend(now);
                result.push(in_flight.message.clone());
            }
        }
        if !result.is_empty() {
            debug!("connection {}: resending {} message(s) at {}", self.conn_id, result.len(), now);
        }
        result
    }

    /// true if nothing at all was received for `epoch_limit` epochs
    pub fn is_idle(&self, now: Epoch) -> bool {
        now.since(self.last_activity) >= self.epoch_limit as u64
    }

    /// Starts an orderly close: no more writes, but outstanding data is still sent and resent
    ///  until it is acknowledged or `epoch_limit` epochs have passed.
    pub fn begin_close(&mut self) -> Option<CloseReason> {
        match self.phase {
            ConnectionPhase::Active => {
                if self.has_pending_sends() {
                    self.phase = ConnectionPhase::Closing { since: self.current_epoch };
                    None
                }
                else {
                    self.phase = ConnectionPhase::Closed;
                    Some(CloseReason::Flushed)
                }
            }
            ConnectionPhase::Connecting => {
                self.phase = ConnectionPhase::Closed;
                Some(CloseReason::Flushed)
            }
            ConnectionPhase::Closing { .. } | ConnectionPhase::Closed => None,
        }
    }

    /// Checks whether a closing connection is done. Call after processing acks.
    pub fn check_flushed(&mut self) -> Option<CloseReason> {
        if matches!(self.phase, ConnectionPhase::Closing { .. }) && !self.has_pending_sends() {
            debug!("connection {}: all pending messages acknowledged", self.conn_id);
            self.phase = ConnectionPhase::Closed;
            return Some(CloseReason::Flushed);
        }
        None
    }

    /// Advances the connection to epoch `now`: decides about idle timeout, connect timeout and
    ///  close timeout, collects retransmissions and, if nothing was sent since the last tick,
    ///  a heartbeat.
    pub fn on_epoch(&mut self, now: Epoch) -> EpochActions {
        self.current_epoch = now;
        let mut actions = EpochActions::default();

        match self.phase {
            ConnectionPhase::Closed => return actions,
            ConnectionPhase::Connecting => {
                if self.is_idle(now) {
                    debug!("no ack for connect request after {} epochs", self.epoch_limit);
                    self.phase = ConnectionPhase::Closed;
                    actions.closed = Some(CloseReason::ConnectTimedOut);
                }
                else if let Some(attempt) = &mut self.connect_attempt {
                    if attempt.is_due(now) {
                        attempt.on_resend(now);
                        actions.to_send.push(Message::connect());
                    }
                }
                return actions;
            }
            ConnectionPhase::Active | ConnectionPhase::Closing { .. } => {}
        }

        if self.is_idle(now) {
            debug!("connection {}: nothing received for {} epochs", self.conn_id, self.epoch_limit);
            self.phase = ConnectionPhase::Closed;
            actions.closed = Some(CloseReason::Idle);
            return actions;
        }

        if let ConnectionPhase::Closing { since } = self.phase {
            if now.since(since) >= self.epoch_limit as u64 {
                debug!("connection {}: closing with unacknowledged messages after {} epochs", self.conn_id, self.epoch_limit);
                self.phase = ConnectionPhase::Closed;
                actions.closed = Some(CloseReason::FlushTimedOut);
                return actions;
            }
        }

        actions.to_send = self.pending_retransmits(now);
        if actions.to_send.is_empty() && !self.sent_since_last_epoch {
            actions.to_send.push(Message::heartbeat(self.conn_id));
        }
        self.sent_since_last_epoch = false;
        actions
    }
}
