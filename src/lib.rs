//! LSP ("live sequence protocol") is a lightweight reliable transport on top of UDP. A server
//!  accepts connections from any number of clients; on each connection, both sides can send
//!  messages that are delivered exactly once and in order, in spite of datagrams being lost,
//!  duplicated, reordered or corrupted on the way.
//!
//! ## Design
//!
//! Time is divided into *epochs* by a periodic timer, and all timing decisions are expressed as
//!  "N epochs without some event": retransmission of unacknowledged messages, heartbeats on
//!  quiet connections, connect timeout, and declaring a connection lost.
//!
//! Each side assigns consecutive sequence numbers to the messages it sends, starting at 1.
//!  Sending is restricted by a sliding window: message `s` is sent only if it is within
//!  `window_size` of the oldest unacknowledged message. The receiver acknowledges cumulatively
//!  (`Ack(n)` covers everything up to `n`), plus selectively (`Cack`) for messages that arrived
//!  before a gap was filled. A connection that received nothing at all for `epoch_limit`
//!  epochs is lost, which is why quiet connections send heartbeats (`Ack(connId, 0)`).
//!
//! The reliability algorithm lives in [connection_state], free of I/O. Each connection runs as
//!  a task ([connection]) feeding it with messages and epoch ticks; on the server, a single
//!  demultiplexer task owns the connection table and routes datagrams to connection tasks.
//!
//! ## Wire format
//!
//! Every message is a single datagram, numbers are big-endian:
//!
//! ```text
//! 0:  kind (u8): 0 = Connect, 1 = Data, 2 = Ack, 3 = Cack
//! 1:  connection id (u32), 0 for Connect
//! 5:  sequence number (u32)
//! 9:  payload length (u32), 0 for everything but Data
//! 13: CRC-32 checksum (u32) over all of the above and the payload
//! 17: payload
//! ```
//!
//! Datagrams that fail to parse or have a wrong checksum are dropped silently: the sender's
//!  retransmission is the only recovery, and the application never sees them.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod connection_events;
pub mod connection_state;
pub mod epoch_timer;
pub mod error;
pub mod fault_injection;
pub mod ids;
pub mod message;
pub mod server;
pub mod test_util;
pub mod transport;

pub use client::Client;
pub use config::LspParams;
pub use connection_events::ConnectionEvent;
pub use error::{LspError, LspResult};
pub use ids::ConnId;
pub use server::Server;

#[cfg(test)]
mod end_to_end_tests;
