use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, span, trace, warn, Level};
use uuid::Uuid;
use crate::message::Message;

/// Upper bound for the size of a received datagram; bigger datagrams are truncated by the
///  socket and then rejected as malformed
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// This is the unreliable datagram network the protocol runs on, introduced as an abstraction to
///  allow fault injection and mocking the I/O part away for testing.
///
/// Implementations must be safe to use from several connections concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        UdpSocket::send_to(self, datagram, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

pub async fn send_message(socket: &dyn DatagramSocket, to: SocketAddr, message: &Message) -> io::Result<()> {
    trace!("sending {:?} to {:?}", message, to);
    socket.send_to(to, &message.encode()).await
}

/// For sends from inside the engine: there is no caller to report to, and a failed send looks
///  like a dropped datagram to the protocol, so it is recovered by retransmission or idle timeout.
pub async fn send_or_log(socket: &dyn DatagramSocket, to: SocketAddr, message: &Message) {
    if let Err(e) = send_message(socket, to, message).await {
        error!("error sending {:?} to {:?}: {}", message, to, e);
    }
}

/// Pause after a transient receive error, so a socket that keeps failing does not keep the
///  receive loop spinning
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Errors a UDP socket can report for a single datagram (e.g. ICMP feedback for an earlier
///  send) while remaining usable
fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
    )
}

/// Receives datagrams, decoding them and forwarding valid messages. Malformed and corrupted
///  datagrams are dropped here, so nothing downstream ever sees them. `route` turns a message
///  into whatever the receiving side expects, or returns `None` to drop it.
///
/// The loop terminates when the receiving end of `inbound` is dropped, or on a receive error
///  that is not transient. Its connections then see silence and time out.
pub async fn receive_loop<T, F>(socket: Arc<dyn DatagramSocket>, inbound: mpsc::UnboundedSender<T>, route: F)
where
    T: Send + 'static,
    F: Fn(SocketAddr, Message) -> Option<T> + Send + 'static,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) if is_transient(&e) && !inbound.is_closed() => {
                warn!("socket error: {} - pausing before receiving again", e);
                time::sleep(RECEIVE_ERROR_PAUSE).await;
                continue;
            }
            Err(e) => {
                error!("socket error: {} - terminating receive loop", e);
                break;
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        let message = match Message::decode(&buf[..num_read]) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                continue;
            }
        };

        trace!("received {:?} from {:?}", message, from);
        let Some(routed) = route(from, message) else {
            continue;
        };
        if inbound.send(routed).is_err() {
            debug!("receiver went away - terminating receive loop");
            break;
        }
    }
}
