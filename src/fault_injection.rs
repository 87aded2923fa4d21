//! A fault-injecting wrapper around a [DatagramSocket], simulating a network that drops and
//!  corrupts datagrams. The knobs can be changed while the socket is in use, and they can be
//!  shared between several sockets to control a whole simulated network at once.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use rand::Rng;
use tracing::trace;
use crate::transport::DatagramSocket;

/// Fault probabilities in percent, each in `0..=100`
#[derive(Debug, Default)]
pub struct NetworkFaults {
    write_drop_percent: AtomicU8,
    read_drop_percent: AtomicU8,
    corruption_percent: AtomicU8,
}

impl NetworkFaults {
    pub fn new() -> Arc<NetworkFaults> {
        Default::default()
    }

    /// probability that a sent datagram is discarded instead of being sent
    pub fn set_write_drop_percent(&self, percent: u8) {
        self.write_drop_percent.store(percent.min(100), Ordering::Release);
    }

    /// probability that a received datagram is discarded before it reaches the caller
    pub fn set_read_drop_percent(&self, percent: u8) {
        self.read_drop_percent.store(percent.min(100), Ordering::Release);
    }

    /// probability that a received datagram has a bit flipped before it reaches the caller
    pub fn set_corruption_percent(&self, percent: u8) {
        self.corruption_percent.store(percent.min(100), Ordering::Release);
    }

    /// convenience for dropping a given percentage of datagrams in both directions
    pub fn set_drop_percent(&self, percent: u8) {
        self.set_write_drop_percent(percent);
        self.set_read_drop_percent(percent);
    }

    fn happens(percent: &AtomicU8) -> bool {
        let percent = percent.load(Ordering::Acquire);
        percent > 0 && rand::thread_rng().gen_range(0..100u8) < percent
    }
}

pub struct FaultInjectingSocket {
    inner: Arc<dyn DatagramSocket>,
    faults: Arc<NetworkFaults>,
}

impl FaultInjectingSocket {
    pub fn new(inner: Arc<dyn DatagramSocket>, faults: Arc<NetworkFaults>) -> FaultInjectingSocket {
        FaultInjectingSocket { inner, faults }
    }

    fn flip_random_bit(datagram: &mut [u8]) {
        if datagram.is_empty() {
            return;
        }
        let bit = rand::thread_rng().gen_range(0..datagram.len() * 8);
        datagram[bit / 8] ^= 1 << (bit % 8);
    }
}

#[async_trait]
impl DatagramSocket for FaultInjectingSocket {
    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        if NetworkFaults::happens(&self.faults.write_drop_percent) {
            trace!("fault injection: dropping datagram to {:?}", to);
            return Ok(());
        }
        self.inner.send_to(to, datagram).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let (num_read, from) = self.inner.recv_from(buf).await?;

            if NetworkFaults::happens(&self.faults.read_drop_percent) {
                trace!("fault injection: dropping datagram from {:?}", from);
                continue;
            }
            if NetworkFaults::happens(&self.faults.corruption_percent) {
                trace!("fault injection: corrupting datagram from {:?}", from);
                Self::flip_random_bit(&mut buf[..num_read]);
            }
            return Ok((num_read, from));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
