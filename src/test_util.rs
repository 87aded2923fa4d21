use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use crate::client::Client;
use crate::config::LspParams;
use crate::error::LspResult;
use crate::fault_injection::{FaultInjectingSocket, NetworkFaults};
use crate::server::Server;
use crate::transport::DatagramSocket;

/// short epochs for tests: 5 epochs of 50ms before a connection is lost
pub fn test_params(window_size: usize) -> LspParams {
    LspParams::new(5, 50, window_size)
}

/// a UDP socket on a free loopback port, wrapped for fault injection
pub async fn faulty_loopback_socket(faults: &Arc<NetworkFaults>) -> LspResult<Arc<dyn DatagramSocket>> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    Ok(Arc::new(FaultInjectingSocket::new(Arc::new(socket), faults.clone())))
}

/// starts a server on a loopback port, returning it together with the address clients should
///  connect to
pub async fn start_faulty_server(params: LspParams, faults: &Arc<NetworkFaults>) -> LspResult<(Server, SocketAddr)> {
    let server = Server::start_with_socket(faulty_loopback_socket(faults).await?, params)?;
    let addr = server.local_addr();
    Ok((server, addr))
}

pub async fn connect_faulty_client(server_addr: SocketAddr, params: LspParams, faults: &Arc<NetworkFaults>) -> LspResult<Client> {
    Client::connect_with_socket(faulty_loopback_socket(faults).await?, server_addr, params).await
}

/// distinct, recognizable payloads
pub fn test_payload(client: usize, message: usize) -> Vec<u8> {
    format!("client {} message {}", client, message).into_bytes()
}
