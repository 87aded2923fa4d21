//! Clients and servers talking over loopback UDP, with faults injected into the network

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use crate::client::Client;
use crate::config::LspParams;
use crate::connection_events::ConnectionEvent;
use crate::error::LspError;
use crate::fault_injection::NetworkFaults;
use crate::test_util::{connect_faulty_client, start_faulty_server, test_params, test_payload};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_hello() {
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(test_params(1), &faults).await.unwrap();
    let client = connect_faulty_client(addr, test_params(1), &faults).await.unwrap();

    client.write(Bytes::from_static(b"hello")).unwrap();
    let (conn_id, payload) = timeout(READ_TIMEOUT, server.read()).await.unwrap().unwrap();
    assert_eq!(conn_id, client.conn_id());
    assert_eq!(payload, Bytes::from_static(b"hello"));

    server.write(conn_id, Bytes::from_static(b"hello back")).await.unwrap();
    assert_eq!(timeout(READ_TIMEOUT, client.read()).await.unwrap().unwrap(), Bytes::from_static(b"hello back"));
}

#[tokio::test]
async fn test_lossy_network_delivers_exactly_once() {
    // long enough idle limit that 50% loss does not kill the connection
    let params = LspParams::new(50, 20, 1);

    for _ in 0..3 {
        let faults = NetworkFaults::new();
        let (server, addr) = start_faulty_server(params.clone(), &faults).await.unwrap();
        let client = connect_faulty_client(addr, params.clone(), &faults).await.unwrap();
        faults.set_write_drop_percent(50);

        client.write(Bytes::from_static(b"hello")).unwrap();
        let (conn_id, payload) = timeout(READ_TIMEOUT, server.read()).await.unwrap().unwrap();
        assert_eq!(conn_id, client.conn_id());
        assert_eq!(payload, Bytes::from_static(b"hello"));

        // retransmissions keep arriving, but are not delivered again
        assert!(timeout(Duration::from_millis(300), server.read()).await.is_err());
    }
}

#[tokio::test]
async fn test_full_corruption_delivers_nothing() {
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(test_params(1), &faults).await.unwrap();
    let client = connect_faulty_client(addr, test_params(1), &faults).await.unwrap();
    faults.set_corruption_percent(100);

    client.write(Bytes::from_static(b"hello")).unwrap();

    // no payload, and no complaint about corrupted data: the connection just starves
    let result = timeout(READ_TIMEOUT, server.read()).await.unwrap();
    assert!(matches!(result, Err(LspError::ConnectionLost(c)) if c == client.conn_id()));
    let result = timeout(READ_TIMEOUT, client.read()).await.unwrap();
    assert!(matches!(result, Err(LspError::ConnectionLost(_))));
}

#[tokio::test]
async fn test_many_clients() {
    const NUM_CLIENTS: usize = 8;

    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(test_params(1), &faults).await.unwrap();
    let mut events = server.connection_events();

    let mut clients = Vec::new();
    for _ in 0..NUM_CLIENTS {
        clients.push(connect_faulty_client(addr, test_params(1), &faults).await.unwrap());
    }
    let conn_ids = clients.iter().map(|c| c.conn_id()).collect::<BTreeSet<_>>();
    assert_eq!(conn_ids.len(), NUM_CLIENTS);

    for (i, client) in clients.iter().enumerate() {
        client.write(test_payload(i, 0)).unwrap();
    }

    let mut expected = clients.iter().enumerate()
        .map(|(i, c)| (c.conn_id(), Bytes::from(test_payload(i, 0))))
        .collect::<BTreeSet<_>>();
    while !expected.is_empty() {
        let received = timeout(READ_TIMEOUT, server.read()).await.unwrap().unwrap();
        assert!(expected.remove(&received), "unexpected or duplicate payload {:?}", received);
    }

    let mut connected = BTreeSet::new();
    for _ in 0..NUM_CLIENTS {
        if let ConnectionEvent::Connected { conn_id, .. } = events.recv().await.unwrap() {
            connected.insert(conn_id);
        }
    }
    assert_eq!(connected, conn_ids);
}

#[tokio::test]
async fn test_ordered_streams_over_lossy_network() {
    const NUM_MESSAGES: usize = 30;

    let params = LspParams::new(50, 20, 4)
        .with_max_backoff_interval(2);
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(params.clone(), &faults).await.unwrap();
    let client = connect_faulty_client(addr, params, &faults).await.unwrap();
    faults.set_write_drop_percent(20);

    for i in 0..NUM_MESSAGES {
        client.write(test_payload(0, i)).unwrap();
    }
    for i in 0..NUM_MESSAGES {
        let (conn_id, payload) = timeout(READ_TIMEOUT, server.read()).await.unwrap().unwrap();
        assert_eq!(payload, Bytes::from(test_payload(0, i)));

        // echo
        server.write(conn_id, payload).await.unwrap();
    }
    for i in 0..NUM_MESSAGES {
        let payload = timeout(READ_TIMEOUT, client.read()).await.unwrap().unwrap();
        assert_eq!(payload, Bytes::from(test_payload(0, i)));
    }
}

#[tokio::test]
async fn test_server_detects_vanished_client() {
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(test_params(1), &faults).await.unwrap();
    let client = connect_faulty_client(addr, test_params(1), &faults).await.unwrap();
    let conn_id = client.conn_id();
    drop(client);

    let result = timeout(READ_TIMEOUT, server.read()).await.unwrap();
    assert!(matches!(result, Err(LspError::ConnectionLost(c)) if c == conn_id));
    assert!(matches!(server.write(conn_id, Bytes::from_static(b"x")).await, Err(LspError::UnknownConnection(c)) if c == conn_id));
}

#[tokio::test]
async fn test_client_detects_vanished_server() {
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(test_params(1), &faults).await.unwrap();
    let client = connect_faulty_client(addr, test_params(1), &faults).await.unwrap();
    drop(server);

    let result = timeout(READ_TIMEOUT, client.read()).await.unwrap();
    assert!(matches!(result, Err(LspError::ConnectionLost(c)) if c == client.conn_id()));
}

#[tokio::test]
async fn test_connect_times_out_without_server() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = silent.local_addr().unwrap();

    let result = timeout(READ_TIMEOUT, Client::connect(addr, LspParams::new(3, 20, 1))).await.unwrap();
    assert!(matches!(result, Err(LspError::ConnectTimeout)));
}

#[tokio::test]
async fn test_client_close_flushes_pending_writes() {
    const NUM_MESSAGES: usize = 10;

    let params = LspParams::new(100, 20, 2);
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(params.clone(), &faults).await.unwrap();
    let client = connect_faulty_client(addr, params, &faults).await.unwrap();
    faults.set_write_drop_percent(30);

    for i in 0..NUM_MESSAGES {
        client.write(test_payload(0, i)).unwrap();
    }
    timeout(READ_TIMEOUT, client.close()).await.unwrap().unwrap();
    assert!(matches!(client.write(Bytes::from_static(b"late")), Err(LspError::ConnectionClosed)));
    assert!(matches!(client.read().await, Err(LspError::ConnectionLost(c)) if c == client.conn_id()));

    // close returned after everything was acknowledged, so the server has it all
    for i in 0..NUM_MESSAGES {
        let (_, payload) = timeout(Duration::from_secs(1), server.read()).await.unwrap().unwrap();
        assert_eq!(payload, Bytes::from(test_payload(0, i)));
    }
}

#[tokio::test]
async fn test_server_close_all_flushes_and_ends_reads() {
    let faults = NetworkFaults::new();
    let (server, addr) = start_faulty_server(test_params(2), &faults).await.unwrap();
    let client_1 = connect_faulty_client(addr, test_params(2), &faults).await.unwrap();
    let client_2 = connect_faulty_client(addr, test_params(2), &faults).await.unwrap();

    server.write(client_1.conn_id(), Bytes::from_static(b"bye 1")).await.unwrap();
    server.write(client_2.conn_id(), Bytes::from_static(b"bye 2")).await.unwrap();
    timeout(READ_TIMEOUT, server.close_all()).await.unwrap().unwrap();

    assert_eq!(timeout(READ_TIMEOUT, client_1.read()).await.unwrap().unwrap(), Bytes::from_static(b"bye 1"));
    assert_eq!(timeout(READ_TIMEOUT, client_2.read()).await.unwrap().unwrap(), Bytes::from_static(b"bye 2"));

    let mut lost = BTreeSet::new();
    for _ in 0..2 {
        match server.read().await {
            Err(LspError::ConnectionLost(conn_id)) => { lost.insert(conn_id); }
            other => panic!("expected a lost connection, got {:?}", other),
        }
    }
    assert_eq!(lost, BTreeSet::from([client_1.conn_id(), client_2.conn_id()]));
    assert!(matches!(server.read().await, Err(LspError::ConnectionClosed)));
    assert!(matches!(server.write(client_1.conn_id(), Bytes::from_static(b"x")).await, Err(LspError::UnknownConnection(_))));
}
