use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use lib_happening::core::archiver::Archiver;
use lib_happening::storage::{MemoryBackend, SqliteBackend};
use lib_happening::{open_backend, Hub, LifecycleState, ServiceError, StorageBackend};
use project_tests::{eventually, test_config};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn stop_returns_with_open_connections_on_both_services() {
    let hub = Hub::start(&test_config(), Arc::new(MemoryBackend::new()))
        .await
        .expect("hub starts");

    let mut producers = Vec::new();
    for i in 0..5 {
        let mut producer = TcpStream::connect(hub.events_addr()).await.unwrap();
        producer
            .write_all(format!("p{i}|{i}|hello\r\n").as_bytes())
            .await
            .unwrap();
        producers.push(producer);
    }
    let mut clients = Vec::new();
    for i in 0..3 {
        let mut client = TcpStream::connect(hub.clients_addr()).await.unwrap();
        client.write_all(format!("c{i}\r\n").as_bytes()).await.unwrap();
        clients.push(client);
    }

    let registry = hub.registry();
    let reg = &*registry;
    assert!(eventually(WAIT, move || async move { reg.len().await == 3 }).await);
    let h = &hub;
    assert!(eventually(WAIT, move || async move { h.events().handler().stats().events_ingested == 5 }).await);
    // Accept loop and five handlers.
    assert!(eventually(WAIT, move || async move { h.events().lifecycle().active_tasks() == 6 }).await);
    assert_eq!(hub.archiving().active_tasks(), 1);

    timeout(WAIT, hub.stop()).await.expect("stop within one poll interval");

    assert_eq!(hub.events().lifecycle().state(), LifecycleState::Stopped);
    assert_eq!(hub.clients().lifecycle().state(), LifecycleState::Stopped);
    assert_eq!(hub.events().lifecycle().active_tasks(), 0);
    assert_eq!(hub.clients().lifecycle().active_tasks(), 0);
    assert_eq!(hub.archiving().state(), LifecycleState::Stopped);
    assert!(registry.is_empty().await);
    assert_eq!(hub.archiver().archived(), 5);
}

#[tokio::test]
async fn events_queued_while_ingestion_winds_down_are_archived() {
    let hub = Hub::start(&test_config(), Arc::new(MemoryBackend::new()))
        .await
        .unwrap();

    hub.events().stop().await;
    assert_eq!(hub.archiving().state(), LifecycleState::Running);

    // What a handler that finished its read just as the signal fired would push.
    let late = hub
        .events()
        .handler()
        .push_records(vec![Bytes::from_static(b"late|1|x")]);
    assert_eq!(late, 1);

    timeout(WAIT, hub.stop()).await.expect("stop returns");

    assert_eq!(hub.archiver().archived(), 1);
    assert!(hub.events().handler().queue().lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_and_closes_the_ports() {
    let hub = Hub::start(&test_config(), Arc::new(MemoryBackend::new()))
        .await
        .unwrap();
    let events_addr = hub.events_addr();
    let clients_addr = hub.clients_addr();

    hub.stop().await;
    timeout(WAIT, hub.stop()).await.expect("second stop returns");

    assert!(TcpStream::connect(events_addr).await.is_err());
    assert!(TcpStream::connect(clients_addr).await.is_err());
}

#[tokio::test]
async fn occupied_port_fails_startup() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.clients_port = taken.local_addr().unwrap().port();

    let result = Hub::start(&config, Arc::new(MemoryBackend::new())).await;
    assert!(matches!(result, Err(ServiceError::Bind { .. })));
}

#[tokio::test]
async fn events_are_archived_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_backend(Some(dir.path())).unwrap();
    let hub = Hub::start(&test_config(), storage).await.unwrap();
    let mut events = hub.subscribe();

    let mut producer = TcpStream::connect(hub.events_addr()).await.unwrap();
    producer
        .write_all(b"node1|1000|heartbeat\r\nnode2|1001|boot\r\nnode1|1002|heartbeat\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(timeout(WAIT, events.recv()).await.unwrap().unwrap());
    }

    hub.stop().await;
    assert_eq!(hub.archiver().archived(), 3);
    drop(hub);

    let reopened = SqliteBackend::open(dir.path()).unwrap();
    let keys: Vec<Vec<u8>> = received
        .iter()
        .enumerate()
        .map(|(seq, event)| Archiver::event_key(event, seq as u64).into_bytes())
        .collect();
    let values = reopened.mget(&keys).unwrap();

    for (event, value) in received.iter().zip(values) {
        let json: serde_json::Value = serde_json::from_slice(&value.expect("archived")).unwrap();
        assert_eq!(json["from"], event.from());
        assert_eq!(json["sent_on"], event.sent_on());
        assert_eq!(json["type"], event.event_type());
    }
}
