use std::sync::Arc;
use std::time::Duration;

use lib_happening::core::listener::NetworkService;
use lib_happening::core::registry::ClientStore;
use project_tests::eventually;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

async fn clients_service(registration_timeout: Duration) -> NetworkService<ClientStore> {
    NetworkService::start(
        "Clients",
        "127.0.0.1:0",
        Duration::from_millis(50),
        Arc::new(ClientStore::new("Clients", registration_timeout)),
    )
    .await
    .expect("bind loopback")
}

async fn register(service: &NetworkService<ClientStore>, id: &str) -> TcpStream {
    let mut client = TcpStream::connect(service.local_addr()).await.unwrap();
    client.write_all(format!("{id}\r\n").as_bytes()).await.unwrap();
    client
}

/// `true` when the server closed its side: the next read hits end-of-stream.
async fn closed_by_server(client: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    matches!(timeout(WAIT, client.read(&mut buf)).await, Ok(Ok(0)) | Ok(Err(_)))
}

#[tokio::test]
async fn registered_client_can_be_pushed_to() {
    let service = clients_service(Duration::from_secs(5)).await;
    let registry = service.handler().registry();
    let reg = &*registry;

    let mut client = register(&service, "X").await;
    assert!(eventually(WAIT, move || async move { reg.lookup("X").await.is_some() }).await);

    let handle = registry.lookup("X").await.unwrap();
    assert_eq!(handle.peer(), client.local_addr().unwrap());
    handle.push(b"hello\r\n").await.unwrap();

    let mut buf = [0u8; 7];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello\r\n");

    service.stop().await;
}

#[tokio::test]
async fn second_registration_replaces_and_closes_the_first() {
    let service = clients_service(Duration::from_secs(5)).await;
    let registry = service.handler().registry();
    let reg = &*registry;

    let mut first = register(&service, "X").await;
    assert!(eventually(WAIT, move || async move { reg.lookup("X").await.is_some() }).await);

    let second = register(&service, "X").await;
    let second_addr = second.local_addr().unwrap();
    assert!(
        eventually(WAIT, move || async move {
            reg.lookup("X").await.map(|h| h.peer()) == Some(second_addr)
        })
        .await
    );

    assert!(closed_by_server(&mut first).await);
    assert_eq!(registry.len().await, 1);

    service.stop().await;
}

#[tokio::test]
async fn disconnect_evicts_the_client() {
    let service = clients_service(Duration::from_secs(5)).await;
    let registry = service.handler().registry();
    let reg = &*registry;

    let client = register(&service, "gone").await;
    assert!(eventually(WAIT, move || async move { reg.lookup("gone").await.is_some() }).await);

    drop(client);
    assert!(eventually(WAIT, move || async move { reg.is_empty().await }).await);

    service.stop().await;
}

#[tokio::test]
async fn superseded_disconnect_keeps_the_new_registration() {
    let service = clients_service(Duration::from_secs(5)).await;
    let registry = service.handler().registry();
    let reg = &*registry;

    let first = register(&service, "X").await;
    assert!(eventually(WAIT, move || async move { reg.lookup("X").await.is_some() }).await);
    let second = register(&service, "X").await;
    let second_addr = second.local_addr().unwrap();
    assert!(
        eventually(WAIT, move || async move {
            reg.lookup("X").await.map(|h| h.peer()) == Some(second_addr)
        })
        .await
    );

    drop(first);
    sleep(Duration::from_millis(100)).await;

    let current = registry.lookup("X").await.expect("still registered");
    assert_eq!(current.peer(), second_addr);

    drop(second);
    service.stop().await;
}

#[tokio::test]
async fn empty_id_is_refused() {
    let service = clients_service(Duration::from_secs(5)).await;
    let mut client = register(&service, "   ").await;

    assert!(closed_by_server(&mut client).await);
    assert!(service.handler().registry().is_empty().await);

    service.stop().await;
}

#[tokio::test]
async fn silent_client_is_dropped_after_the_registration_timeout() {
    let service = clients_service(Duration::from_millis(100)).await;
    let mut client = TcpStream::connect(service.local_addr()).await.unwrap();

    assert!(closed_by_server(&mut client).await);
    assert!(service.handler().registry().is_empty().await);

    service.stop().await;
}

#[tokio::test]
async fn stop_closes_registered_clients() {
    let service = clients_service(Duration::from_secs(5)).await;
    let registry = service.handler().registry();
    let reg = &*registry;

    let mut client = register(&service, "X").await;
    assert!(eventually(WAIT, move || async move { reg.lookup("X").await.is_some() }).await);

    timeout(WAIT, service.stop()).await.expect("stop in time");

    assert!(registry.is_empty().await);
    assert!(closed_by_server(&mut client).await);
}

#[tokio::test]
async fn stop_is_not_blocked_by_a_push_to_a_stalled_client() {
    let service = clients_service(Duration::from_secs(5)).await;
    let registry = service.handler().registry();
    let reg = &*registry;

    // Registers and then never reads.
    let _silent = register(&service, "X").await;
    assert!(eventually(WAIT, move || async move { reg.lookup("X").await.is_some() }).await);

    let handle = registry.lookup("X").await.unwrap();
    let push = tokio::spawn(async move { handle.push(&vec![b'x'; 32 * 1024 * 1024]).await });
    sleep(Duration::from_millis(100)).await;
    assert!(!push.is_finished());

    timeout(WAIT, service.stop()).await.expect("stop in time");

    let result = timeout(WAIT, push).await.expect("push aborted").unwrap();
    assert!(result.is_err());
    assert!(registry.is_empty().await);
}
