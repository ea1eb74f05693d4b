use std::sync::Arc;
use std::time::Duration;

use lib_happening::core::ingestion::{EventsHandler, IngestionSettings};
use lib_happening::core::listener::NetworkService;
use project_tests::eventually;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

async fn events_service() -> NetworkService<EventsHandler> {
    NetworkService::start(
        "Events",
        "127.0.0.1:0",
        Duration::from_millis(50),
        Arc::new(EventsHandler::new("Events", IngestionSettings::default())),
    )
    .await
    .expect("bind loopback")
}

fn queued(service: &NetworkService<EventsHandler>) -> usize {
    service.handler().queue().lock().unwrap().len()
}

#[tokio::test]
async fn record_split_across_two_writes_is_reassembled() {
    let service = events_service().await;
    let svc = &service;
    let mut producer = TcpStream::connect(service.local_addr()).await.unwrap();

    producer.write_all(b"node1|1000|hear").await.unwrap();
    producer.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(queued(&service), 0);

    producer.write_all(b"tbeat\r\n").await.unwrap();
    assert!(eventually(WAIT, move || async move { queued(svc) == 1 }).await);

    let event = service.handler().queue().lock().unwrap().pop().unwrap();
    assert_eq!(event.from(), "node1");
    assert_eq!(event.sent_on(), 1000);
    assert_eq!(event.event_type(), "heartbeat");
    assert_eq!(event.raw(), "node1|1000|heartbeat\r\n");

    service.stop().await;
}

#[tokio::test]
async fn malformed_record_is_skipped_and_connection_survives() {
    let service = events_service().await;
    let svc = &service;
    let mut producer = TcpStream::connect(service.local_addr()).await.unwrap();

    producer
        .write_all(b"node1|heartbeat\r\nnode2|2000|boot\r\n")
        .await
        .unwrap();
    assert!(eventually(WAIT, move || async move { svc.handler().stats().records_rejected == 1 }).await);
    assert!(eventually(WAIT, move || async move { queued(svc) == 1 }).await);

    producer.write_all(b"node3|3000|alive\r\n").await.unwrap();
    assert!(eventually(WAIT, move || async move { queued(svc) == 2 }).await);

    let drained = service.handler().queue().lock().unwrap().drain_all();
    let senders: Vec<&str> = drained.iter().map(|e| e.from()).collect();
    assert_eq!(senders, vec!["node2", "node3"]);

    service.stop().await;
}

#[tokio::test]
async fn subscribers_receive_events_in_arrival_order() {
    let service = events_service().await;
    let mut events = service.handler().subscribe();
    let mut producer = TcpStream::connect(service.local_addr()).await.unwrap();

    producer
        .write_all(b"a|1|first\r\na|2|second\r\na|3|third\r\n")
        .await
        .unwrap();

    for expected in ["first", "second", "third"] {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type(), expected);
    }

    service.stop().await;
}

#[tokio::test]
async fn concurrent_producers_keep_their_own_order() {
    let service = events_service().await;
    let svc = &service;
    let addr = service.local_addr();

    let mut writers = Vec::new();
    for producer in 0..4 {
        writers.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for seq in 0..25 {
                let line = format!("p{producer}|{seq}|tick\r\n");
                stream.write_all(line.as_bytes()).await.unwrap();
            }
            stream.flush().await.unwrap();
            stream
        }));
    }
    let mut streams = Vec::new();
    for writer in writers {
        streams.push(writer.await.unwrap());
    }

    assert!(eventually(WAIT, move || async move { queued(svc) == 100 }).await);

    let drained = service.handler().queue().lock().unwrap().drain_all();
    for producer in 0..4 {
        let from = format!("p{producer}");
        let seqs: Vec<i64> = drained
            .iter()
            .filter(|e| e.from() == from)
            .map(|e| e.sent_on())
            .collect();
        assert_eq!(seqs, (0..25).collect::<Vec<i64>>());
    }

    service.stop().await;
}

#[tokio::test]
async fn partial_record_at_end_of_stream_is_discarded() {
    let service = events_service().await;
    let svc = &service;
    let mut producer = TcpStream::connect(service.local_addr()).await.unwrap();

    producer.write_all(b"a|1|x\r\nb|2").await.unwrap();
    producer.shutdown().await.unwrap();
    drop(producer);

    assert!(eventually(WAIT, move || async move { queued(svc) == 1 }).await);
    // The accept loop is the only task left once the handler saw EOF.
    assert!(eventually(WAIT, move || async move { svc.lifecycle().active_tasks() == 1 }).await);
    assert_eq!(queued(&service), 1);
    assert_eq!(service.handler().stats().events_ingested, 1);

    service.stop().await;
}
