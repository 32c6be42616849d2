use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::spawn_blocking;
use tokio::time::{sleep, timeout};

use framelink::{
    encode_frame, AppError, AppResult, ClientSession, ConnectionId, Server, ServerConfig,
    ServerEvent,
};

struct TestServer {
    server: Arc<Server>,
    handle: framelink::ServerHandle,
    events: UnboundedReceiver<ServerEvent>,
    run_task: tokio::task::JoinHandle<AppResult<()>>,
}

async fn start_server(idle_notify_secs: u64) -> TestServer {
    let (tx, events) = unbounded_channel();
    let handler = Arc::new(move |event: ServerEvent| {
        let _ = tx.send(event);
    });
    let config = ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        terminate_on_keypress: false,
        idle_notify_secs,
    };
    let server = Arc::new(Server::bind(config, handler).unwrap());
    let handle = server.handle();
    let run_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    // let the listen loop take ownership of the lifecycle
    sleep(Duration::from_millis(20)).await;
    TestServer {
        server,
        handle,
        events,
        run_task,
    }
}

async fn next_event(events: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("event channel closed")
}

async fn expect_connection_added(events: &mut UnboundedReceiver<ServerEvent>) -> ConnectionId {
    match next_event(events).await {
        ServerEvent::ConnectionAdded { conn, .. } => conn,
        other => panic!("expected ConnectionAdded, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_hello_ack() {
    let mut ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    let session = Arc::new(
        spawn_blocking(move || ClientSession::connect(addr, None).unwrap())
            .await
            .unwrap(),
    );
    let conn = expect_connection_added(&mut ts.events).await;
    assert!(ts.handle.is_connected(conn));
    assert_eq!(ts.handle.connection_count(), 1);

    let sender = session.clone();
    spawn_blocking(move || sender.send(b"hello", false).unwrap())
        .await
        .unwrap();
    match next_event(&mut ts.events).await {
        ServerEvent::MessageReceived { conn: c, payload } => {
            assert_eq!(c, conn);
            assert_eq!(payload, Bytes::from_static(b"hello"));
        }
        other => panic!("expected MessageReceived, got {:?}", other),
    }

    ts.handle.send_to(conn, b"ack", false).await.unwrap();
    let receiver = session.clone();
    let size = spawn_blocking(move || receiver.receive().unwrap())
        .await
        .unwrap();
    assert_eq!(size, 3);
    assert_eq!(session.take_message().unwrap(), Bytes::from_static(b"ack"));
    assert_eq!(session.received_count(), 1);

    // client disconnect is observed as a drop and the registry forgets it
    let closer = session.clone();
    spawn_blocking(move || closer.shutdown()).await.unwrap();
    match next_event(&mut ts.events).await {
        ServerEvent::ConnectionDropped { conn: c } => assert_eq!(c, conn),
        other => panic!("expected ConnectionDropped, got {:?}", other),
    }
    assert!(!ts.handle.is_connected(conn));
    assert_eq!(ts.handle.connection_count(), 0);

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_request_tears_down_by_next_cycle() {
    let mut ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    let session = Arc::new(
        spawn_blocking(move || ClientSession::connect(addr, None).unwrap())
            .await
            .unwrap(),
    );
    let conn = expect_connection_added(&mut ts.events).await;

    ts.handle.request_close(conn).unwrap();
    match next_event(&mut ts.events).await {
        ServerEvent::ConnectionDropped { conn: c } => assert_eq!(c, conn),
        other => panic!("expected ConnectionDropped, got {:?}", other),
    }
    assert!(!ts.handle.is_connected(conn));
    assert_eq!(ts.handle.connection_count(), 0);

    // nothing written after the close request can surface as a message
    let late_sender = session.clone();
    let _ = spawn_blocking(move || late_sender.send(b"late", false)).await;
    sleep(Duration::from_millis(300)).await;
    assert!(ts.events.try_recv().is_err());

    assert!(matches!(
        ts.handle.request_close(conn),
        Err(AppError::ConnectionNotFound(_))
    ));
    assert!(matches!(
        ts.handle.send_to(conn, b"x", false).await,
        Err(AppError::ConnectionNotFound(_))
    ));

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_send_and_receive_do_not_interleave() {
    let mut ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    let session = Arc::new(
        spawn_blocking(move || ClientSession::connect(addr, None).unwrap())
            .await
            .unwrap(),
    );
    let _conn = expect_connection_added(&mut ts.events).await;

    const COUNT: usize = 20;
    let sent: Vec<Vec<u8>> = (0..COUNT)
        .map(|i| format!("payload-{:02}-{}", i, "x".repeat((i * 37) % 300)).into_bytes())
        .collect();

    let sender = {
        let session = session.clone();
        let messages = sent.clone();
        spawn_blocking(move || {
            for msg in &messages {
                session.send(msg, false).unwrap();
            }
        })
    };
    let receiver = {
        let session = session.clone();
        spawn_blocking(move || {
            (0..COUNT)
                .map(|_| {
                    session.receive().unwrap();
                    session.take_message().unwrap()
                })
                .collect::<Vec<Bytes>>()
        })
    };

    // echo every message back while both client threads run
    let mut echoed = 0;
    while echoed < COUNT {
        if let ServerEvent::MessageReceived { conn, payload } = next_event(&mut ts.events).await {
            ts.handle.send_to(conn, &payload, false).await.unwrap();
            echoed += 1;
        }
    }

    sender.await.unwrap();
    let received = receiver.await.unwrap();
    assert_eq!(received.len(), COUNT);
    for (got, expected) in received.iter().zip(&sent) {
        assert_eq!(&got[..], &expected[..]);
    }

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn body_split_across_many_writes_yields_one_message() {
    let mut ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    let conn = expect_connection_added(&mut ts.events).await;

    let frame = encode_frame(b"trickled-payload").unwrap();
    raw.write_all(&frame[..4]).await.unwrap();
    raw.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    raw.write_all(&frame[4..5]).await.unwrap();
    raw.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    raw.write_all(&frame[5..6]).await.unwrap();
    raw.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    raw.write_all(&frame[6..]).await.unwrap();
    raw.flush().await.unwrap();

    match next_event(&mut ts.events).await {
        ServerEvent::MessageReceived { conn: c, payload } => {
            assert_eq!(c, conn);
            assert_eq!(payload, Bytes::from_static(b"trickled-payload"));
        }
        other => panic!("expected MessageReceived, got {:?}", other),
    }

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_mark_drops_connection_without_message() {
    let mut ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    let conn = expect_connection_added(&mut ts.events).await;

    raw.write_all(&[0x12, 0x34, 0x00, 0x01, 0x99]).await.unwrap();
    raw.flush().await.unwrap();

    match next_event(&mut ts.events).await {
        ServerEvent::ConnectionDropped { conn: c } => assert_eq!(c, conn),
        other => panic!("expected ConnectionDropped, got {:?}", other),
    }
    assert_eq!(ts.handle.connection_count(), 0);

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_notify_fires_without_activity() {
    let mut ts = start_server(1).await;

    match next_event(&mut ts.events).await {
        ServerEvent::IdleNotify => {}
        other => panic!("expected IdleNotify, got {:?}", other),
    }

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listen_lifecycle_is_single_use() {
    let ts = start_server(0).await;

    // a second concurrent run is rejected
    assert!(matches!(
        ts.server.run().await,
        Err(AppError::IllegalState(_))
    ));

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();

    // terminal: no re-listen, no admin operations
    assert!(matches!(
        ts.server.run().await,
        Err(AppError::IllegalState(_))
    ));
    assert!(matches!(
        ts.handle.request_close(ConnectionId(1)),
        Err(AppError::IllegalState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admin_operations_require_running_server() {
    let (tx, _events) = unbounded_channel();
    let handler = Arc::new(move |event: ServerEvent| {
        let _ = tx.send(event);
    });
    let config = ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        terminate_on_keypress: false,
        idle_notify_secs: 0,
    };
    let server = Server::bind(config, handler).unwrap();
    let handle = server.handle();

    assert!(matches!(
        handle.send_to(ConnectionId(1), b"x", false).await,
        Err(AppError::IllegalState(_))
    ));
    assert!(matches!(
        handle.request_close(ConnectionId(1)),
        Err(AppError::IllegalState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_closes_the_listening_socket() {
    let ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();

    // the server value is still alive, but the listener is gone: new peers
    // must be refused rather than parked in the backlog
    assert_eq!(ts.server.local_addr(), addr);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_tears_down_remaining_connections() {
    let mut ts = start_server(0).await;
    let addr = ts.handle.local_addr();

    let session = Arc::new(
        spawn_blocking(move || ClientSession::connect(addr, None).unwrap())
            .await
            .unwrap(),
    );
    let conn = expect_connection_added(&mut ts.events).await;

    ts.handle.shutdown();
    ts.run_task.await.unwrap().unwrap();
    assert_eq!(ts.handle.connection_count(), 0);

    match next_event(&mut ts.events).await {
        ServerEvent::ConnectionDropped { conn: c } => assert_eq!(c, conn),
        other => panic!("expected ConnectionDropped, got {:?}", other),
    }

    // the peer observes the close at a frame boundary
    let receiver = session.clone();
    let res = spawn_blocking(move || receiver.receive()).await.unwrap();
    assert!(matches!(res, Err(AppError::SocketClosed)));
}
