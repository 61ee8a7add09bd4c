//! Integration tests for the built-in transports.
//!
//! - TCP loopback echo with framing
//! - File reading with each end-of-file policy
//! - Scripted reads through `tokio_test::io`

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Sink};
use tokio::net::TcpListener;
use tokio_test::io::{Builder, Mock};

use linkwire::testing::EventRecorder;
use linkwire::{
    add_header, create, ByteOrder, Client, ClientConfig, ClientEvent, ConnectionState, Endpoint, FileClient,
    TcpClient, Transport, TransportKind, DEFAULT_MARKER,
};

const WAIT: Duration = Duration::from_secs(5);

fn frame(payload: &[u8]) -> Vec<u8> {
    add_header(payload, &DEFAULT_MARKER, ByteOrder::LittleEndian).unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("linkwire-it-{}-{}", std::process::id(), name))
}

async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (port, task)
}

/// Test: Framed messages survive a TCP round trip with boundaries intact
#[tokio::test]
async fn integration_tcp_echo() {
    let (port, server) = echo_server().await;
    let descriptor = format!("server=127.0.0.1:{}; interface=127.0.0.1; payloadAware=true; noDelay=true", port);
    let client = TcpClient::tcp(&descriptor).unwrap();
    let mut events = EventRecorder::new(client.events().unwrap());

    client.connect().wait().await.unwrap();
    assert_eq!(client.server_uri(), format!("tcp://127.0.0.1:{}", port));

    let messages: [&[u8]; 3] = [b"alpha", b"", b"gamma delta"];
    for message in messages {
        client.send(message).await.unwrap();
    }

    for message in messages {
        match events.wait_for(WAIT, |e| matches!(e, ClientEvent::PayloadReceived(_))).await {
            Some(ClientEvent::PayloadReceived(bytes)) => assert_eq!(&bytes[..], message),
            other => panic!("expected payload, got {:?}", other),
        }
    }

    let stats = client.statistics();
    assert_eq!(stats.frames_sent, 3);
    assert_eq!(stats.payloads_received, 3);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.await.unwrap();
}

/// Test: Connection refused is retried and reported
#[tokio::test]
async fn integration_tcp_refused() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = create(&format!(
        "protocol=tcp; server=127.0.0.1:{}; maxConnectionAttempts=1",
        port
    ))
    .unwrap();
    assert_eq!(client.kind(), TransportKind::Tcp);
    let mut events = EventRecorder::new(client.events().unwrap());

    assert!(client.connect().wait().await.is_err());
    assert!(events
        .wait_for(WAIT, |e| matches!(e, ClientEvent::ConnectionError(_)))
        .await
        .is_some());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

/// Test: Disconnect at end of file after delivering every frame
#[tokio::test]
async fn integration_file_disconnect_at_end() {
    let path = temp_path("frames");
    let mut content = frame(b"one");
    content.extend(frame(b"two"));
    tokio::fs::write(&path, &content).await.unwrap();

    let client = FileClient::file(&format!(
        "file={}; payloadAware=true; disconnectAtEnd=true",
        path.display()
    ))
    .unwrap();
    let mut events = EventRecorder::new(client.events().unwrap());

    client.connect().wait().await.unwrap();
    assert!(events
        .wait_for(WAIT, |e| matches!(e, ClientEvent::ConnectionTerminated))
        .await
        .is_some());

    let payloads: Vec<Vec<u8>> = events
        .events()
        .iter()
        .filter_map(|e| match e {
            ClientEvent::PayloadReceived(bytes) => Some(bytes.to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(events.count(|e| matches!(e, ClientEvent::EndOfStream)), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let _ = tokio::fs::remove_file(&path).await;
}

/// Test: Auto-repeat rereads the file from the starting offset
#[tokio::test]
async fn integration_file_auto_repeat() {
    let path = temp_path("repeat");
    tokio::fs::write(&path, b"skipdata").await.unwrap();

    let client = FileClient::file(&format!("file={}; autoRepeat=true; startingOffset=4", path.display())).unwrap();
    let mut events = EventRecorder::new(client.events().unwrap());

    client.connect().wait().await.unwrap();
    for _ in 0..2 {
        match events.wait_for(WAIT, |e| matches!(e, ClientEvent::PayloadReceived(_))).await {
            Some(ClientEvent::PayloadReceived(bytes)) => assert_eq!(&bytes[..], b"data"),
            other => panic!("expected payload, got {:?}", other),
        }
        assert!(events
            .wait_for(WAIT, |e| matches!(e, ClientEvent::EndOfStream))
            .await
            .is_some());
    }

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    let _ = tokio::fs::remove_file(&path).await;
}

/// Test: Sends append to the file
#[tokio::test]
async fn integration_file_send_appends() {
    let path = temp_path("append");
    let _ = tokio::fs::remove_file(&path).await;

    let client = create(&format!("protocol=file; file={}; receiveInterval=50", path.display())).unwrap();
    client.connect().wait().await.unwrap();
    client.send(b"written").await.unwrap();
    client.disconnect().await;

    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"written");
    let _ = tokio::fs::remove_file(&path).await;
}

/// Transport that replays a scripted byte stream.
struct ScriptedTransport {
    script: Mutex<Option<Mock>>,
}

impl ScriptedTransport {
    fn new(mock: Mock) -> Self {
        Self {
            script: Mutex::new(Some(mock)),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Reader = Mock;
    type Writer = Sink;

    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    async fn connect(&self, _endpoint: &Endpoint, _interface: Option<&str>) -> io::Result<(Mock, Sink)> {
        let mock = self.script.lock().take();
        mock.map(|m| (m, tokio::io::sink()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "script already used"))
    }
}

/// Test: Header and payload arriving in awkward pieces
#[tokio::test]
async fn integration_scripted_partial_reads() {
    let first = frame(b"fragmented payload");
    let second = frame(b"next");
    let mock = Builder::new()
        .read(&first[..3])
        .read(&first[3..8])
        .read(&first[8..12])
        .read(&first[12..])
        .read(&second)
        .build();

    let config = ClientConfig::default().with_payload_aware(true);
    let client = Client::with_config(ScriptedTransport::new(mock), "server=script:1", config).unwrap();
    let mut events = EventRecorder::new(client.events().unwrap());

    client.connect().wait().await.unwrap();
    assert!(events
        .wait_for(WAIT, |e| matches!(e, ClientEvent::ConnectionTerminated))
        .await
        .is_some());

    let payloads: Vec<Vec<u8>> = events
        .events()
        .iter()
        .filter_map(|e| match e {
            ClientEvent::PayloadReceived(bytes) => Some(bytes.to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![b"fragmented payload".to_vec(), b"next".to_vec()]);
    assert_eq!(client.statistics().bytes_received, (first.len() + second.len()) as u64);
}
