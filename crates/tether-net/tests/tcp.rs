//! End-to-end over a loopback TCP server speaking the wire protocol.

use std::time::Duration;

use tether_net::{
    AuthCredential, Client, ClientConfig, ConnectionStatus, ControlSignal, Decoded, FrameConfig,
    InboundFrame, Notification, Payload, RequestError, ServerEvent, SocketConfig, TcpConnector,
    decode, encode_frame, read_frame, write_frame,
};
use tokio::net::{TcpListener, TcpStream};

async fn read_decoded(stream: &mut TcpStream) -> Decoded {
    let bytes = read_frame(stream, &FrameConfig::default()).await.unwrap();
    decode(&bytes).unwrap()
}

async fn write_inbound(stream: &mut TcpStream, frame: InboundFrame) {
    let bytes = encode_frame(&frame).unwrap();
    write_frame(stream, &bytes, &FrameConfig::default())
        .await
        .unwrap();
}

async fn write_signal(stream: &mut TcpStream, signal: ControlSignal) {
    write_frame(stream, &signal.to_bytes(), &FrameConfig::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_request_response_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let Decoded::Frame(auth) = read_decoded(&mut stream).await else {
            panic!("expected auth envelope");
        };
        assert_eq!(auth.event.as_deref(), Some("auth"));
        assert_eq!(auth.payload.as_bytes(), b"secret");
        write_signal(&mut stream, ControlSignal::AuthAccepted).await;

        let Decoded::Frame(request) = read_decoded(&mut stream).await else {
            panic!("expected request");
        };
        assert_eq!(request.event.as_deref(), Some("echo"));

        write_inbound(
            &mut stream,
            InboundFrame {
                correlation_id: None,
                event: Some("welcome".into()),
                payload: Payload::empty(),
            },
        )
        .await;
        write_inbound(
            &mut stream,
            InboundFrame {
                correlation_id: request.correlation_id,
                event: Some("echo".into()),
                payload: request.payload,
            },
        )
        .await;

        // The client's clean disconnect arrives as an in-band close notice.
        read_decoded(&mut stream).await
    });

    let mut config = ClientConfig::new(format!("tcp://{addr}"));
    config.auth = Some(AuthCredential {
        event: "auth".into(),
        data: Payload::from_bytes(b"secret".to_vec()),
    });
    let client = Client::spawn(config, TcpConnector::default());
    let mut notes = client.subscribe();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.send("echo", Payload::from_bytes(b"ping".to_vec())),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.as_bytes(), b"ping");
    assert_eq!(client.status(), ConnectionStatus::Open);

    let mut saw_welcome = false;
    while let Ok(note) = notes.try_recv() {
        if note
            == Notification::EventReceived(ServerEvent {
                event: "welcome".into(),
                payload: Payload::empty(),
            })
        {
            saw_welcome = true;
        }
    }
    assert!(saw_welcome);

    client.disconnect();
    let close = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(close, Decoded::Control(ControlSignal::Close(1000)));
    assert_eq!(client.status(), ConnectionStatus::UserClosed);
}

#[tokio::test]
async fn test_server_hangup_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = ClientConfig::new(addr.to_string());
    config.backoff.delays = vec![Duration::from_millis(20)];
    let client = Client::spawn(config, TcpConnector::default());
    let mut status = client.watch_status();

    let (first, _) = listener.accept().await.unwrap();
    status
        .wait_for(|s| *s == ConnectionStatus::Open)
        .await
        .unwrap();
    drop(first);
    status
        .wait_for(|s| *s != ConnectionStatus::Open)
        .await
        .unwrap();

    let (_second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Open),
    )
    .await
    .unwrap()
    .unwrap();

    client.terminate();
    client.stopped().await;
    assert_eq!(client.status(), ConnectionStatus::Terminated);
}

#[tokio::test]
async fn test_oversized_request_rejected_before_write() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // A server that accepts and never answers.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let connector = TcpConnector::new(FrameConfig { max_frame_size: 64 }, SocketConfig::default());
    let client = Client::spawn(ClientConfig::new(addr.to_string()), connector);

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        client.send("echo", Payload::from_bytes(vec![1; 1024])),
    )
    .await
    .unwrap();
    assert!(matches!(
        outcome,
        Err(RequestError::FrameTooLarge { max: 64, .. })
    ));
    assert_eq!(client.status(), ConnectionStatus::Open);

    client.terminate();
    client.stopped().await;
    server.abort();
}
