// End-to-end pipeline tests: real UDP socket, real WebSocket backend

use chrono::NaiveDate;
use futures_util::{SinkExt, StreamExt};
use neurasense_relay::{
    attach_render_sink, ConnectionState, EventKind, EventRouter, PatientRecord, PipelineEvent,
    RelayClient, RelayClientConfig, RenderSubscription, SessionConfig, SessionCoordinator,
    SessionStore, SqliteSessionStore, UdpSampleSource, WaveformBuffer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Backend stand-in: records every frame and answers each with a metrics object
async fn spawn_backend() -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if let Ok(frame) = serde_json::from_str::<serde_json::Value>(text.as_str()) {
                    let _ = frames_tx.send(frame);
                }
                let reply = r#"{"DAR": 2.1, "DBR": 0.9, "stroke": 1, "ratio_flag": "High"}"#;
                if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    });

    (format!("ws://{}/ws", addr), frames_rx)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Pipeline {
    coordinator: SessionCoordinator,
    router: EventRouter,
    waveform: Arc<WaveformBuffer>,
    store: Arc<SqliteSessionStore>,
    _display: RenderSubscription,
}

fn pipeline(backend_url: String) -> Pipeline {
    let router = EventRouter::new();
    let waveform = Arc::new(WaveformBuffer::default());
    let display = attach_render_sink(&router, waveform.clone());

    let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
    store
        .add_patient(&PatientRecord::new(
            "1001",
            "Jane Doe",
            NaiveDate::from_ymd_opt(1980, 4, 12).unwrap(),
        ))
        .unwrap();

    let coordinator = SessionCoordinator::new(
        SessionConfig {
            udp_host: "127.0.0.1".to_string(),
            udp_port: 0,
            backend_url,
            allow_offline: false,
        },
        router.clone(),
        Box::new(UdpSampleSource::new(router.clone(), 65536, None)),
        Arc::new(RelayClient::new(router.clone(), RelayClientConfig::default())),
        store.clone(),
    );

    Pipeline {
        coordinator,
        router,
        waveform,
        store,
        _display: display,
    }
}

#[tokio::test]
async fn test_datagram_reaches_backend_and_display() {
    let (url, mut frames) = spawn_backend().await;
    let mut p = pipeline(url);

    p.coordinator.set_simulation(true);
    p.coordinator.start("1001").await.unwrap();
    assert_eq!(p.coordinator.relay_state(), ConnectionState::Connected);

    let target = p.coordinator.source_addr().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender
        .send_to(br#"{"data":[[1,2],[3,4]]}"#, target)
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(3), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["isPhantom"], serde_json::json!(true));
    assert_eq!(
        frame["packet"]["data"],
        serde_json::json!([[1.0, 2.0], [3.0, 4.0]])
    );

    let waveform = Arc::clone(&p.waveform);
    wait_until(|| waveform.latest_result().is_some()).await;

    assert_eq!(p.waveform.channel(0), vec![1.0, 2.0]);
    assert_eq!(p.waveform.channel(1), vec![3.0, 4.0]);
    let result = p.waveform.latest_result().unwrap();
    assert_eq!(result.number("DAR"), Some(2.1));
    assert_eq!(result.label("ratio_flag"), Some("High"));
    assert_eq!(result.stroke_risk(), Some(true));
    assert_eq!(p.waveform.relay_state(), ConnectionState::Connected);

    let summary = p.coordinator.end().await.unwrap();
    assert!(summary.is_clean(), "{:?}", summary.failures);
    assert_eq!(p.waveform.relay_state(), ConnectionState::Disconnected);

    let stored = p.store.sessions_for_patient("1001").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, summary.record.id);

    let stats = p.coordinator.stats();
    assert_eq!(stats.source.batches_received, 1);
    assert_eq!(stats.relay.frames_sent, 1);
}

#[tokio::test]
async fn test_malformed_datagram_does_not_stop_ingest() {
    let (url, mut frames) = spawn_backend().await;
    let mut p = pipeline(url);

    let (malformed_tx, mut malformed_rx) = mpsc::unbounded_channel();
    p.router.on(EventKind::MalformedSample, move |event| {
        if let PipelineEvent::MalformedSample(failure) = event {
            let _ = malformed_tx.send(failure.bytes);
        }
        Ok(())
    });

    p.coordinator.start("1001").await.unwrap();
    let target = p.coordinator.source_addr().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sender.send_to(b"not json at all", target).await.unwrap();
    sender.send_to(br#"{"data":[[5]]}"#, target).await.unwrap();

    let bytes = tokio::time::timeout(Duration::from_secs(3), malformed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes, 15);

    let frame = tokio::time::timeout(Duration::from_secs(3), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["packet"]["data"], serde_json::json!([[5.0]]));
    assert_eq!(frame["isPhantom"], serde_json::json!(false));

    p.coordinator.end().await.unwrap();
    assert_eq!(p.coordinator.stats().source.malformed_datagrams, 1);
}

#[tokio::test]
async fn test_unreachable_backend_releases_udp_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    // Reserve a concrete port so the retry below must rebind the same one
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let router = EventRouter::new();
    let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
    let mut coordinator = SessionCoordinator::new(
        SessionConfig {
            udp_host: "127.0.0.1".to_string(),
            udp_port: port,
            backend_url: dead_url,
            allow_offline: false,
        },
        router.clone(),
        Box::new(UdpSampleSource::new(router.clone(), 65536, None)),
        Arc::new(RelayClient::new(router.clone(), RelayClientConfig::default())),
        store,
    );

    assert!(coordinator.start("1001").await.is_err());
    assert!(!coordinator.is_active());

    // The failed start released the port
    UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
}
