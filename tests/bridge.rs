use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use wheelbridge::device::loopback::{LoopbackController, LoopbackProbe, LoopbackState};
use wheelbridge::device::{AxisSlot, ButtonId, DeviceHandle, DeviceProfile};
use wheelbridge::mapping::{AxisConfig, KeyboardConfig, MappingConfig};
use wheelbridge::server::{BridgeServer, ServerError, ServerOptions};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JOYSTICK_CENTER: i32 = 16385;

struct Bridge {
    addr: SocketAddr,
    probe: LoopbackProbe,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn start(
    profile: DeviceProfile,
    mapping: Arc<dyn MappingConfig>,
    options: ServerOptions,
) -> Bridge {
    let controller = LoopbackController::new("bridge test", profile.capabilities(None));
    let probe = controller.probe();
    let device = DeviceHandle::acquire(Box::new(controller), 1).unwrap();

    let server = BridgeServer::bind("127.0.0.1", 0, device, mapping, options)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    let task = tokio::spawn(server.run());

    Bridge {
        addr,
        probe,
        shutdown,
        task,
    }
}

async fn start_axis(options: ServerOptions) -> Bridge {
    let mapping = AxisConfig::for_profile(DeviceProfile::Joystick)
        .with_min_update_interval(Duration::ZERO);
    start(DeviceProfile::Joystick, Arc::new(mapping), options).await
}

async fn start_keys(options: ServerOptions) -> Bridge {
    let mapping = KeyboardConfig::default_config();
    start(DeviceProfile::Keyboard, Arc::new(mapping), options).await
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    client
}

/// Next text frame from the server, skipping control frames
async fn next_text(client: &mut Client) -> serde_json::Value {
    let read = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for text: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("no text frame within 2s")
}

async fn send_sample(client: &mut Client, sample: &str) -> serde_json::Value {
    client.send(Message::Text(sample.to_string())).await.unwrap();
    next_text(client).await
}

/// True once the server closed the connection
async fn closed_within(client: &mut Client, limit: Duration) -> bool {
    let ended = tokio::time::timeout(limit, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    });
    ended.await.is_ok()
}

async fn next_pong(client: &mut Client) -> Vec<u8> {
    let read = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Pong(payload))) => return payload,
                Some(Ok(_)) => continue,
                other => panic!("connection ended before pong: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("no pong within 2s")
}

async fn wait_for<F>(probe: &LoopbackProbe, check: F) -> LoopbackState
where
    F: Fn(&LoopbackState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = probe.snapshot();
        if check(&state) {
            return state;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("device never reached expected state: {:?}", state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn applies_samples_and_resets_on_disconnect() {
    let bridge = start_axis(ServerOptions {
        ack: true,
        ..ServerOptions::default()
    })
    .await;
    let mut client = connect(bridge.addr).await;

    client
        .send(Message::Text(
            r#"{"x": 0, "y": 0.9, "z": 0, "gas": true, "brake": true}"#.to_string(),
        ))
        .await
        .unwrap();
    let ack = next_text(&mut client).await;
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["direction"], "right");
    assert_eq!(ack["gas"], true);
    assert_eq!(ack["brake"], true);

    let state = bridge.probe.snapshot();
    assert_eq!(state.axis(AxisSlot::Y), Some(0x8000));
    assert_eq!(state.axis(AxisSlot::Z), Some(0x8000));
    assert_eq!(ack["steering_axis"], state.axis(AxisSlot::X).unwrap());

    client.close(None).await.unwrap();

    let state = wait_for(&bridge.probe, |s| s.axis(AxisSlot::Y) == Some(1)).await;
    assert_eq!(state.axis(AxisSlot::X), Some(JOYSTICK_CENTER));
    assert_eq!(state.axis(AxisSlot::Z), Some(1));

    bridge.shutdown.cancel();
    bridge.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let bridge = start_keys(ServerOptions {
        ack: true,
        ..ServerOptions::default()
    })
    .await;
    let mut client = connect(bridge.addr).await;

    client
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    client
        .send(Message::Text(r#"{"y": -0.5}"#.to_string()))
        .await
        .unwrap();

    // The malformed frame gets no reply, so the first ack belongs to the sample
    let ack = next_text(&mut client).await;
    assert_eq!(ack["direction"], "left");
    assert!(ack["steering_axis"].is_null());

    let state = bridge.probe.snapshot();
    assert!(state.is_pressed(ButtonId::ArrowLeft));
    assert!(!state.is_pressed(ButtonId::ArrowRight));

    client
        .send(Message::Text(r#"{"y": 0.5}"#.to_string()))
        .await
        .unwrap();
    next_text(&mut client).await;
    let state = bridge.probe.snapshot();
    assert!(!state.is_pressed(ButtonId::ArrowLeft));
    assert!(state.is_pressed(ButtonId::ArrowRight));

    bridge.shutdown.cancel();
    bridge.task.await.unwrap().unwrap();
    assert!(!bridge.probe.snapshot().is_pressed(ButtonId::ArrowRight));
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let bridge = start_axis(ServerOptions {
        ack: true,
        ..ServerOptions::default()
    })
    .await;
    let mut client = connect(bridge.addr).await;

    client
        .send(Message::Text(r#"{"y": -1.0, "gas": true}"#.to_string()))
        .await
        .unwrap();
    next_text(&mut client).await;
    assert_eq!(bridge.probe.snapshot().axis(AxisSlot::X), Some(1));

    bridge.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), bridge.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    let state = bridge.probe.snapshot();
    assert_eq!(state.axis(AxisSlot::X), Some(JOYSTICK_CENTER));
    assert_eq!(state.axis(AxisSlot::Y), Some(1));
}

#[tokio::test]
async fn idle_session_is_closed() {
    let bridge = start_keys(ServerOptions {
        ack: false,
        idle_timeout: Some(Duration::from_millis(100)),
    })
    .await;
    let mut client = connect(bridge.addr).await;

    client
        .send(Message::Text(r#"{"y": 0.8}"#.to_string()))
        .await
        .unwrap();
    wait_for(&bridge.probe, |s| s.is_pressed(ButtonId::ArrowRight)).await;

    assert!(
        closed_within(&mut client, Duration::from_secs(2)).await,
        "server kept the idle session open"
    );
    assert!(!bridge.probe.snapshot().is_pressed(ButtonId::ArrowRight));

    bridge.shutdown.cancel();
    bridge.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn ping_is_answered() {
    let bridge = start_keys(ServerOptions::default()).await;
    let mut client = connect(bridge.addr).await;

    client.send(Message::Ping(b"hi".to_vec())).await.unwrap();
    assert_eq!(next_pong(&mut client).await, b"hi".to_vec());

    // Exactly one pong per ping, so the next one carries the new payload
    client.send(Message::Ping(b"again".to_vec())).await.unwrap();
    assert_eq!(next_pong(&mut client).await, b"again".to_vec());

    bridge.shutdown.cancel();
    bridge.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn mapping_the_device_cannot_serve_fails_startup() {
    let controller =
        LoopbackController::new("keys only", DeviceProfile::Keyboard.capabilities(None));
    let device = DeviceHandle::acquire(Box::new(controller), 1).unwrap();
    let mapping = Arc::new(AxisConfig::for_profile(DeviceProfile::Joystick));

    let result =
        BridgeServer::bind("127.0.0.1", 0, device, mapping, ServerOptions::default()).await;
    assert!(matches!(result, Err(ServerError::Device(_))));
}

#[tokio::test]
async fn shutdown_does_not_wait_for_unfinished_handshakes() {
    let bridge = start_keys(ServerOptions::default()).await;

    // Connects over TCP but never sends the upgrade request
    let _silent = TcpStream::connect(bridge.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    bridge.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(3), bridge.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let bridge = start_keys(ServerOptions {
        ack: true,
        ..ServerOptions::default()
    })
    .await;
    let mut first = connect(bridge.addr).await;
    let mut second = connect(bridge.addr).await;
    let mut third = connect(bridge.addr).await;

    let ack = send_sample(&mut first, r#"{"y": -0.5}"#).await;
    assert_eq!(ack["direction"], "left");
    let ack = send_sample(&mut second, r#"{"y": 0.5}"#).await;
    assert_eq!(ack["direction"], "right");

    let state = bridge.probe.snapshot();
    assert!(state.is_pressed(ButtonId::ArrowLeft));
    assert!(state.is_pressed(ButtonId::ArrowRight));

    // Closing one client only releases what that session pressed
    first.close(None).await.unwrap();
    let state = wait_for(&bridge.probe, |s| !s.is_pressed(ButtonId::ArrowLeft)).await;
    assert!(state.is_pressed(ButtonId::ArrowRight));

    let ack = send_sample(&mut second, r#"{"y": -0.5}"#).await;
    assert_eq!(ack["direction"], "left");
    let state = bridge.probe.snapshot();
    assert!(state.is_pressed(ButtonId::ArrowLeft));
    assert!(!state.is_pressed(ButtonId::ArrowRight));

    // A device failure ends the session that hit it and nothing else
    bridge.probe.revoke();
    second
        .send(Message::Text(r#"{"y": 0.5}"#.to_string()))
        .await
        .unwrap();
    assert!(
        closed_within(&mut second, Duration::from_secs(2)).await,
        "session survived a device failure"
    );

    third.send(Message::Ping(b"alive".to_vec())).await.unwrap();
    assert_eq!(next_pong(&mut third).await, b"alive".to_vec());

    bridge.shutdown.cancel();
    bridge.task.await.unwrap().unwrap();
}
