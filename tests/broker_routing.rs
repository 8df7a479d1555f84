//! Broker routing over real TCP connections.

use std::time::Duration;

use hri_core_lib::config::{BrokerAddr, BrokerConfig};
use hri_core_lib::{Broker, BrokerHandle, ClientLink, EndpointName, EndpointRegistry};

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker(registry: EndpointRegistry) -> BrokerHandle {
    let config = BrokerConfig {
        address: BrokerAddr::Tcp("127.0.0.1:0".to_string()),
        handshake_timeout_ms: 500,
        ..BrokerConfig::default()
    };
    Broker::bind(config, registry)
        .await
        .expect("broker binds")
        .spawn()
}

async fn connect(broker: &BrokerHandle, name: &str) -> ClientLink {
    ClientLink::connect(broker.address(), EndpointName::new(name), 16)
        .await
        .expect("connects")
}

/// Polls the router until `expected` is exactly the bound set.
async fn wait_for_bindings(broker: &BrokerHandle, expected: &[&str]) {
    let expected: Vec<EndpointName> = expected.iter().map(|n| EndpointName::new(*n)).collect();
    tokio::time::timeout(WAIT, async {
        loop {
            let mut bound = broker.bindings().await.expect("router alive");
            bound.sort();
            let mut wanted = expected.clone();
            wanted.sort();
            if bound == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bindings settle");
}

async fn recv(link: &mut ClientLink) -> Option<String> {
    tokio::time::timeout(WAIT, link.recv())
        .await
        .expect("frame or close within timeout")
}

#[tokio::test]
async fn frames_reach_their_target_in_order() {
    let broker = start_broker(EndpointRegistry::default()).await;
    let mut robot = connect(&broker, "robot-executor").await;
    let interpreter = connect(&broker, "interpreter").await;
    wait_for_bindings(&broker, &["interpreter", "robot-executor"]).await;

    interpreter.send_text("robot-executor;pick;0.1,0.2").await.expect("sent");
    interpreter.send_text("robot-executor;execute$").await.expect("sent");

    assert_eq!(recv(&mut robot).await.as_deref(), Some("pick;0.1,0.2"));
    assert_eq!(recv(&mut robot).await.as_deref(), Some("execute"));
}

#[tokio::test]
async fn unbound_target_is_dropped_without_affecting_others() {
    let broker = start_broker(EndpointRegistry::default()).await;
    let mut robot = connect(&broker, "robot-executor").await;
    let interpreter = connect(&broker, "interpreter").await;
    wait_for_bindings(&broker, &["interpreter", "robot-executor"]).await;

    interpreter.send_text("ar-display;speech;ok").await.expect("sent");
    interpreter.send_text("nobody;hello").await.expect("sent");
    interpreter.send_text("robot-executor;execute").await.expect("sent");

    assert_eq!(recv(&mut robot).await.as_deref(), Some("execute"));
    assert!(interpreter.is_alive());
}

#[tokio::test]
async fn unknown_endpoint_is_rejected() {
    let broker = start_broker(EndpointRegistry::default()).await;
    let mut robot = connect(&broker, "robot-executor").await;
    wait_for_bindings(&broker, &["robot-executor"]).await;

    let mut stranger = connect(&broker, "toaster").await;
    assert_eq!(recv(&mut stranger).await, None);
    assert!(!stranger.is_alive());

    // The established peer keeps working.
    let interpreter = connect(&broker, "interpreter").await;
    wait_for_bindings(&broker, &["interpreter", "robot-executor"]).await;
    interpreter.send_text("robot-executor;execute").await.expect("sent");
    assert_eq!(recv(&mut robot).await.as_deref(), Some("execute"));
}

#[tokio::test]
async fn reconnect_replaces_previous_binding() {
    let broker = start_broker(EndpointRegistry::default()).await;
    let mut first = connect(&broker, "ar-display").await;
    wait_for_bindings(&broker, &["ar-display"]).await;

    let mut second = connect(&broker, "ar-display").await;
    // The superseded connection is closed by the broker.
    assert_eq!(recv(&mut first).await, None);
    wait_for_bindings(&broker, &["ar-display"]).await;

    let interpreter = connect(&broker, "interpreter").await;
    wait_for_bindings(&broker, &["ar-display", "interpreter"]).await;
    interpreter.send_text("ar-display;speech;ok").await.expect("sent");
    assert_eq!(recv(&mut second).await.as_deref(), Some("speech;ok"));
}

#[tokio::test]
async fn disconnect_removes_binding() {
    let broker = start_broker(EndpointRegistry::default()).await;
    let robot = connect(&broker, "robot-executor").await;
    wait_for_bindings(&broker, &["robot-executor"]).await;

    robot.close();
    wait_for_bindings(&broker, &[]).await;
}

#[tokio::test]
async fn aliases_resolve_for_handshake_and_target() {
    let mut registry = EndpointRegistry::default();
    registry
        .alias("yumi", "robot-executor")
        .alias("hololens", "ar-display");
    let broker = start_broker(registry).await;

    let mut robot = connect(&broker, "yumi").await;
    let interpreter = connect(&broker, "interpreter").await;
    wait_for_bindings(&broker, &["interpreter", "robot-executor"]).await;

    interpreter.send_text("yumi;execute").await.expect("sent");
    interpreter.send_text("robot-executor;pick;0.3,0.4").await.expect("sent");
    assert_eq!(recv(&mut robot).await.as_deref(), Some("execute"));
    assert_eq!(recv(&mut robot).await.as_deref(), Some("pick;0.3,0.4"));
}

#[cfg(unix)]
#[tokio::test]
async fn local_socket_routes_and_cleans_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broker.sock");
    // Leftover from a previous run.
    std::fs::write(&path, b"stale").expect("stale file");

    let config = BrokerConfig {
        address: BrokerAddr::Local(path.to_string_lossy().into_owned()),
        ..BrokerConfig::default()
    };
    let broker = Broker::bind(config, EndpointRegistry::default())
        .await
        .expect("binds over a stale path")
        .spawn();

    let mut robot = connect(&broker, "robot-executor").await;
    let interpreter = connect(&broker, "interpreter").await;
    wait_for_bindings(&broker, &["interpreter", "robot-executor"]).await;

    interpreter.send_text("robot-executor;execute").await.expect("sent");
    assert_eq!(recv(&mut robot).await.as_deref(), Some("execute"));

    broker.shutdown();
    tokio::time::timeout(WAIT, async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket path removed after shutdown");
}
