//! End-to-end tests over the mock flash, transports and radios

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use fieldlink::communication::gateway::LoRaMqttGateway;
use fieldlink::communication::link::mock::{MockDelay, MockWifi};
use fieldlink::communication::link::{LinkEvent, Poller};
use fieldlink::communication::protocol::{DropReason, InboundOutcome, UpdateStatus};
use fieldlink::communication::transport::mock::{MockRadio, MockSession, MockTransport};
use fieldlink::communication::transport::{LoRaTransport, MqttTransport, Route, LORA_MAX_PACKET};
use fieldlink::parameters::network::{LoRaConfig, NodeConfig};
use fieldlink::parameters::storage::{FlashStore, MemoryStore, PersistentStore};
use fieldlink::parameters::value::{ParamString, ParamValue};
use fieldlink::platform::mock::MockFlash;
use fieldlink::ParamNode;

type Raw = CriticalSectionRawMutex;

fn config() -> NodeConfig {
    NodeConfig::new("pump-7").unwrap()
}

fn mqtt_config() -> NodeConfig {
    config()
        .with_wifi("FieldNet", "secret")
        .unwrap()
        .with_broker("broker.local", 1883, "node", "pw")
        .unwrap()
        .with_mqtt_log(true)
}

fn node_over<S: PersistentStore>(store: S) -> ParamNode<Raw, S, MockTransport> {
    ParamNode::new(config(), store, MockTransport::new())
}

fn text(s: &str) -> ParamString {
    ParamString::try_from(s).unwrap()
}

async fn register_all<S: PersistentStore>(node: &ParamNode<Raw, S, MockTransport>) {
    node.add_parameter("count", 1i32).await.unwrap();
    node.add_parameter("gain", 0.5f32).await.unwrap();
    node.add_parameter("offset", 0.25f64).await.unwrap();
    node.add_parameter("enabled", false).await.unwrap();
    node.add_parameter("mode", text("auto")).await.unwrap();
}

async fn persisted_values_survive_restart<S: PersistentStore>(store: S) -> S {
    let node = node_over(store);
    register_all(&node).await;

    let outcome = node
        .handle_inbound(
            br#"{"id":"u1","parameters":{"count":7,"gain":2.5,"offset":-1.5,"enabled":true,"mode":"manual"}}"#,
        )
        .await;
    assert_eq!(
        outcome,
        InboundOutcome::Acknowledged {
            status: UpdateStatus::Updated,
            ack_sent: true
        }
    );

    {
        let registry = node.registry().lock().await;
        let store = registry.store();
        assert_eq!(store.load("count"), Some(ParamValue::Int(7)));
        assert_eq!(store.load("gain"), Some(ParamValue::Float(2.5)));
        assert_eq!(store.load("offset"), Some(ParamValue::Double(-1.5)));
        assert_eq!(store.load("enabled"), Some(ParamValue::Bool(true)));
        assert_eq!(store.load("mode"), Some(ParamValue::Str(text("manual"))));
    }

    // Fresh node over the same store: persisted values beat the defaults
    let store = node.into_store();
    let node = node_over(store);
    let count = node.add_parameter("count", 1i32).await.unwrap();
    let gain = node.add_parameter("gain", 0.5f32).await.unwrap();
    let offset = node.add_parameter("offset", 0.25f64).await.unwrap();
    let enabled = node.add_parameter("enabled", false).await.unwrap();
    let mode = node.add_parameter("mode", text("auto")).await.unwrap();

    assert_eq!(node.get(&count).await, Some(7));
    assert_eq!(node.get(&gain).await, Some(2.5));
    assert_eq!(node.get(&offset).await, Some(-1.5));
    assert_eq!(node.get(&enabled).await, Some(true));
    assert_eq!(node.get(&mode).await, Some(text("manual")));

    node.into_store()
}

#[tokio::test]
async fn test_restart_memory_store() {
    persisted_values_survive_restart(MemoryStore::new()).await;
}

#[tokio::test]
async fn test_restart_flash_store() {
    let store = FlashStore::open(MockFlash::new()).unwrap();
    let store = persisted_values_survive_restart(store).await;

    // Reopen from raw flash, as after a power cycle
    let reopened = FlashStore::open(store.into_flash()).unwrap();
    assert_eq!(reopened.load("count"), Some(ParamValue::Int(7)));
    assert_eq!(reopened.load("mode"), Some(ParamValue::Str(text("manual"))));
}

#[tokio::test]
async fn test_threshold_example() {
    let node = node_over(MemoryStore::new());
    let threshold = node.add_parameter("threshold", 10i32).await.unwrap();

    node.handle_inbound(br#"{"id":"1","parameters":{"threshold":42}}"#)
        .await;

    assert_eq!(node.get(&threshold).await, Some(42));
    assert_eq!(
        node.registry().lock().await.store().load("threshold"),
        Some(ParamValue::Int(42))
    );
    let transport = node.transport().lock().await;
    let acks: Vec<&[u8]> = transport
        .sent()
        .iter()
        .filter(|m| m.route == Route::Confirmation)
        .map(|m| m.payload.as_slice())
        .collect();
    assert_eq!(acks, [br#"{"id":"1","Device":"pump-7","status":"updated"}"#.as_slice()]);
}

#[tokio::test]
async fn test_partial_apply_stops_at_first_failure() {
    let node = node_over(MemoryStore::new());
    let a = node.add_parameter("a", 1i32).await.unwrap();
    let b = node.add_parameter("b", false).await.unwrap();
    let c = node.add_parameter("c", 3i32).await.unwrap();

    let outcome = node
        .handle_inbound(br#"{"id":"p1","parameters":{"a":10,"b":"yes","c":30}}"#)
        .await;

    assert_eq!(
        outcome,
        InboundOutcome::Acknowledged {
            status: UpdateStatus::Failed,
            ack_sent: true
        }
    );
    assert_eq!(node.get(&a).await, Some(10));
    assert_eq!(node.get(&b).await, Some(false));
    assert_eq!(node.get(&c).await, Some(3));

    let registry = node.registry().lock().await;
    assert_eq!(registry.store().load("a"), Some(ParamValue::Int(10)));
    assert_eq!(registry.store().load("b"), Some(ParamValue::Bool(false)));
    assert_eq!(registry.store().load("c"), Some(ParamValue::Int(3)));
    drop(registry);

    assert_eq!(
        node.transport().lock().await.sent_payloads(Route::Confirmation),
        [r#"{"id":"p1","Device":"pump-7","status":"failed"}"#]
    );
}

#[tokio::test]
async fn test_unknown_names_only_still_acknowledged() {
    let node = node_over(MemoryStore::new());
    node.add_parameter("threshold", 10i32).await.unwrap();

    let outcome = node
        .handle_inbound(br#"{"id":"x","parameters":{"nope":1,"other":"v"}}"#)
        .await;

    assert_eq!(
        outcome,
        InboundOutcome::Acknowledged {
            status: UpdateStatus::Updated,
            ack_sent: true
        }
    );
    assert_eq!(
        node.transport().lock().await.sent_payloads(Route::Confirmation),
        [r#"{"id":"x","Device":"pump-7","status":"updated"}"#]
    );
}

#[tokio::test]
async fn test_malformed_input_changes_nothing() {
    let node = node_over(MemoryStore::new());
    let threshold = node.add_parameter("threshold", 10i32).await.unwrap();
    let writes = node.registry().lock().await.store().write_count();
    node.transport().lock().await.clear_sent();

    let payloads: [&[u8]; 5] = [
        b"{\"id\":\"1\",\"parameters\":{\"threshold\":42",
        br#"{"parameters":{"threshold":42}}"#,
        br#"{"id":"1","parameters":[42]}"#,
        br#"{"id":1,"parameters":{"threshold":42}}"#,
        b"",
    ];
    for payload in payloads {
        let outcome = node.handle_inbound(payload).await;
        assert!(matches!(
            outcome,
            InboundOutcome::Dropped(DropReason::Malformed(_))
        ));
    }

    assert_eq!(node.get(&threshold).await, Some(10));
    assert_eq!(node.registry().lock().await.store().write_count(), writes);
    assert!(node.transport().lock().await.sent().is_empty());
}

#[tokio::test]
async fn test_queued_logs_delivered_in_order_once_session_up() {
    let node: ParamNode<Raw, _, MqttTransport<MockSession>> =
        ParamNode::start_mqtt(mqtt_config(), MemoryStore::new(), MockSession::new()).unwrap();

    node.log("first").await;
    node.log("second").await;
    node.log("third").await;
    assert!(node.transport().lock().await.session().published().is_empty());
    assert_eq!(node.queue().lock().await.len(), 3);

    let mut wifi = MockWifi::new();
    let mut delay = MockDelay::new();
    let credentials = node.config().wifi.clone();
    node.link()
        .step(&mut wifi, &node, &credentials, &mut delay, 5000)
        .await;

    assert!(node.link().state().await.is_usable());
    assert!(node.queue().lock().await.is_empty());
    let transport = node.transport().lock().await;
    let session = transport.session();
    assert_eq!(
        session.published_to("boards/pump-7/log"),
        ["first", "second", "third"]
    );
    assert_eq!(session.subscriptions(), ["boards/pump-7"]);
    assert_eq!(session.published_to("boards/registry").len(), 1);
}

#[tokio::test]
async fn test_retry_loops_never_both_active() {
    let node: ParamNode<Raw, _, MqttTransport<MockSession>> =
        ParamNode::start_mqtt(mqtt_config(), MemoryStore::new(), MockSession::new()).unwrap();
    node.transport()
        .lock()
        .await
        .session_mut()
        .set_connect_ok(false);

    let mut wifi = MockWifi::new();
    let mut delay = MockDelay::new();
    let credentials = node.config().wifi.clone();

    let mut seen = Vec::new();
    for round in 0..12 {
        match round {
            4 => node
                .transport()
                .lock()
                .await
                .session_mut()
                .set_connect_ok(true),
            7 => {
                wifi.disconnect();
                wifi.set_connect_ok(false);
                node.link().post(LinkEvent::WifiDown);
            }
            9 => wifi.set_connect_ok(true),
            _ => {}
        }

        node.link()
            .step(&mut wifi, &node, &credentials, &mut delay, 5000)
            .await;

        let state = node.link().state().await;
        assert!(!(state.is_polling(Poller::Wifi) && state.is_polling(Poller::Session)));
        seen.push(state.active_poller());
    }

    assert!(seen.contains(&Some(Poller::Session)));
    assert!(seen.contains(&Some(Poller::Wifi)));
    assert_eq!(seen.last(), Some(&None));
    assert!(node.link().state().await.is_usable());
}

#[tokio::test]
async fn test_heartbeat_broadcasts_catalogue() {
    let node = node_over(MemoryStore::new());
    node.add_parameter("threshold", 10i32).await.unwrap();
    node.transport().lock().await.clear_sent();

    let mut delay = MockDelay::new();
    assert!(node.heartbeat(&mut delay).await);
    assert_eq!(delay.elapsed_ms(), 60_000);

    node.transport().lock().await.set_usable(false);
    assert!(!node.heartbeat(&mut delay).await);

    assert_eq!(
        node.transport().lock().await.sent_payloads(Route::Registry),
        [r#"{"Device":"pump-7","parameters":[{"threshold":"10"}]}"#]
    );
}

#[tokio::test]
async fn test_lora_node_through_gateway() {
    let gateway_config = NodeConfig::new("gateway")
        .unwrap()
        .with_wifi("FieldNet", "secret")
        .unwrap()
        .with_broker("broker.local", 1883, "", "")
        .unwrap();
    let mut session = MockSession::new();
    session.set_connected(true);
    let gateway: LoRaMqttGateway<Raw, _, _> =
        LoRaMqttGateway::new(&gateway_config, session, MockRadio::new(), &LoRaConfig::default())
            .unwrap();

    let node: ParamNode<Raw, _, LoRaTransport<MockRadio>> =
        ParamNode::start_lora(config(), MemoryStore::new(), MockRadio::new(), &LoRaConfig::default())
            .unwrap();
    let threshold = node.add_parameter("threshold", 10i32).await.unwrap();

    // Node catalogue over the air, relayed to the registry topic
    let catalogue = node.transport().lock().await.radio().transmitted()[0].clone();
    gateway.handle_lora_packet(&catalogue).await.unwrap();

    // Operator update on MQTT, forwarded over LoRa with the device injected
    gateway
        .handle_mqtt_message("boards/pump-7", br#"{"id":"9","parameters":{"threshold":42}}"#)
        .await
        .unwrap();
    let forwarded = gateway.radio().lock().await.radio().transmitted()[0].clone();
    assert!(node.post_lora_packet(&forwarded));
    node.process_lora_packet().await;
    assert_eq!(node.get(&threshold).await, Some(42));

    // Node ack back through the gateway to the confirmation topic
    let ack = node.transport().lock().await.radio().transmitted()[1].clone();
    gateway.handle_lora_packet(&ack).await.unwrap();

    let session = gateway.session().lock().await;
    assert_eq!(
        session.published_to("boards/registry"),
        [r#"{"Device":"pump-7","parameters":[{"threshold":"10"}]}"#]
    );
    assert_eq!(
        session.published_to("boards/pump-7/confirmation"),
        [r#"{"id":"9","Device":"pump-7","status":"updated"}"#]
    );
    assert_eq!(session.subscriptions(), ["boards/pump-7"]);
}

#[tokio::test]
async fn test_lora_update_for_other_node_ignored() {
    let node: ParamNode<Raw, _, LoRaTransport<MockRadio>> =
        ParamNode::start_lora(config(), MemoryStore::new(), MockRadio::new(), &LoRaConfig::default())
            .unwrap();
    let threshold = node.add_parameter("threshold", 10i32).await.unwrap();

    node.post_lora_packet(br#"{"Device":"valve-2","id":"1","parameters":{"threshold":42}}"#);
    assert_eq!(
        node.process_lora_packet().await,
        InboundOutcome::Dropped(DropReason::NotAddressed)
    );
    assert_eq!(node.get(&threshold).await, Some(10));
    // Only the catalogue went out
    assert_eq!(node.transport().lock().await.radio().transmitted().len(), 1);
}

#[tokio::test]
async fn test_lora_catalogue_split_across_frames() {
    let node: ParamNode<Raw, _, LoRaTransport<MockRadio>> =
        ParamNode::start_lora(config(), MemoryStore::new(), MockRadio::new(), &LoRaConfig::default())
            .unwrap();
    for i in 0..12i32 {
        node.add_parameter(format!("sensor_threshold_{:02}", i).as_str(), 1000 + i)
            .await
            .unwrap();
    }

    node.transport().lock().await.radio_mut().clear_transmitted();
    let mut delay = MockDelay::new();
    assert!(node.heartbeat(&mut delay).await);

    let transport = node.transport().lock().await;
    let frames = transport.radio().transmitted();
    assert!(frames.len() > 1);

    let mut names = Vec::new();
    for frame in frames {
        assert!(frame.len() <= LORA_MAX_PACKET);
        let doc: serde_json::Value = serde_json::from_slice(frame).unwrap();
        assert_eq!(doc["Device"], "pump-7");
        for entry in doc["parameters"].as_array().unwrap() {
            names.extend(entry.as_object().unwrap().keys().cloned());
        }
    }
    assert_eq!(names.len(), 12);
    assert_eq!(names[0], "sensor_threshold_00");
    assert_eq!(names[11], "sensor_threshold_11");
}
