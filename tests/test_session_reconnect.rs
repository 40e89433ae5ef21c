//! Session lifecycle against a loopback broker
//!
//! `FakeBroker` speaks just enough MQTT 3.1.1 (CONNECT, SUBSCRIBE, PINGREQ,
//! DISCONNECT) to drive a real `MqttSession` through connect, an outage, the
//! reconnect backoff and re-subscription.

mod test_helpers;

use mqtt_bridge::bridge::InboundListener;
use mqtt_bridge::dispatch::HandlerStrategy;
use mqtt_bridge::observability::{ChannelObserver, EventBus, SessionEvent};
use mqtt_bridge::testing::RecordingHandler;
use mqtt_bridge::transport::mqtt::{ConnectionState, MqttSession};
use rumqttc::QoS;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{recording_dispatcher, test_config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
const DATA_TOPIC: &str = "/api/v1/device42/mqtt/dataResp";

/// What the broker does on one accepted connection
#[derive(Clone, Default)]
struct Script {
    /// Sent as a QoS 0 PUBLISH right after the SUBACK
    publish_after_suback: Option<(String, String)>,
}

struct FakeBroker {
    uri: String,
    log: Arc<Mutex<Vec<String>>>,
    kick: Arc<Notify>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    /// Connection n follows `scripts[n - 1]`; later ones use the default script
    async fn start(scripts: Vec<Script>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        let kick = Arc::new(Notify::new());

        let accept_task = {
            let log = log.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                let mut accepted = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    accepted += 1;
                    let script = scripts.get(accepted - 1).cloned().unwrap_or_default();
                    tokio::spawn(serve(stream, accepted, script, log.clone(), kick.clone()));
                }
            })
        };

        Self {
            uri,
            log,
            kick,
            accept_task,
        }
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Close the live connection without a DISCONNECT
    fn drop_connection(&self) {
        self.kick.notify_one();
    }

    /// Close the listening socket; new connections are refused
    async fn stop_accepting(&mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
    }
}

async fn serve(
    mut stream: TcpStream,
    number: usize,
    script: Script,
    log: Arc<Mutex<Vec<String>>>,
    kick: Arc<Notify>,
) -> io::Result<()> {
    loop {
        let (header, body) = tokio::select! {
            packet = read_packet(&mut stream) => packet?,
            _ = kick.notified() => return Ok(()),
        };

        match header >> 4 {
            // CONNECT
            1 => {
                log.lock().unwrap().push(format!("connect{number}"));
                stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;
            }
            // SUBSCRIBE
            8 => {
                let (packet_id, filters) = subscribe_filters(&body);
                let names: Vec<&str> = filters.iter().map(|(f, _)| f.as_str()).collect();
                log.lock()
                    .unwrap()
                    .push(format!("sub{number}:{}", names.join(",")));

                let mut suback = vec![0x90];
                encode_remaining_length(2 + filters.len(), &mut suback);
                suback.extend_from_slice(&packet_id.to_be_bytes());
                suback.extend(filters.iter().map(|(_, qos)| *qos));
                stream.write_all(&suback).await?;

                if let Some((topic, payload)) = &script.publish_after_suback {
                    stream.write_all(&publish_packet(topic, payload)).await?;
                }
            }
            // PINGREQ
            12 => stream.write_all(&[0xD0, 0x00]).await?,
            // DISCONNECT
            14 => return Ok(()),
            _ => {}
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "remaining length too long"));
        }
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Packet identifier and (filter, requested QoS) pairs of a SUBSCRIBE body
fn subscribe_filters(body: &[u8]) -> (u16, Vec<(String, u8)>) {
    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    let mut filters = Vec::new();
    let mut rest = &body[2..];
    while rest.len() >= 3 {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let filter = String::from_utf8_lossy(&rest[2..2 + len]).into_owned();
        filters.push((filter, rest[2 + len]));
        rest = &rest[3 + len..];
    }
    (packet_id, filters)
}

fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
    let mut packet = vec![0x30];
    encode_remaining_length(2 + topic.len() + payload.len(), &mut packet);
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload.as_bytes());
    packet
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Collect events up to and including the first one of `kind`
async fn events_until(rx: &mut UnboundedReceiver<SessionEvent>, kind: &str) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("no `{kind}` event; saw {:?}", kinds(&seen)))
            .expect("event bus closed");
        let done = event.kind() == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::kind).collect()
}

fn assert_first_backoff_step(events: &[SessionEvent]) {
    let reconnecting = events
        .iter()
        .find(|event| event.kind() == "reconnecting")
        .expect("outage should schedule a reconnect");
    match reconnecting {
        SessionEvent::Reconnecting { attempt, delay, .. } => {
            assert_eq!(*attempt, 1);
            assert_eq!(*delay, Duration::from_secs(1));
        }
        other => panic!("Expected Reconnecting, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_dispatches() {
    let broker = FakeBroker::start(vec![
        Script::default(),
        Script {
            publish_after_suback: Some((DATA_TOPIC.to_string(), "after-reconnect".to_string())),
        },
    ])
    .await;

    let mut config = test_config();
    config.hosts = vec![broker.uri()];
    let (observer, mut events) = ChannelObserver::channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let session = Arc::new(
        MqttSession::new(
            config.consumer_client_id.clone(),
            Arc::new(config),
            EventBus::new().with_observer(observer),
        )
        .unwrap()
        .with_inbound(inbound_tx),
    );

    let handler = RecordingHandler::new("/api/v1/.*/mqtt/dataResp");
    let strategy: Arc<dyn HandlerStrategy> = handler.clone();
    let (dispatcher, _dispatch_events) = recording_dispatcher(vec![strategy]);

    session.connect().await.unwrap();
    let listener = InboundListener::start(
        session.clone(),
        inbound_rx,
        dispatcher,
        vec!["/api/v1/#".to_string()],
        QoS::AtLeastOnce,
    )
    .await
    .unwrap();

    let startup = events_until(&mut events, "subscribed").await;
    assert_eq!(kinds(&startup), vec!["connected", "subscribed"]);

    // First outage
    broker.drop_connection();
    let outage = events_until(&mut events, "subscribed").await;
    assert_eq!(
        kinds(&outage),
        vec!["connection_lost", "reconnecting", "connected", "subscribed"]
    );
    assert_first_backoff_step(&outage);

    tokio::time::timeout(EVENT_TIMEOUT, handler.wait_for_calls(1))
        .await
        .expect("message published after the reconnect should reach the handler");
    assert_eq!(handler.payloads(), vec!["after-reconnect"]);
    assert_eq!(
        broker.log(),
        vec!["connect1", "sub1:/api/v1/#", "connect2", "sub2:/api/v1/#"]
    );

    // Second outage starts the backoff over
    broker.drop_connection();
    let outage = events_until(&mut events, "subscribed").await;
    assert_eq!(
        kinds(&outage),
        vec!["connection_lost", "reconnecting", "connected", "subscribed"]
    );
    assert_first_backoff_step(&outage);
    assert_eq!(session.health_metrics().reconnect_count, 2);
    assert_eq!(session.state(), ConnectionState::Connected);

    listener.stop().await;
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_failed_reconnect_reports_every_host() {
    let mut broker = FakeBroker::start(Vec::new()).await;
    let spare = format!("tcp://127.0.0.1:{}", closed_port());

    let mut config = test_config();
    config.hosts = vec![broker.uri(), spare.clone()];
    config.connection_timeout = 1;
    let (observer, mut events) = ChannelObserver::channel();
    let session = MqttSession::new(
        config.producer_client_id.clone(),
        Arc::new(config),
        EventBus::new().with_observer(observer),
    )
    .unwrap();

    session.connect().await.unwrap();
    events_until(&mut events, "connected").await;

    broker.stop_accepting().await;
    broker.drop_connection();

    let outage = events_until(&mut events, "connection_failed").await;
    assert_eq!(
        kinds(&outage),
        vec!["connection_lost", "reconnecting", "connection_failed"]
    );
    match outage.last() {
        Some(SessionEvent::ConnectionFailed { hosts, cause, .. }) => {
            assert_eq!(hosts, &vec![broker.uri(), spare]);
            // First reconnect attempt targets the first host
            assert!(cause.starts_with(&broker.uri()), "cause was {cause:?}");
        }
        other => panic!("Expected ConnectionFailed, got {other:?}"),
    }

    // Stops during the second backoff delay
    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Closed);
}
