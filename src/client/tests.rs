use super::connection::{Connection, ConnectionManager, ConnectionState};
use super::subscription::DateSubscription;
use super::transport::{EventSink, Transport, TransportEvent};
use crate::config::Settings;
use crate::persistence::MemoryCredentialStore;
use crate::topic::TopicDate;
use crate::transport::message::{ClientMessage, Handshake, ServerMessage, UpdatePayload};
use crate::utils::FeedError;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type SendHook = Box<dyn FnOnce(&ClientMessage) + Send>;

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<ClientMessage>>,
    handshakes: Mutex<Vec<Handshake>>,
    opens: AtomicUsize,
    sink: Mutex<Option<EventSink>>,
    on_send: Mutex<Option<SendHook>>,
    hold_connect: bool,
}

impl FakeTransport {
    fn holding_connect() -> Self {
        Self {
            hold_connect: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().unwrap().clone().expect("transport not opened");
        sink(event);
    }

    /// Runs `hook` once, on the next frame sent, before it is recorded.
    fn on_next_send(&self, hook: impl FnOnce(&ClientMessage) + Send + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    fn deliver(&self, date: &str, data: Value) {
        self.emit(TransportEvent::Message(ServerMessage::DeliveryUpdate(
            UpdatePayload {
                date: date.to_string(),
                data,
            },
        )));
    }
}

impl Transport for FakeTransport {
    fn open(&self, _endpoint: &str, handshake: Handshake, events: EventSink) -> Result<(), FeedError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.handshakes.lock().unwrap().push(handshake);
        *self.sink.lock().unwrap() = Some(events.clone());
        if !self.hold_connect {
            events(TransportEvent::Connected);
        }
        Ok(())
    }

    fn send(&self, message: ClientMessage) -> Result<(), FeedError> {
        let hook = self.on_send.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&message);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&self) {}
}

fn manager_with(transport: Arc<FakeTransport>, token: Option<&str>) -> Arc<ConnectionManager> {
    let settings = Settings::default().client;
    let credentials = match token {
        Some(token) => MemoryCredentialStore::with(&settings.token_key, token),
        None => MemoryCredentialStore::new(),
    };
    Arc::new(ConnectionManager::new(
        settings,
        transport,
        Arc::new(credentials),
    ))
}

fn setup() -> (Arc<FakeTransport>, Arc<ConnectionManager>) {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager_with(transport.clone(), Some("bearer-abc"));
    (transport, manager)
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |item: T| sink.lock().unwrap().push(item))
}

fn date(s: &str) -> TopicDate {
    TopicDate::parse(s).unwrap()
}

fn join(d: &str) -> ClientMessage {
    ClientMessage::JoinDate(d.to_string())
}

fn leave(d: &str) -> ClientMessage {
    ClientMessage::LeaveDate(d.to_string())
}

#[test]
fn test_get_connection_returns_the_same_instance() {
    let (transport, manager) = setup();
    let a = manager.get_connection();
    let b = manager.get_connection();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.state(), ConnectionState::Disconnected);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn test_connect_attaches_the_stored_token_and_is_idempotent() {
    let (transport, manager) = setup();

    manager.ensure_authenticated_and_connected().unwrap();
    manager.ensure_authenticated_and_connected().unwrap();

    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(
        transport.handshakes.lock().unwrap()[0],
        Handshake::bearer("bearer-abc")
    );
    assert_eq!(manager.get_connection().state(), ConnectionState::Connected);
}

#[test]
fn test_connecting_state_does_not_reopen() {
    let transport = Arc::new(FakeTransport::holding_connect());
    let manager = manager_with(transport.clone(), Some("t"));

    manager.ensure_authenticated_and_connected().unwrap();
    assert_eq!(manager.get_connection().state(), ConnectionState::Connecting);
    manager.ensure_authenticated_and_connected().unwrap();

    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_credential_opens_nothing() {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager_with(transport.clone(), None);

    let (seen, on_update) = recorder::<Value>();
    let subscription = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_update);

    assert!(!subscription.is_active());
    assert!(matches!(
        manager.ensure_authenticated_and_connected(),
        Err(FeedError::MissingCredential(_))
    ));
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    assert!(transport.sent().is_empty());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_blank_credential_counts_as_missing() {
    let transport = Arc::new(FakeTransport::default());
    let manager = manager_with(transport.clone(), Some("   "));

    let (_seen, on_update) = recorder::<Value>();
    let subscription = DateSubscription::for_date(manager, date("2025-01-05"), on_update);

    assert!(!subscription.is_active());
    assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn test_same_canonical_date_is_a_noop() {
    let (transport, manager) = setup();
    let (_seen, on_update) = recorder::<Value>();
    let mut subscription = DateSubscription::new(manager, on_update);

    let morning = Utc.with_ymd_and_hms(2025, 1, 5, 8, 0, 0).unwrap();
    let evening = Utc.with_ymd_and_hms(2025, 1, 5, 20, 0, 0).unwrap();
    subscription.set_date(Some(morning));
    subscription.set_date(Some(evening));
    subscription.set_date(Some(NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()));

    assert_eq!(transport.sent(), vec![join("2025-01-05")]);
}

#[test]
fn test_payloads_for_other_dates_are_ignored() {
    let (transport, manager) = setup();
    let (seen, on_update) = recorder::<Value>();
    let _subscription = DateSubscription::for_date(manager, date("2025-01-05"), on_update);

    transport.deliver("2025-01-06", json!({"id": "D2"}));
    transport.deliver("2025-1-5", json!({"id": "D1"}));

    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": "D1"})]);
}

#[test]
fn test_switching_dates_leaves_then_joins() {
    let (transport, manager) = setup();
    let (seen, on_update) = recorder::<Value>();
    let mut subscription = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_update);
    transport.clear();

    subscription.set_date(Some(date("2025-01-06")));

    assert_eq!(
        transport.sent(),
        vec![leave("2025-01-05"), join("2025-01-06")]
    );
    assert_eq!(manager.get_connection().handler_count(), 1);

    transport.deliver("2025-01-05", json!({"id": "stale"}));
    transport.deliver("2025-01-06", json!({"id": "fresh"}));
    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": "fresh"})]);
}

#[test]
fn test_clearing_the_date_goes_idle() {
    let (transport, manager) = setup();
    let (_seen, on_update) = recorder::<Value>();
    let mut subscription = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_update);

    subscription.set_date(None::<TopicDate>);

    assert!(!subscription.is_active());
    assert_eq!(
        transport.sent(),
        vec![join("2025-01-05"), leave("2025-01-05")]
    );
    assert_eq!(manager.get_connection().handler_count(), 0);
}

#[test]
fn test_dropping_leaves_once_and_stops_callbacks() {
    let (transport, manager) = setup();
    let (seen, on_update) = recorder::<Value>();
    let mut subscription = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_update);

    subscription.unsubscribe();
    drop(subscription);
    transport.deliver("2025-01-05", json!({"id": "late"}));

    let leaves = transport
        .sent()
        .into_iter()
        .filter(|m| *m == leave("2025-01-05"))
        .count();
    assert_eq!(leaves, 1);
    assert!(seen.lock().unwrap().is_empty());
    assert!(manager.get_connection().joined_topics().is_empty());
}

#[test]
fn test_two_consumers_on_the_same_date_both_receive() {
    let (transport, manager) = setup();
    let (seen_a, on_a) = recorder::<Value>();
    let (seen_b, on_b) = recorder::<Value>();
    let _a = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_a);
    let _b = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_b);

    transport.deliver("2025-01-05", json!({"id": "D1"}));

    assert_eq!(seen_a.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap().len(), 1);
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_one_consumer_leaving_keeps_the_other_joined() {
    let (transport, manager) = setup();
    let (seen_b, on_b) = recorder::<Value>();
    let (_seen_a, on_a) = recorder::<Value>();
    let a = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_a);
    let _b = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_b);

    drop(a);
    transport.deliver("2025-01-05", json!({"id": "D1"}));

    assert_eq!(seen_b.lock().unwrap().len(), 1);
    assert_eq!(manager.get_connection().joined_topics(), vec!["2025-01-05"]);
}

#[test]
fn test_mount_publish_unmount_scenario() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Delivery {
        id: String,
    }

    let (transport, manager) = setup();
    let (seen, on_update) = recorder::<Delivery>();
    let mounted = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
    let subscription = DateSubscription::for_date(manager, mounted, on_update);

    transport.deliver("2025-03-10", json!({"id": "D1"}));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Delivery {
            id: "D1".to_string()
        }]
    );

    drop(subscription);
    transport.deliver("2025-03-10", json!({"id": "D1"}));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_latest_callback_is_used_without_rejoining() {
    let (transport, manager) = setup();
    let (first, on_first) = recorder::<Value>();
    let (second, on_second) = recorder::<Value>();
    let subscription = DateSubscription::for_date(manager, date("2025-01-05"), on_first);

    subscription.set_callback(on_second);
    transport.deliver("2025-01-05", json!({"id": "D1"}));

    assert!(first.lock().unwrap().is_empty());
    assert_eq!(second.lock().unwrap().len(), 1);
    assert_eq!(transport.sent(), vec![join("2025-01-05")]);
}

#[test]
fn test_undecodable_data_is_dropped() {
    #[derive(Debug, Deserialize)]
    struct Delivery {
        #[allow(dead_code)]
        id: String,
    }

    let (transport, manager) = setup();
    let (seen, on_update) = recorder::<Delivery>();
    let _subscription = DateSubscription::for_date(manager, date("2025-01-05"), on_update);

    transport.deliver("2025-01-05", json!({"unexpected": true}));
    transport.deliver("garbage", json!({"id": "D1"}));

    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_joins_wait_for_the_connection() {
    let transport = Arc::new(FakeTransport::holding_connect());
    let manager = manager_with(transport.clone(), Some("t"));
    let (_seen, on_update) = recorder::<Value>();
    let _subscription = DateSubscription::for_date(manager, date("2025-01-05"), on_update);

    assert!(transport.sent().is_empty());
    transport.emit(TransportEvent::Connected);
    assert_eq!(transport.sent(), vec![join("2025-01-05")]);
}

#[test]
fn test_reconnect_rejoins_every_topic() {
    let (transport, manager) = setup();
    let (_a_seen, on_a) = recorder::<Value>();
    let (_b_seen, on_b) = recorder::<Value>();
    let (_c_seen, on_c) = recorder::<Value>();
    let _a = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_a);
    let _b = DateSubscription::for_date(manager.clone(), date("2025-01-05"), on_b);
    let _c = DateSubscription::for_date(manager.clone(), date("2025-01-06"), on_c);
    transport.clear();

    transport.emit(TransportEvent::Disconnected { will_retry: true });
    assert_eq!(manager.get_connection().state(), ConnectionState::Connecting);
    transport.emit(TransportEvent::Connected);

    let mut sent = transport.sent();
    sent.sort_by_key(|m| format!("{m:?}"));
    assert_eq!(
        sent,
        vec![join("2025-01-05"), join("2025-01-05"), join("2025-01-06")]
    );
}

#[test]
fn test_rejected_handshake_allows_a_later_attempt() {
    let (transport, manager) = setup();
    manager.ensure_authenticated_and_connected().unwrap();

    transport.emit(TransportEvent::Rejected("authentication failed".into()));
    assert_eq!(manager.get_connection().state(), ConnectionState::Disconnected);

    manager.ensure_authenticated_and_connected().unwrap();
    assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
}

#[test]
fn test_disconnect_resets_state() {
    let transport = Arc::new(FakeTransport::default());
    let connection = Connection::new("ws://example.test", transport.clone());
    connection.set_auth("t");
    connection.connect().unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);

    connection.disconnect();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[test]
fn test_leave_during_rejoin_is_sent_after_the_replayed_join() {
    let (transport, manager) = setup();
    let (_a_seen, on_a) = recorder::<Value>();
    let (_b_seen, on_b) = recorder::<Value>();
    let a = Arc::new(Mutex::new(Some(DateSubscription::for_date(
        manager.clone(),
        date("2025-01-05"),
        on_a,
    ))));
    let b = Arc::new(Mutex::new(Some(DateSubscription::for_date(
        manager.clone(),
        date("2025-01-06"),
        on_b,
    ))));
    transport.emit(TransportEvent::Disconnected { will_retry: true });
    transport.clear();

    // While the first replayed join goes out, another thread drops the
    // subscription whose join has not been replayed yet.
    let dropper: Arc<Mutex<Option<thread::JoinHandle<()>>>> = Arc::new(Mutex::new(None));
    {
        let (a, b, dropper) = (a.clone(), b.clone(), dropper.clone());
        transport.on_next_send(move |first| {
            let other = if *first == join("2025-01-05") { b } else { a };
            let handle = thread::spawn(move || {
                let subscription = other.lock().unwrap().take();
                drop(subscription);
            });
            *dropper.lock().unwrap() = Some(handle);
            thread::sleep(Duration::from_millis(50));
        });
    }

    transport.emit(TransportEvent::Connected);
    let handle = dropper.lock().unwrap().take().expect("hook did not run");
    handle.join().unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    let left = sent
        .iter()
        .find_map(|m| match m {
            ClientMessage::LeaveDate(d) => Some(d.clone()),
            _ => None,
        })
        .expect("no leave sent");
    let join_at = sent.iter().position(|m| *m == join(&left)).unwrap();
    let leave_at = sent.iter().position(|m| *m == leave(&left)).unwrap();
    assert!(join_at < leave_at, "leave overtook the replayed join: {sent:?}");
    assert_eq!(manager.get_connection().joined_topics().len(), 1);

    drop(a);
    drop(b);
}
