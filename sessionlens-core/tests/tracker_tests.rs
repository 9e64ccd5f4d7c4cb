//! Tests for tracker assembly, triggered reporting, delivery and shutdown

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sessionlens_core::delivery::DeliveryPayload;
use sessionlens_core::prelude::*;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Collect(Mutex<Vec<(String, LogLevel, Value)>>);

impl LogSink for Collect {
    fn emit(&self, namespace: &str, level: LogLevel, payload: &Value) {
        self.0
            .lock()
            .push((namespace.to_string(), level, payload.clone()));
    }
}

impl Collect {
    fn reports(&self) -> Vec<SessionReport> {
        self.0
            .lock()
            .iter()
            .filter(|(namespace, level, _)| namespace == "session" && *level == LogLevel::Info)
            .map(|(_, _, payload)| serde_json::from_value(payload.clone()).unwrap())
            .collect()
    }

    fn session_errors(&self) -> Vec<Value> {
        self.0
            .lock()
            .iter()
            .filter(|(namespace, level, _)| namespace == "session" && *level == LogLevel::Error)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[derive(Default)]
struct RecordingConsole(Mutex<Vec<(LogLevel, Vec<Value>)>>);

impl ConsoleApi for RecordingConsole {
    fn call(&self, level: LogLevel, args: &[Value]) {
        self.0.lock().push((level, args.to_vec()));
    }
}

struct PanickingConsole;

impl ConsoleApi for PanickingConsole {
    fn call(&self, _level: LogLevel, _args: &[Value]) {
        panic!("console is broken");
    }
}

struct FakeFetch(u16);

#[async_trait]
impl FetchApi for FakeFetch {
    async fn fetch(&self, _request: FetchRequest) -> std::result::Result<FetchResponse, FetchError> {
        let mut response = FetchResponse::new(self.0);
        response.body = b"{\"ok\":true}".to_vec();
        Ok(response)
    }
}

#[derive(Default)]
struct FakeRecorder {
    starts: AtomicUsize,
    sink: Mutex<Option<FrameCallback>>,
}

impl FakeRecorder {
    fn emit(&self, frame: Value) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(frame);
        }
    }
}

impl ReplayRecorder for FakeRecorder {
    fn start(&self, on_frame: FrameCallback, _options: &ReplayOptions) -> Option<StopHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock() = Some(on_frame);
        Some(Box::new(|| {}))
    }
}

#[derive(Debug)]
enum Outcome {
    Status(u16),
    Fail(&'static str),
}

#[derive(Debug)]
struct RecordingTransport {
    outcome: Outcome,
    posted: Mutex<Vec<(String, DeliveryPayload)>>,
}

impl RecordingTransport {
    fn new(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            posted: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReportTransport for RecordingTransport {
    async fn post_json(&self, endpoint: &str, payload: &DeliveryPayload) -> Result<u16> {
        self.posted
            .lock()
            .push((endpoint.to_string(), payload.clone()));
        match self.outcome {
            Outcome::Status(status) => Ok(status),
            Outcome::Fail(message) => Err(SessionLensError::Other(message.to_string())),
        }
    }
}

fn bus_with_sink() -> (Arc<EventBus>, Arc<Collect>) {
    let bus = Arc::new(EventBus::empty());
    let sink = Arc::new(Collect::default());
    bus.use_sink(sink.clone());
    (bus, sink)
}

#[tokio::test(start_paused = true)]
async fn test_error_trigger_fires_once_after_delay() {
    let (bus, sink) = bus_with_sink();
    let page = Arc::new(PageEnvironment::builder().build());
    let _tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(bus)
        .with_console_auto_reporting([LogLevel::Error])
        .build()
        .unwrap();

    page.console().call(LogLevel::Warn, &[json!("ignored level")]);
    page.console().call(LogLevel::Error, &[json!("checkout failed")]);

    tokio::time::sleep(Duration::from_millis(49)).await;
    assert!(sink.reports().is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].trigger, CONSOLE_TRIGGER);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.reports().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_burst_is_not_coalesced() {
    let (bus, sink) = bus_with_sink();
    let page = Arc::new(PageEnvironment::builder().build());
    let _tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(bus)
        .with_console_auto_reporting([LogLevel::Error])
        .build()
        .unwrap();

    for i in 0..3 {
        page.console().call(LogLevel::Error, &[json!(i)]);
    }
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(sink.reports().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_triggers_ignored_without_auto_report() {
    let (bus, sink) = bus_with_sink();
    let page = Arc::new(PageEnvironment::builder().build());
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(bus)
        .build()
        .unwrap();

    page.console().call(LogLevel::Error, &[json!("no auto report")]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(sink.reports().is_empty());
    assert!(tracker.coordinator().console().triggers().is_empty());
}

#[test]
fn test_console_pass_through_keeps_panics() {
    let page = Arc::new(
        PageEnvironment::builder()
            .console(Arc::new(PanickingConsole))
            .build(),
    );
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        page.console().call(LogLevel::Info, &[json!("hello")]);
    }));
    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"console is broken"));
    assert_eq!(tracker.coordinator().console().len(), 1);
}

#[tokio::test]
async fn test_fetch_response_is_returned_unchanged() {
    let page = Arc::new(PageEnvironment::builder().fetch(Arc::new(FakeFetch(200))).build());
    let unwrapped = page.fetch(FetchRequest::get("https://api.example.com")).await.unwrap();

    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();
    let wrapped = page.fetch(FetchRequest::get("https://api.example.com")).await.unwrap();

    assert_eq!(wrapped, unwrapped);
    assert_eq!(tracker.coordinator().network().len(), 1);
}

#[tokio::test]
async fn test_network_flag_toggles_live() {
    let page = Arc::new(PageEnvironment::builder().fetch(Arc::new(FakeFetch(204))).build());
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();
    let coordinator = tracker.coordinator();

    coordinator.set_feature_flags(FeatureFlags {
        capture_network: Some(false),
        capture_rrweb: Some(true),
    });
    page.fetch(FetchRequest::get("https://a.example")).await.unwrap();
    assert!(coordinator.network().is_empty());

    coordinator.set_feature_flags(FeatureFlags::all_enabled());
    page.fetch(FetchRequest::get("https://b.example")).await.unwrap();
    assert_eq!(coordinator.network().len(), 1);
}

#[test]
fn test_replay_starts_once_and_frames_reach_report() {
    let page = Arc::new(PageEnvironment::builder().build());
    let recorder = Arc::new(FakeRecorder::default());
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .with_replay_recorder(recorder.clone())
        .build()
        .unwrap();

    assert!(tracker.coordinator().replay().is_running());
    assert!(!tracker.coordinator().replay().start());

    recorder.emit(json!({"type": 2}));
    recorder.emit(json!({"type": 3}));

    let report = tracker.report_session();
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
    let frames: Vec<_> = report.rrweb.iter().map(|frame| frame.event.clone()).collect();
    assert_eq!(frames, vec![json!({"type": 2}), json!({"type": 3})]);
}

#[test]
fn test_report_restarts_stopped_recorder_once() {
    let recorder = Arc::new(FakeRecorder::default());
    let tracker = create_tracker()
        .with_page(Arc::new(PageEnvironment::builder().build()))
        .with_event_bus(Arc::new(EventBus::empty()))
        .with_replay_recorder(recorder.clone())
        .build()
        .unwrap();
    let replay = tracker.coordinator().replay();
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);

    assert!(replay.stop());
    assert!(!replay.is_running());

    tracker.report_session();
    assert!(replay.is_running());
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 2);

    tracker.report_session();
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_replay_disabled_by_flag() {
    let recorder = Arc::new(FakeRecorder::default());
    let tracker = create_tracker()
        .with_page(Arc::new(PageEnvironment::builder().build()))
        .with_event_bus(Arc::new(EventBus::empty()))
        .with_replay_recorder(recorder.clone())
        .with_feature_flags(FeatureFlags {
            capture_network: None,
            capture_rrweb: Some(false),
        })
        .build()
        .unwrap();

    tracker.report_session();
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_report_is_a_snapshot() {
    let page = Arc::new(PageEnvironment::builder().build());
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();

    page.console().call(LogLevel::Log, &[json!("first")]);
    page.window.dispatch(&HostEvent::Click { target: None });
    let report = tracker.report_session();

    page.console().call(LogLevel::Log, &[json!("second")]);
    page.window.dispatch(&HostEvent::Click { target: None });

    assert_eq!(report.console.len(), 1);
    assert_eq!(report.dom.len(), 1);
    let later = tracker.report_session();
    assert_eq!(later.console.len(), 2);
    assert_eq!(later.dom.len(), 2);
}

#[test]
fn test_manual_hook_and_user() {
    let page = Arc::new(PageEnvironment::builder().build());
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .with_user(UserInfo::with_id("u-1").email("a@example.com"))
        .build()
        .unwrap();

    let report = page.report_session().unwrap();
    assert_eq!(report.trigger, MANUAL_TRIGGER);
    assert_eq!(report.session_id, tracker.session_id());
    assert_eq!(report.user.unwrap().id.as_deref(), Some("u-1"));

    tracker.update_user(UserInfo::with_id("u-2"));
    let report = page.report_session().unwrap();
    assert_eq!(report.user.unwrap().id.as_deref(), Some("u-2"));
}

#[test]
fn test_manual_reporting_disabled_leaves_no_hook() {
    let page = Arc::new(PageEnvironment::builder().build());
    let _tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .with_manual_reporting(false)
        .build()
        .unwrap();

    assert!(page.report_session().is_none());
}

#[tokio::test]
async fn test_delivery_posts_wire_payload() {
    let page = Arc::new(
        PageEnvironment::builder()
            .user_agent("test-agent/1.0")
            .url("https://shop.example.com/cart")
            .build(),
    );
    let transport = RecordingTransport::new(Outcome::Status(201));
    let (bus, sink) = bus_with_sink();
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(bus)
        .with_transport(transport.clone())
        .with_report_endpoint("https://collector.example.com/api/sessions")
        .build()
        .unwrap();

    page.console().call(LogLevel::Error, &[json!("boom")]);
    tracker.report_session();
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    let posted = transport.posted.lock();
    assert_eq!(posted.len(), 1);
    let (endpoint, payload) = &posted[0];
    assert_eq!(endpoint, "https://collector.example.com/api/sessions");
    assert_eq!(payload.id, tracker.session_id());
    assert_eq!(payload.kind, MANUAL_TRIGGER);
    assert_eq!(payload.duration, 0);
    assert_eq!(payload.console_logs.len(), 1);
    assert_eq!(payload.user_agent.as_deref(), Some("test-agent/1.0"));
    assert_eq!(payload.url.as_deref(), Some("https://shop.example.com/cart"));
    assert!(sink.session_errors().is_empty());
}

#[tokio::test]
async fn test_delivery_failures_are_logged_not_raised() {
    for (outcome, expected) in [
        (Outcome::Status(503), "Report delivery failed with status 503"),
        (Outcome::Fail("connection reset"), "connection reset"),
    ] {
        let transport = RecordingTransport::new(outcome);
        let (bus, sink) = bus_with_sink();
        let tracker = create_tracker()
            .with_event_bus(bus)
            .with_transport(transport.clone())
            .with_report_endpoint("https://collector.example.com/api/sessions")
            .build()
            .unwrap();

        let report = tracker.report_session();
        assert_eq!(report.trigger, MANUAL_TRIGGER);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(transport.posted.lock().len(), 1);
        assert_eq!(sink.session_errors(), vec![json!(expected)]);
    }
}

#[test]
fn test_shutdown_restores_page() {
    let console = Arc::new(RecordingConsole::default());
    let page = Arc::new(PageEnvironment::builder().console(console.clone()).build());
    let original_console = page.console.get();
    let original_fetch = page.fetch.get();
    let original_legacy = page.legacy_requests.get();

    let recorder = Arc::new(FakeRecorder::default());
    let tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .with_replay_recorder(recorder)
        .build()
        .unwrap();
    let coordinator = tracker.coordinator().clone();
    assert!(page.window.listener_count() > 0);

    tracker.shutdown().unwrap();

    assert!(page.console.is(&original_console));
    assert!(page.fetch.is(&original_fetch));
    assert!(page.legacy_requests.is(&original_legacy));
    assert_eq!(page.window.listener_count(), 0);
    assert!(page.report_session().is_none());
    assert!(!coordinator.replay().is_running());

    page.console().call(LogLevel::Info, &[json!("after shutdown")]);
    assert!(coordinator.console().is_empty());
    assert_eq!(console.0.lock().len(), 1);
}

#[test]
fn test_stacked_trackers_unwind_in_reverse() {
    let page = Arc::new(PageEnvironment::builder().build());
    let original = page.console.get();

    let first = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();
    let second = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();

    page.console().call(LogLevel::Log, &[json!("seen by both")]);
    assert_eq!(first.coordinator().console().len(), 1);
    assert_eq!(second.coordinator().console().len(), 1);

    second.shutdown().unwrap();
    first.shutdown().unwrap();
    assert!(page.console.is(&original));
}

#[tokio::test]
async fn test_out_of_order_shutdown_leaves_forwarding_wrapper() {
    let console = Arc::new(RecordingConsole::default());
    let page = Arc::new(
        PageEnvironment::builder()
            .console(console.clone())
            .fetch(Arc::new(FakeFetch(200)))
            .build(),
    );

    let first = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();
    let first_coordinator = first.coordinator().clone();
    let second = create_tracker()
        .with_page(page.clone())
        .with_event_bus(Arc::new(EventBus::empty()))
        .build()
        .unwrap();
    let second_console = page.console.get();
    let second_fetch = page.fetch.get();

    first.shutdown().unwrap();

    assert!(page.console.is(&second_console));
    assert!(page.fetch.is(&second_fetch));

    page.console().call(LogLevel::Info, &[json!("after first shutdown")]);
    let response = page.fetch(FetchRequest::get("https://api.example.com")).await.unwrap();

    assert_eq!(response.status, 200);
    assert!(first_coordinator.console().is_empty());
    assert!(first_coordinator.network().is_empty());
    assert_eq!(second.coordinator().console().len(), 1);
    assert_eq!(second.coordinator().network().len(), 1);
    assert_eq!(console.0.lock().len(), 1);

    second.shutdown().unwrap();
    page.console().call(LogLevel::Info, &[json!("after both")]);
    assert_eq!(console.0.lock().len(), 2);
    assert!(first_coordinator.console().is_empty());
}

#[tokio::test]
async fn test_observers_receive_entries_after_emit() {
    let bus = Arc::new(EventBus::empty());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let subscription = bus.subscribe(move |event| {
        seen_clone.lock().push(event.namespace.clone());
    });

    let page = Arc::new(PageEnvironment::builder().build());
    let _tracker = create_tracker()
        .with_page(page.clone())
        .with_event_bus(bus)
        .with_network_logging(false)
        .with_dom_event_logging(false)
        .build()
        .unwrap();

    page.console().call(LogLevel::Info, &[json!("observed")]);
    assert!(seen.lock().is_empty());

    tokio::task::yield_now().await;
    assert_eq!(*seen.lock(), vec!["console".to_string()]);
    assert!(subscription.unsubscribe());
}
