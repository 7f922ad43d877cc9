//! Tests for the restartable event stream
//!
//! These tests drive [`EventStream`] with a scripted feed that injects
//! subscription and read failures on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{PodEvent, PodEventKind, Scope};

/// One step of a scripted subscription
enum Step {
    Event(PodEvent),
    Fail(WatchError),
}

/// Feed that hands out scripted subscriptions in order
///
/// Once the script runs out, subscriptions stay open without producing
/// events.
#[derive(Default)]
struct ScriptedFeed {
    sessions: Mutex<VecDeque<Result<Vec<Step>, WatchError>>>,
    subscribed_scopes: Mutex<Vec<Scope>>,
    open: Arc<AtomicUsize>,
}

impl ScriptedFeed {
    fn new(sessions: Vec<Result<Vec<Step>, WatchError>>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            ..Default::default()
        })
    }

    fn subscribe_calls(&self) -> usize {
        self.subscribed_scopes.lock().unwrap().len()
    }

    fn open_subscriptions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodFeed for ScriptedFeed {
    async fn subscribe(&self, scope: &Scope) -> Result<Box<dyn PodSubscription>, WatchError> {
        self.subscribed_scopes.lock().unwrap().push(scope.clone());
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()));

        let steps = session?;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSubscription {
            steps: steps.into(),
            open: Arc::clone(&self.open),
        }))
    }
}

struct ScriptedSubscription {
    steps: VecDeque<Step>,
    open: Arc<AtomicUsize>,
}

impl Drop for ScriptedSubscription {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodSubscription for ScriptedSubscription {
    async fn next_event(&mut self) -> Result<PodEvent, WatchError> {
        match self.steps.pop_front() {
            Some(Step::Event(event)) => Ok(event),
            Some(Step::Fail(error)) => Err(error),
            None => std::future::pending().await,
        }
    }
}

fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("apps".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn scope() -> Scope {
    Scope::Namespace("apps".to_string())
}

fn subscribe_error() -> WatchError {
    WatchError::Subscribe {
        scope: scope(),
        message: "connection refused".to_string(),
    }
}

async fn open_stream(feed: Arc<ScriptedFeed>, cancel: CancellationToken) -> EventStream {
    EventStream::open(feed, scope(), ReconnectPolicy::immediate(), cancel)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_initial_subscribe_failure_is_returned() {
    let feed = ScriptedFeed::new(vec![Err(subscribe_error())]);

    let result = EventStream::open(
        feed.clone(),
        scope(),
        ReconnectPolicy::immediate(),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(result.err(), Some(subscribe_error()));
    assert_eq!(feed.subscribe_calls(), 1);
    assert_eq!(feed.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_events_delivered_in_order() {
    let feed = ScriptedFeed::new(vec![Ok(vec![
        Step::Event(PodEvent::added(pod("a"))),
        Step::Event(PodEvent::modified(pod("b"))),
    ])]);
    let mut stream = open_stream(feed.clone(), CancellationToken::new()).await;
    assert_eq!(stream.state(), ConnectionState::Connected);

    let first = stream.next().await.unwrap();
    let second = stream.next().await.unwrap();

    assert_eq!((first.kind, first.pod_name()), (PodEventKind::Added, "a"));
    assert_eq!((second.kind, second.pod_name()), (PodEventKind::Modified, "b"));
    assert_eq!(stream.state(), ConnectionState::Connected);
    assert_eq!(stream.reconnects(), 0);
}

#[tokio::test]
async fn test_read_error_reopens_same_scope() {
    let feed = ScriptedFeed::new(vec![
        Ok(vec![
            Step::Event(PodEvent::modified(pod("before"))),
            Step::Fail(WatchError::Stream("connection reset".to_string())),
        ]),
        Ok(vec![Step::Event(PodEvent::modified(pod("after")))]),
    ]);
    let mut stream = open_stream(feed.clone(), CancellationToken::new()).await;

    assert_eq!(stream.next().await.unwrap().pod_name(), "before");
    assert_eq!(stream.next().await.unwrap().pod_name(), "after");

    assert_eq!(stream.reconnects(), 1);
    assert_eq!(feed.subscribe_calls(), 2);
    assert!(feed
        .subscribed_scopes
        .lock()
        .unwrap()
        .iter()
        .all(|s| *s == scope()));
    // The broken subscription was closed before the new one was opened
    assert_eq!(feed.open_subscriptions(), 1);
}

#[tokio::test]
async fn test_stream_end_and_status_errors_are_transient() {
    let feed = ScriptedFeed::new(vec![
        Ok(vec![Step::Fail(WatchError::Ended)]),
        Ok(vec![Step::Fail(WatchError::Status {
            code: 410,
            reason: "Expired".to_string(),
            message: "too old resource version".to_string(),
        })]),
        Ok(vec![Step::Event(PodEvent::deleted(pod("gone")))]),
    ]);
    let mut stream = open_stream(feed.clone(), CancellationToken::new()).await;

    let event = stream.next().await.unwrap();

    assert_eq!(event.kind, PodEventKind::Deleted);
    assert_eq!(stream.reconnects(), 2);
    assert_eq!(feed.open_subscriptions(), 1);
}

#[tokio::test]
async fn test_failed_reopen_is_retried() {
    let feed = ScriptedFeed::new(vec![
        Ok(vec![Step::Fail(WatchError::Ended)]),
        Err(subscribe_error()),
        Err(subscribe_error()),
        Ok(vec![Step::Event(PodEvent::modified(pod("recovered")))]),
    ]);
    let mut stream = open_stream(feed.clone(), CancellationToken::new()).await;

    assert_eq!(stream.next().await.unwrap().pod_name(), "recovered");
    assert_eq!(feed.subscribe_calls(), 4);
    assert_eq!(stream.reconnects(), 1);
}

#[tokio::test]
async fn test_cancel_while_reading_closes_subscription() {
    let feed = ScriptedFeed::new(vec![Ok(vec![])]);
    let cancel = CancellationToken::new();
    let mut stream = open_stream(feed.clone(), cancel.clone()).await;

    let reader = tokio::spawn(async move {
        let event = stream.next().await;
        (event.is_none(), stream.state())
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(feed.open_subscriptions(), 1);
    cancel.cancel();

    let (ended, state) = reader.await.unwrap();
    assert!(ended);
    assert_eq!(state, ConnectionState::Disconnected);
    assert_eq!(feed.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let feed = ScriptedFeed::new(vec![Ok(vec![Step::Fail(WatchError::Ended)])]);
    let cancel = CancellationToken::new();
    let policy = ReconnectPolicy {
        initial_backoff: Duration::from_secs(3600),
        max_backoff: Duration::from_secs(3600),
        jitter: Duration::ZERO,
    };
    let mut stream = EventStream::open(feed.clone(), scope(), policy, cancel.clone())
        .await
        .unwrap();

    let reader = tokio::spawn(async move { stream.next().await.is_none() });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("stream did not observe cancellation")
        .unwrap();
    assert!(ended);
    assert_eq!(feed.subscribe_calls(), 1);
    assert_eq!(feed.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_cancelled_before_read_returns_none() {
    let feed = ScriptedFeed::new(vec![Ok(vec![Step::Event(PodEvent::modified(pod("a")))])]);
    let cancel = CancellationToken::new();
    let mut stream = open_stream(feed.clone(), cancel.clone()).await;

    cancel.cancel();

    assert!(stream.next().await.is_none());
    assert_eq!(feed.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_health_tracks_reconnects() {
    let feed = ScriptedFeed::new(vec![
        Ok(vec![Step::Fail(WatchError::Ended)]),
        Err(subscribe_error()),
        Ok(vec![Step::Event(PodEvent::modified(pod("a")))]),
    ]);
    let health = HealthRegistry::new();
    let component = components::watcher(&scope());
    health.register(&component).await;

    let mut stream = open_stream(feed, CancellationToken::new())
        .await
        .with_health(health.clone());

    assert!(stream.next().await.is_some());
    let report = health.health().await;
    assert_eq!(report.components[&component].status, ComponentStatus::Healthy);
}

#[tokio::test]
async fn test_quiet_reconnect_restores_health() {
    let feed = ScriptedFeed::new(vec![Ok(vec![Step::Fail(WatchError::Ended)]), Ok(vec![])]);
    let health = HealthRegistry::new();
    let component = components::watcher(&scope());
    health.register(&component).await;

    let mut stream = open_stream(feed.clone(), CancellationToken::new())
        .await
        .with_health(health.clone());

    // The second session never yields, so the read stays pending after the reopen
    let read = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(read.is_err());

    assert_eq!(feed.subscribe_calls(), 2);
    assert_eq!(feed.open_subscriptions(), 1);
    assert_eq!(stream.reconnects(), 1);
    let report = health.health().await;
    assert_eq!(report.components[&component].status, ComponentStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_event() {
    let feed = ScriptedFeed::new(vec![
        Ok(vec![Step::Fail(WatchError::Ended)]),
        Ok(vec![
            Step::Event(PodEvent::modified(pod("first"))),
            Step::Fail(WatchError::Ended),
        ]),
        Ok(vec![Step::Event(PodEvent::modified(pod("second")))]),
    ]);
    let policy = ReconnectPolicy {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(10),
        jitter: Duration::ZERO,
    };
    let mut stream = EventStream::open(feed.clone(), scope(), policy, CancellationToken::new())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(stream.next().await.unwrap().pod_name(), "first");
    let first_wait = started.elapsed();

    let started = tokio::time::Instant::now();
    assert_eq!(stream.next().await.unwrap().pod_name(), "second");
    let second_wait = started.elapsed();

    assert!(first_wait >= Duration::from_millis(100));
    assert!(first_wait < Duration::from_millis(200));
    // A doubled delay would be 200ms
    assert!(second_wait >= Duration::from_millis(100));
    assert!(second_wait < Duration::from_millis(200));
    assert_eq!(stream.reconnects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_across_failed_reopens() {
    let feed = ScriptedFeed::new(vec![
        Ok(vec![Step::Fail(WatchError::Ended)]),
        Err(subscribe_error()),
        Ok(vec![Step::Event(PodEvent::modified(pod("recovered")))]),
    ]);
    let policy = ReconnectPolicy {
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(10),
        jitter: Duration::ZERO,
    };
    let mut stream = EventStream::open(feed, scope(), policy, CancellationToken::new())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert!(stream.next().await.is_some());

    // 100ms before the failed reopen, then 200ms before the successful one
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(300));
    assert!(waited < Duration::from_millis(400));
}

#[tokio::test]
async fn test_dropping_stream_closes_subscription() {
    let feed = ScriptedFeed::new(vec![Ok(vec![])]);
    let stream = open_stream(feed.clone(), CancellationToken::new()).await;
    assert_eq!(feed.open_subscriptions(), 1);

    drop(stream);
    assert_eq!(feed.open_subscriptions(), 0);
}
