//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use occupi_rtc::channel::EventSink;
use occupi_rtc::token::FixedClock;
use occupi_rtc::{
    AccessToken, ChannelClient, CountSnapshotFetcher, CountSource, CounterConsumer,
    CounterSubscriptionManager, CounterUpdate, MemoryTokenStore, Result, SyncError, TokenMinter,
    TokenProvider, Transport, TransportEvent, TransportSession,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const TOPIC: &str = "occupi-counter";

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
}

pub fn yesterday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
}

/// Let spawned dispatcher and watcher tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Poll until `check` holds, yielding between attempts
pub async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Session that counts the commands it receives
#[derive(Default)]
pub struct FakeSession {
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub closes: AtomicUsize,
}

impl TransportSession for FakeSession {
    fn subscribe(&self, _topic: &str) -> Result<()> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that fires events on demand
#[derive(Default)]
pub struct FakeTransport {
    pub session: Arc<FakeSession>,
    opens: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    sink: Mutex<Option<EventSink>>,
    hold: AtomicBool,
    release: Notify,
    fail_next: AtomicBool,
}

impl FakeTransport {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.session.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.session.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.session.closes.load(Ordering::SeqCst)
    }

    /// Tokens each open was called with
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    /// Block opens until `release_opens`
    pub fn hold_opens(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_opens(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().clone() {
            // Dispatcher is gone after a disconnect
            let _ = sink.send(event);
        }
    }

    pub fn publish(&self, data: serde_json::Value) {
        self.emit(TransportEvent::Publication {
            topic: TOPIC.to_string(),
            data,
        });
    }

    pub fn publish_count(&self, count: u64) {
        self.publish(json!({ "counter": count }));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, token: &AccessToken, events: EventSink) -> Result<Arc<dyn TransportSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(token.value.clone());

        while self.hold.load(Ordering::SeqCst) {
            let released = self.release.notified();
            if !self.hold.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Transport("connection refused".into()));
        }

        *self.sink.lock() = Some(events);
        Ok(self.session.clone())
    }
}

/// Minter that counts calls
pub struct CountingMinter {
    calls: AtomicUsize,
    token: Mutex<std::result::Result<String, String>>,
}

impl CountingMinter {
    pub fn ok(token: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            token: Mutex::new(Ok(token.to_string())),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            token: Mutex::new(Err(message.to_string())),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenMinter for CountingMinter {
    async fn mint_token(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.token.lock().clone().map_err(SyncError::Connection)
    }
}

/// Count endpoint with a fixed answer that can be held open
#[derive(Default)]
pub struct FakeCountSource {
    count: Mutex<Option<u64>>,
    calls: AtomicUsize,
    hold: AtomicBool,
    release: Notify,
}

impl FakeCountSource {
    pub fn returning(count: u64) -> Arc<Self> {
        let source = Self::default();
        *source.count.lock() = Some(count);
        Arc::new(source)
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl CountSource for FakeCountSource {
    async fn current_count(&self) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        while self.hold.load(Ordering::SeqCst) {
            let released = self.release.notified();
            if !self.hold.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        (*self.count.lock()).ok_or_else(|| SyncError::Api {
            status: 500,
            message: "count unavailable".into(),
        })
    }
}

/// A manager wired to fakes
pub struct Harness {
    pub manager: CounterSubscriptionManager,
    pub transport: Arc<FakeTransport>,
    pub minter: Arc<CountingMinter>,
    pub counts: Arc<FakeCountSource>,
    pub store: Arc<MemoryTokenStore>,
}

impl Harness {
    /// Fresh process: no cached token
    pub fn new(counts: Arc<FakeCountSource>) -> Self {
        Self::build(Arc::new(MemoryTokenStore::new()), CountingMinter::ok("fresh-token"), counts)
    }

    pub fn build(
        store: Arc<MemoryTokenStore>,
        minter: Arc<CountingMinter>,
        counts: Arc<FakeCountSource>,
    ) -> Self {
        let transport = Arc::new(FakeTransport::default());

        let tokens = TokenProvider::with_clock(store.clone(), minter.clone(), Arc::new(FixedClock(today())));
        let manager = CounterSubscriptionManager::new(
            tokens,
            ChannelClient::new(transport.clone()),
            CountSnapshotFetcher::new(counts.clone(), Duration::from_secs(5)),
            TOPIC,
        );

        Self {
            manager,
            transport,
            minter,
            counts,
            store,
        }
    }
}

/// Drain every queued update
pub fn drain(consumer: &mut CounterConsumer) -> Vec<CounterUpdate> {
    let mut updates = Vec::new();
    while let Some(update) = consumer.try_next_update() {
        updates.push(update);
    }
    updates
}

/// Counter values among the updates, in order
pub fn values(updates: &[CounterUpdate]) -> Vec<u64> {
    updates
        .iter()
        .filter_map(|update| match update {
            CounterUpdate::Snapshot(n) | CounterUpdate::Live(n) => Some(*n),
            CounterUpdate::Status(_) => None,
        })
        .collect()
}
