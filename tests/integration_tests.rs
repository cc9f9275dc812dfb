use async_trait::async_trait;
use bytes::Bytes;
use pluto_es::memory::InMemoryEventStore;
use pluto_es::pubsub::memory::InMemoryPubSub;
use pluto_es::{
    Aggregate, AggregateId, ClientRegistry, ConnectionSettings, Context, Dispatch, Error, Event,
    EventStore, EventStream, ExecuteConfig, GrpcEventStore, Query, SNAPSHOT_CREATED, Store,
    Subscriber, SubscriberConfig, Topics, action_wrapper, snapshot_action_wrapper,
};
use prost::Message;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, PartialEq, prost::Message)]
struct Account {
    #[prost(int64, tag = "1")]
    balance: i64,
    #[prost(uint32, tag = "2")]
    deposits: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Deposited {
    #[prost(int64, tag = "1")]
    amount: i64,
}

fn apply(event: &Event, state: &Account) -> Result<Account, Error> {
    let deposited = event.decode_data::<Deposited>()?;
    Ok(Account {
        balance: state.balance + deposited.amount,
        deposits: state.deposits + 1,
    })
}

mod test_helpers {
    use super::*;

    pub const ENV: &str = "test";

    pub fn create_test_context(events: Arc<dyn EventStore>) -> Context {
        Context::new("ledger", ClientRegistry::single(events))
    }

    pub fn create_invalid_test_context() -> Context {
        let settings = ConnectionSettings::builder()
            .target("http://127.0.0.1:1") // Nothing listens here
            .connect_timeout(Duration::from_millis(200))
            .request_timeout(Duration::from_millis(200))
            .build()
            .expect("Failed to build connection settings");
        let client = GrpcEventStore::connect_lazy(settings).expect("Failed to create client");
        create_test_context(Arc::new(client))
    }

    pub fn subscriber_config() -> SubscriberConfig {
        SubscriberConfig::new(ENV)
            .expect("Failed to build subscriber config")
            .with_receive_retry_interval(Duration::from_millis(10))
    }

    pub fn fast_retries() -> ExecuteConfig {
        ExecuteConfig::default()
            .with_base_delay(1)
            .and_then(|c| c.with_max_delay(5))
            .expect("Failed to build execute config")
    }

    pub async fn deposit(ctx: &Context, id: &str, amount: i64) -> Result<Store<Account>, Error> {
        let id = AggregateId::try_new(id.to_string())?;
        let dispatch = Dispatch::new(id, "deposited", Deposited { amount });
        Store::append_with_retry(ctx, Account::default(), &dispatch, &apply, &fast_retries()).await
    }

    pub fn deposited_event(id: &str, version: u64, amount: i64) -> Event {
        let mut event = Event {
            topic: "deposited".to_string(),
            aggregate: Some(Aggregate {
                id: id.to_string(),
                version,
                ..Default::default()
            }),
            ..Default::default()
        };
        event.encode_data(&Deposited { amount });
        event
    }

    pub async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}

use test_helpers::*;

type OnFirstAppendFn =
    dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send>> + Send + Sync;

/// Event store wrapper that lets a test run a competing write right before the
/// first append reaches the store.
struct RacingEventStore {
    inner: Arc<InMemoryEventStore>,
    on_first_append: Mutex<Option<Box<OnFirstAppendFn>>>,
}

impl RacingEventStore {
    fn new(inner: Arc<InMemoryEventStore>) -> Self {
        Self {
            inner,
            on_first_append: Mutex::new(None),
        }
    }

    fn on_first_append<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        *self.on_first_append.lock().unwrap() = Some(Box::new(move || Box::pin(f())));
    }
}

#[async_trait]
impl EventStore for RacingEventStore {
    async fn list(&self, ctx: &Context, query: Query) -> Result<EventStream, Error> {
        self.inner.list(ctx, query).await
    }

    async fn append(&self, ctx: &Context, event: Event) -> Result<(), Error> {
        let hook = self.on_first_append.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await?;
        }
        self.inner.append(ctx, event).await
    }

    async fn append_snapshot(&self, ctx: &Context, event: Event) -> Result<(), Error> {
        self.inner.append_snapshot(ctx, event).await
    }
}

/// Event store whose appends always lose the race.
struct AlwaysConflictingEventStore {
    inner: InMemoryEventStore,
    appends: AtomicUsize,
    last_append: Mutex<Option<tokio::time::Instant>>,
}

impl AlwaysConflictingEventStore {
    fn new() -> Self {
        Self {
            inner: InMemoryEventStore::new(),
            appends: AtomicUsize::new(0),
            last_append: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EventStore for AlwaysConflictingEventStore {
    async fn list(&self, ctx: &Context, query: Query) -> Result<EventStream, Error> {
        self.inner.list(ctx, query).await
    }

    async fn append(&self, _ctx: &Context, event: Event) -> Result<(), Error> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        *self.last_append.lock().unwrap() = Some(tokio::time::Instant::now());
        Err(Error::Conflict {
            aggregate_id: event.aggregate_id().to_string(),
            version: event.version(),
        })
    }

    async fn append_snapshot(&self, ctx: &Context, event: Event) -> Result<(), Error> {
        self.inner.append_snapshot(ctx, event).await
    }
}

#[tokio::test]
async fn hooks_observe_prior_and_next_state_of_a_delivered_event() {
    let events = Arc::new(InMemoryEventStore::new());
    let ctx = create_test_context(events.clone());

    for amount in [10, 20, 30] {
        deposit(&ctx, "acct-1", amount).await.expect("failed to deposit");
    }
    let store = deposit(&ctx.with_eid("eid-4"), "acct-1", 40)
        .await
        .expect("failed to deposit");
    assert_eq!(store.version, 4);
    assert_eq!(
        store.state,
        Account {
            balance: 100,
            deposits: 4
        }
    );

    let observed = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let observed = observed.clone();
        pluto_es::action::hook(
            move |ctx: Context, _event, prior: Arc<Account>, next: Arc<Account>| {
                let observed = observed.clone();
                async move {
                    observed.lock().unwrap().push((
                        ctx.eid().map(str::to_string),
                        (*prior).clone(),
                        (*next).clone(),
                    ));
                    Ok(())
                }
            },
        )
    };
    let topics = Topics::new().on(
        "deposited",
        action_wrapper(Account::default(), Arc::new(apply), vec![recorder]),
    );

    let broker = Arc::new(InMemoryPubSub::new());
    let subscriber =
        Subscriber::subscribe(&ctx, broker.clone(), "ledger", &topics, &subscriber_config())
            .await
            .expect("failed to subscribe");

    let fourth = events.events("acct-1")[3].clone();
    let id = broker
        .publish("test.deposited", Bytes::from(fourth.encode_to_vec()))
        .expect("failed to publish");
    eventually(|| broker.acked().contains(&id)).await;
    subscriber.shutdown().await;

    let observed = observed.lock().unwrap();
    assert_eq!(
        observed.as_slice(),
        &[(
            Some("eid-4".to_string()),
            Account {
                balance: 60,
                deposits: 3
            },
            Account {
                balance: 100,
                deposits: 4
            },
        )]
    );
}

#[tokio::test]
async fn snapshot_is_taken_on_the_hundredth_event_only() {
    let events = Arc::new(InMemoryEventStore::new());
    let ctx = create_test_context(events.clone());
    for _ in 0..101 {
        deposit(&ctx, "acct-9", 1).await.expect("failed to deposit");
    }

    let topics = Topics::new().on(
        "deposited",
        snapshot_action_wrapper(Account::default(), Arc::new(apply), 100),
    );
    let broker = Arc::new(InMemoryPubSub::new());
    let subscriber =
        Subscriber::subscribe(&ctx, broker.clone(), "snapshots", &topics, &subscriber_config())
            .await
            .expect("failed to subscribe");

    let stored = events.events("acct-9");
    let hundredth = broker
        .publish("test.deposited", Bytes::from(stored[99].encode_to_vec()))
        .expect("failed to publish");
    let hundred_first = broker
        .publish("test.deposited", Bytes::from(stored[100].encode_to_vec()))
        .expect("failed to publish");
    eventually(|| {
        let acked = broker.acked();
        acked.contains(&hundredth) && acked.contains(&hundred_first)
    })
    .await;
    subscriber.shutdown().await;

    let snapshots = events.snapshots("acct-9");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].topic, SNAPSHOT_CREATED);
    assert_eq!(snapshots[0].version(), 100);
    assert_eq!(
        snapshots[0]
            .decode_data::<Account>()
            .expect("unable to decode snapshot"),
        Account {
            balance: 100,
            deposits: 100
        }
    );
}

#[tokio::test]
async fn malformed_and_invalid_messages_are_nacked() {
    let events = Arc::new(InMemoryEventStore::new());
    let ctx = create_test_context(events.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let counting = {
        let calls = calls.clone();
        pluto_es::action::hook(move |_ctx, _event, _prior: Arc<Account>, _next| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    let topics = Topics::new().on(
        "deposited",
        action_wrapper(Account::default(), Arc::new(apply), vec![counting]),
    );
    let broker = Arc::new(InMemoryPubSub::new().without_redelivery());
    let subscriber =
        Subscriber::subscribe(&ctx, broker.clone(), "ledger", &topics, &subscriber_config())
            .await
            .expect("failed to subscribe");

    let malformed = broker
        .publish("test.deposited", Bytes::from_static(&[0x0a, 0xff, 0xff]))
        .expect("failed to publish");
    let without_aggregate = broker
        .publish(
            "test.deposited",
            Bytes::from(Event::default().encode_to_vec()),
        )
        .expect("failed to publish");
    eventually(|| {
        let nacked = broker.nacked();
        nacked.contains(&malformed) && nacked.contains(&without_aggregate)
    })
    .await;
    subscriber.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(broker.acked().is_empty());
    assert_eq!(events.list_calls(), 0);
}

#[tokio::test]
async fn retries_on_append_version_mismatch() {
    let events = Arc::new(InMemoryEventStore::new());
    let ctx = create_test_context(events.clone());
    deposit(&ctx, "acct-2", 42).await.unwrap();
    deposit(&ctx, "acct-2", 24).await.unwrap();

    let racing = Arc::new(RacingEventStore::new(events.clone()));
    let store_for_hook = events.clone();
    let ctx_for_hook = ctx.clone();
    racing.on_first_append(move || async move {
        store_for_hook
            .append(&ctx_for_hook, deposited_event("acct-2", 3, 100))
            .await
    });

    let racing_ctx = create_test_context(racing);
    match deposit(&racing_ctx, "acct-2", 1).await {
        Ok(store) => {
            assert_eq!(store.version, 4);
            assert_eq!(store.state.balance, 167);
            let versions = events
                .events("acct-2")
                .iter()
                .map(Event::version)
                .collect::<Vec<_>>();
            assert_eq!(versions, vec![1, 2, 3, 4]);
        }
        other => panic!("Unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn dispatch_fails_after_max_retries() {
    let conflicting = Arc::new(AlwaysConflictingEventStore::new());
    let ctx = create_test_context(conflicting.clone());

    match deposit(&ctx, "acct-3", 1).await {
        Err(Error::MaxRetriesExceeded {
            aggregate_id,
            max_retries,
        }) => {
            assert_eq!(max_retries, ExecuteConfig::default().max_retries());
            assert_eq!(aggregate_id, "acct-3");
        }
        other => panic!("Expected dispatch to fail with max retries, got: {:?}", other),
    }
    assert_eq!(
        conflicting.appends.load(Ordering::SeqCst),
        ExecuteConfig::default().max_retries() as usize + 1
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retry_budget_returns_without_a_final_backoff() {
    let conflicting = Arc::new(AlwaysConflictingEventStore::new());
    let ctx = create_test_context(conflicting.clone());
    let config = ExecuteConfig::default()
        .with_max_retries(2)
        .and_then(|c| c.with_max_delay(60_000))
        .and_then(|c| c.with_base_delay(60_000))
        .expect("Failed to build execute config");
    let dispatch = Dispatch::new(
        AggregateId::try_new("acct-3".to_string()).unwrap(),
        "deposited",
        Deposited { amount: 1 },
    );

    let result =
        Store::append_with_retry(&ctx, Account::default(), &dispatch, &apply, &config).await;
    let returned_at = tokio::time::Instant::now();

    assert!(matches!(result, Err(Error::MaxRetriesExceeded { .. })));
    assert_eq!(conflicting.appends.load(Ordering::SeqCst), 3);
    let last_append = (*conflicting.last_append.lock().unwrap()).expect("no append recorded");
    assert_eq!(returned_at - last_append, Duration::ZERO);
}

#[tokio::test]
async fn read_error_returned_from_dispatch() {
    let ctx = create_invalid_test_context();

    match deposit(&ctx, "acct-4", 1).await {
        Err(Error::Transport(_)) | Err(Error::Status(_)) => {}
        other => panic!("Expected a transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn subscription_survives_broker_outage() {
    let events = Arc::new(InMemoryEventStore::new());
    let ctx = create_test_context(events.clone());
    deposit(&ctx, "acct-5", 5).await.unwrap();

    let topics = Topics::new().on(
        "Deposited",
        action_wrapper(Account::default(), Arc::new(apply), Vec::new()),
    );
    let broker = Arc::new(InMemoryPubSub::new());
    broker.fail_next_receives(3);
    let subscriber =
        Subscriber::subscribe(&ctx, broker.clone(), "ledger", &topics, &subscriber_config())
            .await
            .expect("failed to subscribe");
    assert_eq!(subscriber.subscriptions(), ["test.ledger.deposited"]);

    let first = events.events("acct-5")[0].clone();
    let id = broker
        .publish("test.deposited", Bytes::from(first.encode_to_vec()))
        .expect("failed to publish");
    eventually(|| broker.acked().contains(&id)).await;
    subscriber.shutdown().await;

    assert!(broker.receive_calls() >= 4);
}

#[test]
fn subscriber_config_validates_inputs() {
    match SubscriberConfig::new(" ") {
        Err(Error::InvalidConfig { message, parameter }) => {
            assert_eq!(message, "environment cannot be empty");
            assert_eq!(parameter, Some("environment".to_string()));
        }
        other => panic!("Expected InvalidConfig error, got {:?}", other),
    }

    match subscriber_config().with_max_outstanding_messages(0) {
        Err(Error::InvalidConfig { parameter, .. }) => {
            assert_eq!(parameter, Some("max_outstanding_messages".to_string()));
        }
        other => panic!("Expected InvalidConfig error, got {:?}", other),
    }

    let config = subscriber_config();
    assert_eq!(config.environment(), ENV);
    assert_eq!(config.ack_deadline(), Duration::from_secs(20));
}
