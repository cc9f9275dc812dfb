//! Actions bound to delivered events.
//!
//! An [`Action`] is what the subscription runner invokes for each event of a
//! topic. The wrappers here turn a domain apply function into actions: the
//! plain wrapper rebuilds the state before and after the delivered event and
//! hands both to business hooks, the snapshot wrapper decides whether the
//! delivered event is due for a snapshot.
//!
//! # Examples
//!
//! ```rust
//! use pluto_es::action::{Topics, action_wrapper, apply_fn, hook, snapshot_action_wrapper};
//! use pluto_es::{Error, Event};
//! use std::sync::Arc;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Account {
//!     #[prost(int64, tag = "1")]
//!     balance: i64,
//! }
//!
//! let apply = apply_fn(|event: &Event, state: &Account| -> Result<Account, Error> {
//!     Ok(Account { balance: state.balance + event.version() as i64 })
//! });
//!
//! let notify = hook(|_ctx, _event, prior: Arc<Account>, next: Arc<Account>| async move {
//!     if next.balance < prior.balance {
//!         return Err(Error::domain("balance went down"));
//!     }
//!     Ok(())
//! });
//!
//! let topics = Topics::new()
//!     .on("deposited", action_wrapper(Account::default(), apply.clone(), vec![notify]))
//!     .on("deposited", snapshot_action_wrapper(Account::default(), apply, 100));
//! assert_eq!(topics.actions("deposited").len(), 2);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Error;
use crate::event::{AggregateId, Event};
use crate::snapshot::{is_snapshot_time, take_snapshot};
use crate::store::Store;

/// Handler invoked for every delivered event of the topics it is bound to.
pub type Action =
    Arc<dyn Fn(Context, Arc<Event>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Business rule run after the delivered event applied cleanly.
///
/// Receives the state before the event and the state after it.
pub type Hook<S> = Arc<
    dyn Fn(Context, Arc<Event>, Arc<S>, Arc<S>) -> BoxFuture<'static, Result<(), Error>>
        + Send
        + Sync,
>;

/// Domain transition function shared by the wrappers.
pub type ApplyFn<S> = Arc<dyn Fn(&Event, &S) -> Result<S, Error> + Send + Sync>;

/// Resolves which aggregate a delivered event belongs to.
pub type ExtractId = Arc<dyn Fn(&Event) -> Result<AggregateId, Error> + Send + Sync>;

pub fn action<F, Fut>(f: F) -> Action
where
    F: Fn(Context, Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx, event| Box::pin(f(ctx, event)))
}

pub fn hook<S, F, Fut>(f: F) -> Hook<S>
where
    F: Fn(Context, Arc<Event>, Arc<S>, Arc<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx, event, prior, next| Box::pin(f(ctx, event, prior, next)))
}

pub fn apply_fn<S, F>(f: F) -> ApplyFn<S>
where
    F: Fn(&Event, &S) -> Result<S, Error> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps `apply` and `hooks` into an action keyed on the event's own
/// aggregate id.
pub fn action_wrapper<S>(initial: S, apply: ApplyFn<S>, hooks: Vec<Hook<S>>) -> Action
where
    S: Clone + Send + Sync + 'static,
{
    action_wrapper_with(Arc::new(Event::validate), initial, apply, hooks)
}

/// Like [`action_wrapper`], with the aggregate id resolved by `extract_id`.
///
/// For each event: reject it if it is structurally invalid, replay
/// `[1, version - 1]` into the prior state, apply the event to get the next
/// state, then run the hooks in order. The first hook failure stops the
/// remaining hooks and is returned.
pub fn action_wrapper_with<S>(
    extract_id: ExtractId,
    initial: S,
    apply: ApplyFn<S>,
    hooks: Vec<Hook<S>>,
) -> Action
where
    S: Clone + Send + Sync + 'static,
{
    let hooks: Arc<[Hook<S>]> = hooks.into();
    Arc::new(move |ctx, event| {
        let extract_id = extract_id.clone();
        let initial = initial.clone();
        let apply = apply.clone();
        let hooks = hooks.clone();

        Box::pin(async move {
            event.validate()?;
            let id = extract_id(&event)?;
            let version = event.version();

            // Version 1 has no history: an upper bound of 0 would mean unbounded.
            let mut store = Store::new(initial);
            if version > 1 {
                store = store.with_range(1, version - 1);
                store.load_events(&ctx, &id, &*apply).await?;
            }

            let prior = Arc::new(store.state.clone());
            store.apply(&event, &*apply)?;
            let next = Arc::new(store.state);

            for (index, hook) in hooks.iter().enumerate() {
                let outcome = hook(ctx.clone(), event.clone(), prior.clone(), next.clone()).await;
                if let Err(e) = outcome {
                    tracing::warn!(
                        parent: ctx.span(),
                        aggregate_id = %id,
                        version,
                        hook = index,
                        error = %e,
                        "hook failed"
                    );
                    return Err(e);
                }
            }
            Ok(())
        })
    })
}

/// Action that snapshots the aggregate whenever the delivered event's version
/// is a multiple of `factor`, and does nothing otherwise.
pub fn snapshot_action_wrapper<S>(initial: S, apply: ApplyFn<S>, factor: i64) -> Action
where
    S: prost::Message + Clone + Send + Sync + 'static,
{
    Arc::new(move |ctx, event| {
        let initial = initial.clone();
        let apply = apply.clone();

        Box::pin(async move {
            event.validate()?;
            if !is_snapshot_time(&event, factor) {
                return Ok(());
            }
            take_snapshot(&ctx, &event, initial, &*apply).await
        })
    })
}

/// Runs `actions` one after the other. The first failure stops the rest.
pub async fn run_actions(
    ctx: &Context,
    actions: &[Action],
    event: Arc<Event>,
) -> Result<(), Error> {
    for action in actions {
        action(ctx.clone(), event.clone()).await?;
    }
    Ok(())
}

/// Routing table from topic to the actions it triggers, in registration order.
#[derive(Clone, Default)]
pub struct Topics {
    routes: BTreeMap<String, Vec<Action>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `action` to the actions of `topic`. Topics are matched
    /// case-insensitively, as their broker names are lower-cased.
    pub fn on(mut self, topic: impl AsRef<str>, action: Action) -> Self {
        self.routes
            .entry(topic.as_ref().to_lowercase())
            .or_default()
            .push(action);
        self
    }

    pub fn actions(&self, topic: &str) -> &[Action] {
        self.routes
            .get(&topic.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Topics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(topic, actions)| (topic, actions.len())))
            .finish()
    }
}
