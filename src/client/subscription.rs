//! Per-consumer date subscription.
//!
//! A [`DateSubscription`] binds one consumer callback to at most one date
//! topic on the shared connection. The topic follows whatever date the
//! consumer last passed to [`set_date`](DateSubscription::set_date); the
//! callback can be swapped at any time without leaving the topic, and the
//! newest one is always the one invoked.
//!
//! Switching dates deregisters the old filtered handler before a new one is
//! registered, so a payload for the old date can never reach the consumer
//! after the switch. Dropping the subscription leaves its topic.
//!
//! Failures never reach the consumer. Without a stored credential the
//! subscription logs and stays idle.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::connection::{Connection, ConnectionManager, HandlerId, UpdateHandler};
use crate::topic::TopicDate;
use crate::transport::message::UpdatePayload;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct ActiveTopic {
    topic: TopicDate,
    connection: Arc<Connection>,
    handler: HandlerId,
    live: Arc<AtomicBool>,
}

pub struct DateSubscription<T> {
    manager: Arc<ConnectionManager>,
    callback: Arc<RwLock<Callback<T>>>,
    active: Option<ActiveTopic>,
    _data: PhantomData<fn(T)>,
}

impl<T: DeserializeOwned + 'static> DateSubscription<T> {
    /// Creates an idle subscription. Nothing is joined until a date is set.
    pub fn new(manager: Arc<ConnectionManager>, on_update: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            manager,
            callback: Arc::new(RwLock::new(Arc::new(on_update))),
            active: None,
            _data: PhantomData,
        }
    }

    /// Creates a subscription already pointed at `date`.
    pub fn for_date(
        manager: Arc<ConnectionManager>,
        date: impl Into<TopicDate>,
        on_update: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        let mut subscription = Self::new(manager, on_update);
        subscription.set_date(Some(date));
        subscription
    }

    /// Replaces the consumer callback. The topic is left untouched.
    pub fn set_callback(&self, on_update: impl Fn(T) + Send + Sync + 'static) {
        *self
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(on_update);
    }

    /// Points the subscription at `date`, or idles it with `None`.
    ///
    /// Dates with the same canonical form as the current topic are a no-op.
    pub fn set_date<D: Into<TopicDate>>(&mut self, date: Option<D>) {
        let next: Option<TopicDate> = date.map(Into::into);
        if next == self.topic() {
            return;
        }

        self.teardown();

        if let Some(topic) = next {
            self.join(topic);
        }
    }

    fn join(&mut self, topic: TopicDate) {
        let connection = match self.manager.ensure_authenticated_and_connected() {
            Ok(connection) => connection,
            Err(e) => {
                error!("live updates for {topic} unavailable: {e}");
                return;
            }
        };

        let live = Arc::new(AtomicBool::new(true));
        let handler = filtered_handler::<T>(topic, self.callback.clone(), live.clone());

        connection.join(&topic);
        let handler = connection.on_update(handler);
        debug!("subscribed to {topic}");

        self.active = Some(ActiveTopic {
            topic,
            connection,
            handler,
            live,
        });
    }
}

impl<T> DateSubscription<T> {
    /// The topic currently joined, if any.
    pub fn topic(&self) -> Option<TopicDate> {
        self.active.as_ref().map(|a| a.topic)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Leaves the current topic. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            active.live.store(false, Ordering::SeqCst);
            active.connection.off_update(active.handler);
            active.connection.leave(&active.topic);
            debug!("unsubscribed from {}", active.topic);
        }
    }
}

impl<T> Drop for DateSubscription<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn filtered_handler<T: DeserializeOwned + 'static>(
    topic: TopicDate,
    callback: Arc<RwLock<Callback<T>>>,
    live: Arc<AtomicBool>,
) -> UpdateHandler {
    Arc::new(move |payload: &UpdatePayload<Value>| {
        if !live.load(Ordering::SeqCst) || !topic.matches(&payload.date) {
            return;
        }
        let data = match serde_json::from_value::<T>(payload.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                warn!("dropping update for {topic}: {e}");
                return;
            }
        };
        let current = callback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        current(data);
    })
}
