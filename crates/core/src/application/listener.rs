// Queue Listener - one poll loop per queue endpoint, shared by its routes

use super::constants::{
    DEFAULT_MAX_MESSAGES, DEFAULT_WAIT_SECONDS, LISTENER_SHUTDOWN_POLL_INTERVAL,
    TRANSPORT_ERROR_BACKOFF,
};
use super::limiter::ConcurrencyLimiter;
use super::pending::PendingTracker;
use super::route::{Delivery, Route};
use super::shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::{QueueMessage, RouteId, SENT_TIMESTAMP_ATTRIBUTE};
use crate::port::{QueueTransport, ReceiveRequest, TransportError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a message matched by several routes is handed out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Routes are fed one after another from the poll loop
    #[default]
    Blocking,
    /// Each route gets its own task, bounded by the listener's limiter
    NonBlocking,
}

/// Polling behavior of a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub max_messages: usize,
    pub wait_seconds: u64,
    pub delivery: DeliveryMode,
    pub error_backoff: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            wait_seconds: DEFAULT_WAIT_SECONDS,
            delivery: DeliveryMode::Blocking,
            error_backoff: TRANSPORT_ERROR_BACKOFF,
        }
    }
}

/// Poller for one queue endpoint fanning messages out to its routes
pub struct QueueListener {
    endpoint: String,
    settings: ListenerSettings,
    transport: Arc<dyn QueueTransport>,
    routes: RwLock<BTreeMap<RouteId, Arc<Route>>>,
    tracker: Arc<PendingTracker>,
    limiter: Arc<ConcurrencyLimiter>,
    stop_tx: ShutdownSender,
    stop: ShutdownToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueListener {
    pub fn new(
        endpoint: impl Into<String>,
        settings: ListenerSettings,
        transport: Arc<dyn QueueTransport>,
    ) -> Arc<Self> {
        let endpoint = endpoint.into();
        let tracker = Arc::new(PendingTracker::new(endpoint.clone(), Arc::clone(&transport)));
        let (stop_tx, stop) = shutdown_channel();
        Arc::new(Self {
            endpoint,
            settings,
            transport,
            routes: RwLock::new(BTreeMap::new()),
            tracker,
            limiter: Arc::new(ConcurrencyLimiter::new(0)),
            stop_tx,
            stop,
            poll_task: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_shutdown()
    }

    /// Bind a route (replacing one with the same id) and resize the limiter
    pub fn subscribe(&self, route: Arc<Route>) {
        let id = route.id();
        self.write_routes().insert(id, route);
        self.update_concurrency();
        info!(endpoint = %self.endpoint, route_id = %id, "Route subscribed");
    }

    /// Unbind a route and resize the limiter
    pub fn unsubscribe(&self, id: RouteId) -> Option<Arc<Route>> {
        let removed = self.write_routes().remove(&id);
        if removed.is_some() {
            self.update_concurrency();
            info!(endpoint = %self.endpoint, route_id = %id, "Route unsubscribed");
        }
        removed
    }

    /// Snapshot of the bound routes in id order
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<RouteId, Arc<Route>>> {
        self.routes.write().unwrap_or_else(|p| p.into_inner())
    }

    fn update_concurrency(&self) {
        let total: usize = self.routes().iter().map(|r| r.concurrency()).sum();
        self.limiter.set_capacity(total);
        info!(endpoint = %self.endpoint, total_concurrency = total, "Listener concurrency updated");
    }

    /// Spawn the poll loop (idempotent)
    pub fn start(self: &Arc<Self>) {
        let mut task = self.poll_task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() || self.stop.is_shutdown() {
            return;
        }
        let listener = Arc::clone(self);
        *task = Some(tokio::spawn(async move { listener.poll_loop().await }));
        info!(endpoint = %self.endpoint, "Listener started");
    }

    async fn poll_loop(self: Arc<Self>) {
        let request = ReceiveRequest {
            endpoint: self.endpoint.clone(),
            max_messages: self.settings.max_messages,
            wait_seconds: self.settings.wait_seconds,
            attribute_names: vec![SENT_TIMESTAMP_ATTRIBUTE.to_string()],
        };
        let mut stop = self.stop.clone();

        while !stop.is_shutdown() {
            match self.transport.receive(&request).await {
                Ok(batch) => {
                    for received in batch {
                        let msg = received.into_message(&self.endpoint);
                        self.deliver(msg).await;
                    }
                }
                Err(e) => {
                    error!(
                        endpoint = %self.endpoint,
                        error = %e,
                        backoff = ?self.settings.error_backoff,
                        "Receive failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                        _ = stop.wait() => break,
                    }
                }
            }
        }
        info!(endpoint = %self.endpoint, "Listener poll loop stopped");
    }

    /// Fan one message out to every matching route
    ///
    /// All references are registered before the first hand-off so an early
    /// completion can never delete the message under a later route.
    /// Returns the number of matching routes; zero means it was deleted.
    pub async fn deliver(&self, msg: QueueMessage) -> usize {
        let msg = Arc::new(msg);
        let matched: Vec<Arc<Route>> = self
            .routes()
            .into_iter()
            .filter(|route| route.match_conditions(&msg).is_ok())
            .collect();

        if matched.is_empty() {
            warn!(
                endpoint = %self.endpoint,
                message_id = %msg.id(),
                body = %String::from_utf8_lossy(msg.body()),
                "Message matched no route, deleting"
            );
            self.tracker.delete(msg.token()).await;
            return 0;
        }

        let count = matched.len();
        self.tracker.add_many(msg.token(), count);
        debug!(endpoint = %self.endpoint, message_id = %msg.id(), routes = count, "Delivering message");

        match self.settings.delivery {
            DeliveryMode::Blocking => {
                for route in matched {
                    hand_off(&route, Arc::clone(&msg), Arc::clone(&self.tracker)).await;
                }
            }
            DeliveryMode::NonBlocking => {
                let mut stop = self.stop.clone();
                for route in matched {
                    let permit = tokio::select! {
                        permit = self.limiter.acquire() => permit,
                        _ = stop.wait() => {
                            self.tracker.done(msg.token(), false);
                            continue;
                        }
                    };
                    let msg = Arc::clone(&msg);
                    let tracker = Arc::clone(&self.tracker);
                    tokio::spawn(async move {
                        let _permit = permit;
                        hand_off(&route, msg, tracker).await;
                    });
                }
            }
        }
        count
    }

    /// Extend the message's visibility by 10% of `visibility`
    ///
    /// # Errors
    /// - TransportError::ExtendVisibility if the transport rejects it
    pub async fn keep_alive(
        &self,
        msg: &QueueMessage,
        visibility: Duration,
    ) -> Result<(), TransportError> {
        self.tracker.keep_alive(msg.token(), visibility).await
    }

    /// Stop polling after the current batch
    pub fn stop(&self) {
        if !self.stop_tx.is_shutdown() {
            info!(endpoint = %self.endpoint, "Listener stopping");
            self.stop_tx.shutdown();
        }
    }

    /// Stop, then wait up to `max_wait` for pending messages to finish
    ///
    /// Returns the number of messages still pending (0 on a clean drain).
    pub async fn shutdown(&self, max_wait: Duration) -> usize {
        self.stop();
        let deadline = Instant::now() + max_wait;

        let handle = self.poll_task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(endpoint = %self.endpoint, error = %e, "Poll loop failed"),
                Err(_) => {
                    warn!(endpoint = %self.endpoint, "Poll loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        loop {
            let pending = self.tracker.pending_count();
            if pending == 0 {
                info!(endpoint = %self.endpoint, "Listener drained");
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    endpoint = %self.endpoint,
                    pending,
                    "Timeout waiting for pending messages"
                );
                return pending;
            }
            let step = LISTENER_SHUTDOWN_POLL_INTERVAL.min(deadline - now);
            tokio::time::sleep(step).await;
        }
    }
}

/// Deliver to one route, failing the reference if the route refuses it
async fn hand_off(route: &Route, msg: Arc<QueueMessage>, tracker: Arc<PendingTracker>) {
    let token = msg.token().clone();
    let delivery = Delivery {
        msg,
        tracker: Arc::clone(&tracker),
    };
    if let Err(e) = route.deliver(delivery).await {
        warn!(route_id = %route.id(), error = %e, "Delivery refused");
        tracker.done(&token, false);
    }
}
