// Route - one subscription bound to one command executor
//
// A route owns a small hand-off channel, `concurrency` worker tasks and a
// pacing gate. Workers report every outcome back to the listener's
// PendingTracker.

use super::constants::ROUTE_CHANNEL_CAPACITY;
use super::execution_log::ExecutionLog;
use super::pacing::PaceGate;
use super::pending::PendingTracker;
use super::shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::{QueueMessage, RouteId, RouteSettings};
use crate::port::{CommandExecutor, ExecutionError, LogSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static NEXT_ROUTE_ID: AtomicU64 = AtomicU64::new(1);

/// Why a message could not be handed to a route
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Route {0} is stopped")]
    Stopped(RouteId),
}

/// A message on its way to a worker, with the tracker that must hear back
pub struct Delivery {
    pub msg: Arc<QueueMessage>,
    pub tracker: Arc<PendingTracker>,
}

/// Dispatcher for one configured route
pub struct Route {
    id: RouteId,
    settings: RouteSettings,
    executor: Arc<dyn CommandExecutor>,
    sink: Option<Arc<dyn LogSink>>,
    hostname: String,
    pace: PaceGate,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
    stop_tx: ShutdownSender,
    stop: ShutdownToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tid: AtomicU64,
}

impl Route {
    /// Build a route; workers start with [`Route::start`]
    ///
    /// # Arguments
    /// * `settings` - label, worker count and pace interval
    /// * `executor` - command runner, also the route's filter
    /// * `sink` - destination of execution records, `None` disables them
    /// * `hostname` - stamped on every execution record
    pub fn new(
        settings: RouteSettings,
        executor: Arc<dyn CommandExecutor>,
        sink: Option<Arc<dyn LogSink>>,
        hostname: impl Into<String>,
    ) -> Arc<Self> {
        let id = RouteId::new(NEXT_ROUTE_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(ROUTE_CHANNEL_CAPACITY);
        let (stop_tx, stop) = shutdown_channel();
        let pace = PaceGate::new(settings.pace_interval);

        info!(
            route_id = %id,
            label = %settings.label,
            concurrency = settings.concurrency,
            pace_interval = ?settings.pace_interval,
            "Route created"
        );

        Arc::new(Self {
            id,
            settings,
            executor,
            sink,
            hostname: hostname.into(),
            pace,
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            stop_tx,
            stop,
            workers: Mutex::new(Vec::new()),
            tid: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> RouteId {
        self.id
    }

    pub fn settings(&self) -> &RouteSettings {
        &self.settings
    }

    pub fn concurrency(&self) -> usize {
        self.settings.concurrency
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_shutdown()
    }

    /// Filter check delegated to the executor
    ///
    /// # Errors
    /// - ExecutionError::NotApplicable when the message is not for this route
    pub fn match_conditions(&self, msg: &QueueMessage) -> Result<(), ExecutionError> {
        self.executor.match_conditions(msg)
    }

    /// Spawn the worker tasks (idempotent)
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() {
            return;
        }
        for worker in 0..self.settings.concurrency {
            let route = Arc::clone(self);
            workers.push(tokio::spawn(async move { route.worker_loop(worker).await }));
        }
        debug!(route_id = %self.id, workers = workers.len(), "Route workers started");
    }

    /// Hand a message to a worker, waiting while every worker is busy
    ///
    /// # Errors
    /// - DeliveryError::Stopped if the route stopped before a worker took it
    pub async fn deliver(&self, delivery: Delivery) -> Result<(), DeliveryError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(sender) = sender else {
            return Err(DeliveryError::Stopped(self.id));
        };
        if self.stop.is_shutdown() {
            return Err(DeliveryError::Stopped(self.id));
        }

        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop.wait() => Err(DeliveryError::Stopped(self.id)),
            sent = sender.send(delivery) => sent.map_err(|_| DeliveryError::Stopped(self.id)),
        }
    }

    /// Refuse new deliveries and release queued ones; running work finishes
    pub fn stop(&self) {
        if !self.stop_tx.is_shutdown() {
            info!(route_id = %self.id, "Route stopping");
            self.stop_tx.shutdown();
        }
    }

    /// Stop, close the channel and wait for in-flight work
    ///
    /// The executor exits alongside the workers, so its grace period bounds
    /// how long a running command can hold this up.
    pub async fn exit(&self) {
        self.stop();
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        let (results, ()) =
            tokio::join!(futures::future::join_all(handles), self.executor.exit());
        for result in results {
            if let Err(e) = result {
                error!(route_id = %self.id, error = %e, "Route worker ended abnormally");
            }
        }
        info!(route_id = %self.id, "Route exited");
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            };
            let Some(delivery) = next else { break };
            self.process(delivery).await;
        }
        debug!(route_id = %self.id, worker, "Route worker finished");
    }

    /// Pace, run, then report the outcome to the tracker
    ///
    /// Deliveries still queued when the route stops are released as failed
    /// so the queue redelivers them; nothing new starts after `stop`.
    async fn process(&self, delivery: Delivery) {
        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop.wait() => {}
            _ = self.pace.wait() => {}
        }
        if self.stop.is_shutdown() {
            debug!(
                route_id = %self.id,
                message_id = %delivery.msg.id(),
                "Route stopped, leaving message for redelivery"
            );
            delivery.tracker.done(delivery.msg.token(), false);
            return;
        }

        let tid = self.tid.fetch_add(1, Ordering::Relaxed) + 1;
        let log = Arc::new(ExecutionLog::with_optional_sink(
            self.sink.clone(),
            &self.hostname,
            self.id.get(),
            tid,
        ));
        log.set_hash(delivery.msg.id());

        // Run on its own task so a panicking executor fails the message
        // instead of killing the worker
        let executor = Arc::clone(&self.executor);
        let msg = Arc::clone(&delivery.msg);
        let task_log = Arc::clone(&log);
        let result = match tokio::spawn(async move { executor.run(&task_log, &msg).await }).await
        {
            Ok(result) => result,
            Err(e) => {
                error!(route_id = %self.id, error = %e, "Executor task panicked");
                Err(ExecutionError::IoError(format!("executor task failed: {e}")))
            }
        };

        let ok = match &result {
            Ok(()) => true,
            Err(e) if e.is_not_applicable() => true,
            Err(e) => {
                warn!(
                    route_id = %self.id,
                    tid,
                    message_id = %delivery.msg.id(),
                    error = %e,
                    "Execution failed"
                );
                false
            }
        };

        delivery.tracker.done(delivery.msg.token(), ok);
        log.done(result.as_ref().err());
    }
}
