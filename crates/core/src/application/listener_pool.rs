// Listener Pool - one QueueListener per endpoint

use super::listener::{ListenerSettings, QueueListener};
use crate::error::Result;
use crate::port::QueueTransport;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

/// Registry sharing listeners between routes that read the same queue
#[derive(Default)]
pub struct ListenerPool {
    listeners: Mutex<HashMap<String, Arc<QueueListener>>>,
}

impl ListenerPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<QueueListener>>> {
        self.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return the listener for `endpoint`, creating it on first use
    ///
    /// The first caller's settings win. A later caller asking for different
    /// settings gets the existing listener and a warning.
    ///
    /// # Errors
    /// Whatever `make_transport` returns; nothing is registered in that case.
    pub fn get_or_create<F>(
        &self,
        endpoint: &str,
        settings: ListenerSettings,
        make_transport: F,
    ) -> Result<Arc<QueueListener>>
    where
        F: FnOnce() -> Result<Arc<dyn QueueTransport>>,
    {
        let mut listeners = self.lock();
        if let Some(existing) = listeners.get(endpoint) {
            if existing.settings() != &settings {
                warn!(
                    endpoint = %endpoint,
                    kept = ?existing.settings(),
                    ignored = ?settings,
                    "Listener settings differ between routes, keeping the first"
                );
            }
            return Ok(Arc::clone(existing));
        }

        let transport = make_transport()?;
        let listener = QueueListener::new(endpoint, settings, transport);
        listeners.insert(endpoint.to_string(), Arc::clone(&listener));
        info!(endpoint = %endpoint, "Listener created");
        Ok(listener)
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<QueueListener>> {
        self.lock().get(endpoint).cloned()
    }

    pub fn all(&self) -> Vec<Arc<QueueListener>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn start_all(&self) {
        for listener in self.all() {
            listener.start();
        }
    }

    pub fn stop_all(&self) {
        for listener in self.all() {
            listener.stop();
        }
    }

    /// Drain every listener concurrently; returns the total still pending
    pub async fn shutdown_all(&self, max_wait: Duration) -> usize {
        let listeners = self.all();
        join_all(listeners.iter().map(|l| l.shutdown(max_wait)))
            .await
            .into_iter()
            .sum()
    }
}
