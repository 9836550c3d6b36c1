// Supervisor - builds routes from configuration and runs their lifecycle

use crate::config::{Config, RouteConfig};
use crate::registry;
use anyhow::{Context, Result};
use futures::future::join_all;
use reactor_core::application::{ListenerPool, Route};
use reactor_core::port::LogSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Every running route, the listeners they share and the record sink
pub struct Supervisor {
    pool: ListenerPool,
    routes: Vec<Arc<Route>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl Supervisor {
    /// Build all routes; a route that fails to build is logged and skipped
    ///
    /// # Errors
    /// Only when the log stream cannot be opened.
    pub fn build(config: &Config, hostname: &str) -> Result<Self> {
        let sink = registry::build_sink(config.log_stream.as_ref())?;
        let mut supervisor = Self {
            pool: ListenerPool::new(),
            routes: Vec::new(),
            sink,
        };

        for (index, route_config) in config.routes.iter().enumerate() {
            match supervisor.add_route(route_config, hostname) {
                Ok(route) => info!(
                    index,
                    route_id = %route.id(),
                    url = %route_config.url,
                    cmd = %route_config.cmd,
                    "Route ready"
                ),
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!(index, url = %route_config.url, error = %reason, "Route skipped");
                }
            }
        }
        Ok(supervisor)
    }

    fn add_route(&mut self, config: &RouteConfig, hostname: &str) -> Result<Arc<Route>> {
        config.validate()?;
        let executor = registry::build_executor(config)?;
        let listener = self
            .pool
            .get_or_create(&config.endpoint(), config.listener_settings()?, || {
                registry::build_transport(config)
            })
            .context("failed to create listener")?;

        let route = Route::new(
            config.route_settings()?,
            executor,
            self.sink.clone(),
            hostname,
        );
        listener.subscribe(Arc::clone(&route));
        self.routes.push(Arc::clone(&route));
        Ok(route)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn listener_count(&self) -> usize {
        self.pool.len()
    }

    pub fn pool(&self) -> &ListenerPool {
        &self.pool
    }

    /// Start route workers first, then the listeners that feed them
    pub fn start(&self) {
        for route in &self.routes {
            route.start();
        }
        self.pool.start_all();
        info!(
            routes = self.routes.len(),
            listeners = self.pool.len(),
            "Supervisor started"
        );
    }

    /// Ordered shutdown: stop polling, drain, exit routes, close the sink
    ///
    /// Returns the number of messages still pending when the drain gave up.
    pub async fn shutdown(self, max_wait: Duration) -> usize {
        self.pool.stop_all();
        let pending = self.pool.shutdown_all(max_wait).await;
        if pending > 0 {
            warn!(pending, "Messages left for redelivery");
        }

        join_all(self.routes.iter().map(|route| route.exit())).await;

        if let Some(sink) = &self.sink {
            sink.exit();
        }
        info!("Supervisor stopped");
        pending
    }
}
