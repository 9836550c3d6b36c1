// Pipeline constants (no magic values in the pipeline code)
use std::time::Duration;

/// Messages requested per receive call
pub const DEFAULT_MAX_MESSAGES: usize = 10;

/// Long-poll wait of a receive call (seconds)
pub const DEFAULT_WAIT_SECONDS: u64 = 15;

/// Sleep after a failed receive before polling again
pub const TRANSPORT_ERROR_BACKOFF: Duration = Duration::from_secs(15);

/// Upper bound a listener waits for pending messages on shutdown
pub const LISTENER_SHUTDOWN_CEILING: Duration = Duration::from_secs(120);

/// How often shutdown re-checks the pending count
pub const LISTENER_SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Computed pacing sleeps at or below this are skipped
pub const PACING_SKIP_THRESHOLD: Duration = Duration::from_secs(1);

/// Default hard limit on a command's run time
pub const DEFAULT_MAX_CMD_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Time an executor gives running processes on exit before killing them
pub const EXECUTOR_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for running processes on exit
pub const EXECUTOR_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Keep-alive extends visibility by this percentage of the current timeout
pub const KEEP_ALIVE_EXTENSION_PERCENT: u128 = 10;

/// Capacity of a route's delivery channel (hand-off, not a buffer)
pub const ROUTE_CHANNEL_CAPACITY: usize = 1;
