//! The three pluggable sinks a `TransactionPlanner` feeds `(new, old)` configuration pairs into
//! during a walk, and asks to realize their accumulated batch at commit time (§4.6). The core
//! never interprets *what* a delta means for the downstream subsystem — only accumulates the
//! pairs and forwards them.

use crate::error::CoreError;
use crate::types::{AppConfiguration, AppInstance};

/// One of the three downstream subsystems a request's configuration deltas are aggregated into.
pub trait Aggregator {
    /// Clears any pending batch. Must be called before a new request starts accumulating, and
    /// again on any failure path before a retry (§5).
    fn reset(&mut self);

    /// Accumulates the delta contributed by one node. `new_config` is `None` for a deletion;
    /// `old_config` is `None` for a fresh creation.
    fn aggregate(&mut self, new_config: Option<&AppConfiguration>, old_config: Option<&AppConfiguration>);

    /// Realizes the accumulated batch against the underlying subsystem.
    fn commit(&mut self, user: &str, other_app_configs: &[AppInstance]) -> Result<(), CoreError>;

    /// Name used in `CoreError::AggregatorFailed` and tracing spans.
    fn name(&self) -> &'static str;
}
