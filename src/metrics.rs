//! Minimal metrics facade.
//!
//! The registry a node ships metrics to is an external collaborator (see the
//! Non-goals); this module only standardizes the call sites, mirroring
//! `ckb_metrics`'s `metrics!(gauge, ...)` / `metrics!(counter, ...)` macros
//! so the rest of the crate doesn't hardcode a particular backend. Disabled
//! builds of the embedder simply never install a [`Sink`] and every call
//! becomes a no-op.

use std::sync::OnceLock;

/// A destination for freezer metrics. Implement this in the embedding node
/// and call [`set_sink`] once at startup.
pub trait Sink: Send + Sync + 'static {
    /// Record an absolute value, e.g. on-disk byte totals.
    fn gauge(&self, name: &str, value: i64);
    /// Record a monotonically increasing count, e.g. bytes read.
    fn counter(&self, name: &str, value: u64);
}

static SINK: OnceLock<Box<dyn Sink>> = OnceLock::new();

/// Installs the process-wide metrics sink. Only the first call wins.
pub fn set_sink(sink: impl Sink) {
    let _ = SINK.set(Box::new(sink));
}

pub(crate) fn gauge(name: &str, value: i64) {
    if let Some(sink) = SINK.get() {
        sink.gauge(name, value);
    }
}

pub(crate) fn counter(name: &str, value: u64) {
    if let Some(sink) = SINK.get() {
        sink.counter(name, value);
    }
}
