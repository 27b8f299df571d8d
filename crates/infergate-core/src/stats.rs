//! Custom statistics side channel handed to plugin code

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Key/value statistics emitted by a plugin stage
pub type StatsMap = Map<String, Value>;

type SinkFn = dyn Fn(StatsMap) + Send + Sync;

/// Fire-and-forget statistics sink.
///
/// Cloning is cheap. Emitting never blocks and never fails; a disabled sink
/// drops everything.
#[derive(Clone, Default)]
pub struct StatsSink {
    inner: Option<Arc<SinkFn>>,
}

impl StatsSink {
    /// A sink that discards all statistics
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Forward statistics to a callback
    pub fn from_fn(f: impl Fn(StatsMap) + Send + Sync + 'static) -> Self {
        Self {
            inner: Some(Arc::new(f)),
        }
    }

    /// Forward statistics into an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatsMap>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::from_fn(move |stats| {
            // receiver gone means nobody is collecting
            let _ = tx.send(stats);
        });
        (sink, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn emit(&self, stats: StatsMap) {
        if let Some(f) = &self.inner {
            f(stats);
        }
    }

    /// Emit a JSON object; non-object values are ignored
    pub fn emit_value(&self, value: Value) {
        if let Value::Object(map) = value {
            self.emit(map);
        }
    }
}

impl fmt::Debug for StatsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsSink")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
