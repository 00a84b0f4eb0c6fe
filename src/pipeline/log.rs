//! Log channels handed to the engine and every stage copy.
//!
//! There is no global registry: the engine owns a [`LogChannel`] and derives a
//! child channel per stage copy (`<pipeline-id>/<stage>.<copy>`). Every line
//! goes to an injected [`LogSink`]. The default sink forwards to `tracing`.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::Level;

/// Destination of engine and stage log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, channel_id: &str, level: Level, message: &str);

    /// Text logged on `channel_id` and its children, if this sink keeps any.
    fn text(&self, _channel_id: &str) -> Option<String> {
        None
    }
}

/// Forwards every line to `tracing`, tagged with the channel id.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, channel_id: &str, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(channel = channel_id, "{}", message),
            Level::WARN => tracing::warn!(channel = channel_id, "{}", message),
            Level::INFO => tracing::info!(channel = channel_id, "{}", message),
            Level::DEBUG => tracing::debug!(channel = channel_id, "{}", message),
            _ => tracing::trace!(channel = channel_id, "{}", message),
        }
    }
}

/// Keeps a text copy of every line per channel, then passes it on.
///
/// Used for preview runs, where a failed `prepare_execution()` attaches the
/// buffered text to its error.
pub struct BufferedLogSink {
    inner: Arc<dyn LogSink>,
    lines: Mutex<BTreeMap<String, Vec<String>>>,
}

impl BufferedLogSink {
    pub fn new(inner: Arc<dyn LogSink>) -> Self {
        Self {
            inner,
            lines: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl fmt::Debug for BufferedLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedLogSink")
            .field("channels", &self.lines.lock().len())
            .finish()
    }
}

impl LogSink for BufferedLogSink {
    fn log(&self, channel_id: &str, level: Level, message: &str) {
        self.lines
            .lock()
            .entry(channel_id.to_string())
            .or_default()
            .push(format!("{:<5} {} - {}", level, channel_id, message));
        self.inner.log(channel_id, level, message);
    }

    fn text(&self, channel_id: &str) -> Option<String> {
        let lines = self.lines.lock();
        let child_prefix = format!("{}/", channel_id);
        let mut out = String::new();
        for (id, entries) in lines.iter() {
            if id == channel_id || id.starts_with(&child_prefix) {
                for line in entries {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        Some(out)
    }
}

/// A named handle onto a [`LogSink`].
#[derive(Clone)]
pub struct LogChannel {
    id: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl LogChannel {
    pub fn new(id: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        let id: String = id.into();
        Self {
            id: id.into(),
            sink,
        }
    }

    /// Channel backed by [`TracingSink`].
    pub fn tracing(id: impl Into<String>) -> Self {
        Self::new(id, Arc::new(TracingSink))
    }

    pub fn child(&self, name: impl fmt::Display) -> Self {
        Self {
            id: format!("{}/{}", self.id, name).into(),
            sink: self.sink.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    pub fn text(&self) -> Option<String> {
        self.sink.text(&self.id)
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.sink.log(&self.id, Level::ERROR, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.sink.log(&self.id, Level::WARN, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.sink.log(&self.id, Level::INFO, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.sink.log(&self.id, Level::DEBUG, message.as_ref());
    }
}

impl fmt::Debug for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogChannel({})", self.id)
    }
}
