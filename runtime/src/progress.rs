//! Human-readable progress output.
//!
//! Progress text goes to a caller-supplied writer and never affects the
//! outcome of an operation; write failures are ignored.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

/// Clonable line sink for progress messages.
#[derive(Clone)]
pub struct ProgressWriter {
    inner: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl ProgressWriter {
    /// Write progress to `writer`.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    /// Discard progress.
    pub fn sink() -> Self {
        Self { inner: None }
    }

    /// Progress to standard error.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    pub fn line(&self, message: impl AsRef<str>) {
        if let Some(ref inner) = self.inner {
            let mut writer = inner.lock();
            let _ = writeln!(writer, "{}", message.as_ref());
            let _ = writer.flush();
        }
    }
}

impl Default for ProgressWriter {
    fn default() -> Self {
        Self::sink()
    }
}

impl std::fmt::Debug for ProgressWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressWriter")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}
