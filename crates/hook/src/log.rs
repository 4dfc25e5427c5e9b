//! The optional plugin log stream.

use std::cell::RefCell;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};

use camino::Utf8Path;

/// Line-oriented diagnostic sink for a single hook invocation.
///
/// The OCI runtime discards the hook's stdout/stderr on success, so sites
/// point an environment variable at a file to see what the hook did.  When
/// no file is configured this is a no-op.  Every line is also emitted as a
/// `tracing` debug event.  The stream is flushed after each line and when
/// the value is dropped.
pub struct HookLog {
    sink: RefCell<Option<Box<dyn Write>>>,
}

impl std::fmt::Debug for HookLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookLog")
            .field("enabled", &self.sink.borrow().is_some())
            .finish()
    }
}

impl Default for HookLog {
    fn default() -> Self {
        Self::disabled()
    }
}

impl HookLog {
    /// A log which discards everything.
    pub fn disabled() -> Self {
        Self {
            sink: RefCell::new(None),
        }
    }

    /// Truncate and open `path` for writing.
    pub fn open(path: &Utf8Path) -> std::io::Result<Self> {
        let f = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(f)))
    }

    /// Log to an arbitrary writer.
    pub fn from_writer(w: impl Write + 'static) -> Self {
        Self {
            sink: RefCell::new(Some(Box::new(w))),
        }
    }

    /// Append a line.  Write errors are ignored.
    pub fn line(&self, msg: impl Display) {
        tracing::debug!("{msg}");
        if let Some(w) = self.sink.borrow_mut().as_mut() {
            let _ = writeln!(w, "{msg}");
            let _ = w.flush();
        }
    }
}
