// Output sinks for live step output and dumps.
// The default discards everything; the CLI wires process stdout/stderr and
// tests use an in-memory buffer they can inspect after the run.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

enum SinkKind {
    Discard,
    Writer(Box<dyn Write + Send>),
    Buffer(Vec<u8>),
}

/// A cheaply-cloneable, thread-safe output sink.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<SinkKind>>,
}

impl SharedSink {
    /// A sink that swallows all output.
    pub fn discard() -> Self {
        Self { inner: Arc::new(Mutex::new(SinkKind::Discard)) }
    }

    /// Wrap an arbitrary writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self { inner: Arc::new(Mutex::new(SinkKind::Writer(Box::new(writer)))) }
    }

    /// An in-memory buffer, readable via [`SharedSink::buffered_string`].
    pub fn buffer() -> Self {
        Self { inner: Arc::new(Mutex::new(SinkKind::Buffer(Vec::new()))) }
    }

    pub fn write_str(&self, s: &str) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            SinkKind::Discard => {}
            SinkKind::Writer(w) => {
                let _ = w.write_all(s.as_bytes());
                let _ = w.flush();
            }
            SinkKind::Buffer(buf) => buf.extend_from_slice(s.as_bytes()),
        }
    }

    /// The buffered contents, if this is a buffer sink.
    pub fn buffered_string(&self) -> Option<String> {
        match &*self.inner.lock() {
            SinkKind::Buffer(buf) => Some(String::from_utf8_lossy(buf).into_owned()),
            _ => None,
        }
    }
}

impl Default for SharedSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl std::fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSink")
    }
}
